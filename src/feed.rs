// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fan-out event feeds.
//!
//! A [`Feed`] delivers every published item to every observer attached at the
//! time of publishing, in publish order. Observers that join late see only
//! what is published after they joined. Items are never dropped for a live
//! observer; observers whose receiver was dropped are pruned on the next
//! publish.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Receiving end of a feed. Implements `futures::Stream`.
pub type FeedReceiver<T> = async_channel::Receiver<T>;

/// A multi-observer broadcast channel without replay.
pub struct Feed<T> {
    name: &'static str,
    observers: Arc<Mutex<Vec<async_channel::Sender<T>>>>,
}

impl<T> Clone for Feed<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            observers: self.observers.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Feed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("name", &self.name)
            .field("observers", &self.observers.lock().len())
            .finish()
    }
}

impl<T: Clone> Feed<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            observers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attach a new observer.
    pub fn subscribe(&self) -> FeedReceiver<T> {
        let (tx, rx) = async_channel::unbounded();
        self.observers.lock().push(tx);
        rx
    }

    /// Deliver an item to every live observer. Returns how many received it.
    pub fn publish(&self, item: T) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(|tx| tx.try_send(item.clone()).is_ok());
        trace!("{} feed: delivered to {} observer(s)", self.name, observers.len());
        observers.len()
    }

    pub fn observer_count(&self) -> usize {
        let mut observers = self.observers.lock();
        observers.retain(|tx| !tx.is_closed());
        observers.len()
    }
}
