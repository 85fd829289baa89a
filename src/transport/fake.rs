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

//! In-memory transport.
//!
//! `FakeTransport` behaves like a well-mannered radio stack whose peers are
//! scripted by the caller. Every call is recorded in a journal, and every
//! stream it hands out records its own release, so callers can check exactly
//! what the session asked of the transport and in which order.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{self, Stream, StreamExt};
use parking_lot::Mutex;
use pin_project_lite::pin_project;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use super::{BleTransport, LinkEvent, LinkStream, ScanStream, StatusStream, ValueStream};
use crate::model::{
    BleStatus, CharacteristicKey, ConnectionPriority, DeviceId, DiscoveredDevice,
    DiscoveredService, ScanFilter,
};

/// Largest MTU the fake stack accepts.
pub const MAX_MTU: u16 = 517;

/// How a scripted peer answers a connect request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectBehavior {
    /// Link comes up immediately.
    #[default]
    Accept,
    /// `connect` itself fails.
    Reject(String),
    /// The link stream reports an error instead of connecting.
    Drop(String),
    /// Nothing happens until the caller pushes link events.
    Manual,
}

pin_project! {
    /// Stream wrapper that runs a callback when the stream is released.
    pub struct Tracked<S> {
        #[pin]
        inner: S,
        on_release: Option<Box<dyn FnOnce() + Send>>,
    }

    impl<S> PinnedDrop for Tracked<S> {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            if let Some(release) = this.on_release.take() {
                release();
            }
        }
    }
}

impl<S> Tracked<S> {
    pub fn new(inner: S, on_release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner,
            on_release: Some(Box::new(on_release)),
        }
    }
}

impl<S: Stream> Stream for Tracked<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.project().inner.poll_next(cx)
    }
}

#[derive(Default)]
struct FakeState {
    connect: HashMap<DeviceId, ConnectBehavior>,
    links: HashMap<DeviceId, mpsc::UnboundedSender<Result<LinkEvent>>>,
    reads: HashMap<CharacteristicKey, std::result::Result<Vec<u8>, String>>,
    writes: Vec<(CharacteristicKey, Vec<u8>, bool)>,
    notifiers: HashMap<CharacteristicKey, Vec<mpsc::UnboundedSender<Result<Vec<u8>>>>>,
    subscribe_failures: HashMap<CharacteristicKey, String>,
    services: HashMap<DeviceId, std::result::Result<Vec<DiscoveredService>, String>>,
    failures: HashMap<&'static str, String>,
    stalled: HashSet<&'static str>,
    scan_results: Vec<DiscoveredDevice>,
    status: BleStatus,
    status_observers: Vec<mpsc::UnboundedSender<BleStatus>>,
}

/// Scriptable in-memory [`BleTransport`].
#[derive(Clone, Default)]
pub struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
    journal: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let fake = Self::default();
        fake.state.lock().status = BleStatus::Ready;
        fake
    }

    /// Every call and stream release, in order.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().clone()
    }

    /// Number of journal entries equal to `entry`.
    pub fn count(&self, entry: &str) -> usize {
        self.journal.lock().iter().filter(|e| *e == entry).count()
    }

    pub fn clear_journal(&self) {
        self.journal.lock().clear();
    }

    fn record(&self, entry: String) {
        self.journal.lock().push(entry);
    }

    fn releaser(&self, entry: String) -> impl FnOnce() + Send + 'static {
        let journal = self.journal.clone();
        move || journal.lock().push(entry)
    }

    pub fn set_connect_behavior(&self, device_id: impl Into<DeviceId>, behavior: ConnectBehavior) {
        self.state.lock().connect.insert(device_id.into(), behavior);
    }

    /// Push a link event to the pending link of `device_id`.
    /// Returns false if nobody is listening any more.
    pub fn push_link(&self, device_id: &DeviceId, event: LinkEvent) -> bool {
        let state = self.state.lock();
        match state.links.get(device_id) {
            Some(tx) => tx.unbounded_send(Ok(event)).is_ok(),
            None => false,
        }
    }

    pub fn set_read(&self, key: CharacteristicKey, value: std::result::Result<Vec<u8>, String>) {
        self.state.lock().reads.insert(key, value);
    }

    pub fn writes(&self) -> Vec<(CharacteristicKey, Vec<u8>, bool)> {
        self.state.lock().writes.clone()
    }

    pub fn fail_subscribe(&self, key: CharacteristicKey, reason: impl Into<String>) {
        self.state.lock().subscribe_failures.insert(key, reason.into());
    }

    /// Deliver a value to every live notification stream for `key`.
    pub fn notify(&self, key: &CharacteristicKey, value: &[u8]) -> usize {
        self.send_notification(key, || Ok(value.to_vec()))
    }

    /// Fail every live notification stream for `key`.
    pub fn fail_notifications(&self, key: &CharacteristicKey, reason: &str) -> usize {
        self.send_notification(key, || Err(anyhow!("{}", reason)))
    }

    fn send_notification(
        &self,
        key: &CharacteristicKey,
        item: impl Fn() -> Result<Vec<u8>>,
    ) -> usize {
        let mut state = self.state.lock();
        let Some(senders) = state.notifiers.get_mut(key) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders
            .iter()
            .filter(|tx| tx.unbounded_send(item()).is_ok())
            .count()
    }

    /// Notification streams for `key` that have not been released.
    pub fn live_notification_streams(&self, key: &CharacteristicKey) -> usize {
        self.state
            .lock()
            .notifiers
            .get(key)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    pub fn set_services(
        &self,
        device_id: impl Into<DeviceId>,
        services: std::result::Result<Vec<DiscoveredService>, String>,
    ) {
        self.state.lock().services.insert(device_id.into(), services);
    }

    /// Make the named operation fail with `reason`.
    pub fn fail(&self, operation: &'static str, reason: impl Into<String>) {
        self.state.lock().failures.insert(operation, reason.into());
    }

    /// Make the named operation never complete.
    pub fn stall(&self, operation: &'static str) {
        self.state.lock().stalled.insert(operation);
    }

    pub fn set_scan_results(&self, devices: Vec<DiscoveredDevice>) {
        self.state.lock().scan_results = devices;
    }

    pub fn set_status(&self, status: BleStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state
            .status_observers
            .retain(|tx| tx.unbounded_send(status).is_ok());
    }

    async fn gate(&self, operation: &'static str) -> Result<()> {
        let (stalled, failure) = {
            let state = self.state.lock();
            (
                state.stalled.contains(operation),
                state.failures.get(operation).cloned(),
            )
        };
        if stalled {
            futures::future::pending::<()>().await;
        }
        match failure {
            Some(reason) => Err(anyhow!(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BleTransport for FakeTransport {
    fn backend_name(&self) -> &'static str {
        "fake"
    }

    async fn initialize(&self) -> Result<()> {
        self.record("initialize".to_string());
        self.gate("initialize").await
    }

    async fn scan(&self, filter: &ScanFilter) -> Result<ScanStream> {
        self.record("scan".to_string());
        self.gate("scan").await?;
        let devices: Vec<Result<DiscoveredDevice>> = self
            .state
            .lock()
            .scan_results
            .iter()
            .filter(|device| filter.matches(device))
            .cloned()
            .map(Ok)
            .collect();
        let results = stream::iter(devices).chain(stream::pending());
        Ok(Tracked::new(results, self.releaser("stop scan".to_string())).boxed())
    }

    async fn connect(&self, device_id: &DeviceId, _timeout: Duration) -> Result<LinkStream> {
        self.record(format!("connect {}", device_id));
        let behavior = self
            .state
            .lock()
            .connect
            .get(device_id)
            .cloned()
            .unwrap_or_default();

        let (tx, rx) = mpsc::unbounded();
        match behavior {
            ConnectBehavior::Reject(reason) => return Err(anyhow!(reason)),
            ConnectBehavior::Accept => {
                let _ = tx.unbounded_send(Ok(LinkEvent::Connected));
            }
            ConnectBehavior::Drop(reason) => {
                let _ = tx.unbounded_send(Err(anyhow!(reason)));
            }
            ConnectBehavior::Manual => {}
        }
        self.state.lock().links.insert(device_id.clone(), tx);
        let release = self.releaser(format!("release link {}", device_id));
        Ok(Tracked::new(rx, release).boxed())
    }

    async fn disconnect(&self, device_id: &DeviceId) -> Result<()> {
        self.record(format!("disconnect {}", device_id));
        if let Some(tx) = self.state.lock().links.remove(device_id) {
            let _ = tx.unbounded_send(Ok(LinkEvent::Disconnected { reason: None }));
        }
        self.gate("disconnect").await
    }

    async fn discover_services(&self, device_id: &DeviceId) -> Result<Vec<DiscoveredService>> {
        self.record(format!("discover {}", device_id));
        self.gate("discover_services").await?;
        let services = self.state.lock().services.get(device_id).cloned();
        match services {
            Some(Ok(services)) => Ok(services),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Ok(Vec::new()),
        }
    }

    async fn read_characteristic(&self, key: &CharacteristicKey) -> Result<Vec<u8>> {
        self.record(format!("read {}", key));
        self.gate("read").await?;
        let value = self.state.lock().reads.get(key).cloned();
        match value {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("Characteristic {} not found", key.characteristic)),
        }
    }

    async fn write_characteristic(
        &self,
        key: &CharacteristicKey,
        value: &[u8],
        with_response: bool,
    ) -> Result<()> {
        self.record(format!("write {}", key));
        self.gate("write").await?;
        self.state
            .lock()
            .writes
            .push((key.clone(), value.to_vec(), with_response));
        Ok(())
    }

    async fn subscribe_notifications(&self, key: &CharacteristicKey) -> Result<ValueStream> {
        self.record(format!("subscribe {}", key));
        self.gate("subscribe").await?;
        let mut state = self.state.lock();
        if let Some(reason) = state.subscribe_failures.get(key) {
            return Err(anyhow!("{}", reason));
        }
        let (tx, rx) = mpsc::unbounded();
        state.notifiers.entry(key.clone()).or_default().push(tx);
        let release = self.releaser(format!("cancel {}", key));
        Ok(Tracked::new(rx, release).boxed())
    }

    async fn negotiate_mtu(&self, device_id: &DeviceId, size: u16) -> Result<u16> {
        self.record(format!("mtu {} {}", device_id, size));
        self.gate("negotiate_mtu").await?;
        Ok(size.min(MAX_MTU))
    }

    async fn request_connection_priority(
        &self,
        device_id: &DeviceId,
        priority: ConnectionPriority,
    ) -> Result<()> {
        self.record(format!("priority {} {}", device_id, priority.code()));
        self.gate("request_connection_priority").await
    }

    async fn clear_gatt_cache(&self, device_id: &DeviceId) -> Result<()> {
        self.record(format!("clear cache {}", device_id));
        self.gate("clear_gatt_cache").await
    }

    async fn observe_status(&self) -> Result<StatusStream> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        let _ = tx.unbounded_send(state.status);
        state.status_observers.push(tx);
        Ok(rx.boxed())
    }
}
