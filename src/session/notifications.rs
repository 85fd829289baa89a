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

//! Notification subscription registry.
//!
//! At most one live subscription per characteristic key. Each subscription is
//! a forwarding task that owns the transport stream; cancelling the task drops
//! the stream. Replacing a subscription waits for the old task to finish before
//! the new stream is requested, so stale and fresh values never interleave.

use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::feed::{Feed, FeedReceiver};
use crate::model::{CharacteristicKey, CharacteristicValue, OperationResult, ValueOrigin};
use crate::transport::{BleTransport, ValueStream};

struct ActiveSubscription {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl ActiveSubscription {
    /// Cancel and wait until the transport stream has been dropped.
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("Subscription task {} panicked", self.id);
            }
        }
    }

    fn is_live(&self) -> bool {
        !self.handle.is_finished()
    }
}

#[derive(Default)]
struct Slot {
    active: Option<ActiveSubscription>,
}

type SharedSlot = Arc<AsyncMutex<Slot>>;

/// Owns every notification subscription and the characteristic feed.
pub struct SubscriptionRegistry {
    transport: Arc<dyn BleTransport>,
    slots: Mutex<HashMap<CharacteristicKey, SharedSlot>>,
    values: Feed<CharacteristicValue>,
    next_id: AtomicU64,
    setup_timeout: Duration,
}

impl SubscriptionRegistry {
    pub fn new(transport: Arc<dyn BleTransport>, values: Feed<CharacteristicValue>) -> Self {
        Self {
            transport,
            slots: Mutex::new(HashMap::new()),
            values,
            next_id: AtomicU64::new(1),
            setup_timeout: super::connections::DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound for enabling notifications on the transport.
    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    /// Observe characteristic values produced from now on.
    pub fn values(&self) -> FeedReceiver<CharacteristicValue> {
        self.values.subscribe()
    }

    fn slot(&self, key: &CharacteristicKey) -> SharedSlot {
        self.slots.lock().entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, key: &CharacteristicKey) -> Option<SharedSlot> {
        self.slots.lock().get(key).cloned()
    }

    /// Subscribe to notifications, replacing any existing subscription for `key`.
    ///
    /// A setup failure is also published on the characteristic feed.
    pub async fn subscribe(&self, key: &CharacteristicKey) -> SessionResult<()> {
        let slot = self.slot(key);
        let mut guard = slot.lock().await;

        if let Some(old) = guard.active.take() {
            debug!("Replacing subscription {} for {}", old.id, key);
            old.stop().await;
        }

        let setup = tokio::time::timeout(
            self.setup_timeout,
            self.transport.subscribe_notifications(key),
        )
        .await
        .unwrap_or_else(|_| {
            Err(anyhow::anyhow!(
                "Enabling notifications timed out after {:?}",
                self.setup_timeout
            ))
        });
        let stream = match setup {
            Ok(stream) => stream,
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("Subscribing to {} failed: {}", key, reason);
                self.values.publish(CharacteristicValue {
                    key: key.clone(),
                    origin: ValueOrigin::Notification,
                    result: OperationResult::Failure(reason.clone()),
                });
                return Err(SessionError::SubscriptionFailed {
                    key: key.clone(),
                    reason,
                });
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let forwarder = Forwarder {
            id,
            key: key.clone(),
            values: self.values.clone(),
            cancel: cancel.clone(),
            slot: slot.clone(),
        };
        let handle = tokio::spawn(forwarder.run(stream));
        guard.active = Some(ActiveSubscription { id, cancel, handle });
        info!("Subscribed to {} (subscription {})", key, id);
        Ok(())
    }

    /// Cancel the subscription for `key`, if any.
    pub async fn unsubscribe(&self, key: &CharacteristicKey) {
        let Some(slot) = self.existing_slot(key) else {
            return;
        };
        let active = slot.lock().await.active.take();
        if let Some(active) = active {
            info!("Unsubscribing from {}", key);
            active.stop().await;
        }
    }

    /// Cancel every subscription.
    pub async fn unsubscribe_all(&self) {
        let slots: Vec<SharedSlot> = self.slots.lock().values().cloned().collect();
        let stops = slots.into_iter().map(|slot| async move {
            let active = slot.lock().await.active.take();
            if let Some(active) = active {
                active.stop().await;
            }
        });
        futures::future::join_all(stops).await;
        debug!("All subscriptions cancelled");
    }

    /// Fold a single-shot read result into the characteristic feed.
    pub fn publish_read(
        &self,
        key: &CharacteristicKey,
        request_id: u64,
        result: OperationResult<Vec<u8>>,
    ) {
        self.values.publish(CharacteristicValue {
            key: key.clone(),
            origin: ValueOrigin::Read { request_id },
            result,
        });
    }

    pub async fn is_subscribed(&self, key: &CharacteristicKey) -> bool {
        match self.existing_slot(key) {
            Some(slot) => slot
                .lock()
                .await
                .active
                .as_ref()
                .is_some_and(ActiveSubscription::is_live),
            None => false,
        }
    }

    /// Keys with a live subscription.
    pub async fn active_keys(&self) -> Vec<CharacteristicKey> {
        let slots: Vec<(CharacteristicKey, SharedSlot)> = self
            .slots
            .lock()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        let mut keys = Vec::new();
        for (key, slot) in slots {
            if slot
                .lock()
                .await
                .active
                .as_ref()
                .is_some_and(ActiveSubscription::is_live)
            {
                keys.push(key);
            }
        }
        keys
    }
}

struct Forwarder {
    id: u64,
    key: CharacteristicKey,
    values: Feed<CharacteristicValue>,
    cancel: CancellationToken,
    slot: SharedSlot,
}

impl Forwarder {
    async fn run(self, mut stream: ValueStream) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                item = stream.next() => item,
            };

            match item {
                Some(Ok(value)) => {
                    self.values.publish(CharacteristicValue {
                        key: self.key.clone(),
                        origin: ValueOrigin::Notification,
                        result: OperationResult::Success(value),
                    });
                }
                Some(Err(e)) => {
                    warn!("Notifications from {} failed: {:#}", self.key, e);
                    self.values.publish(CharacteristicValue {
                        key: self.key.clone(),
                        origin: ValueOrigin::Notification,
                        result: OperationResult::Failure(format!("{:#}", e)),
                    });
                    break;
                }
                None => {
                    debug!("Notification stream for {} ended", self.key);
                    break;
                }
            }
        }
        drop(stream);

        // Clear our own entry. Done from a separate task since whoever is
        // replacing us may be holding the slot while waiting for this task.
        let Forwarder { id, slot, .. } = self;
        tokio::spawn(async move {
            let mut guard = slot.lock().await;
            if guard.active.as_ref().is_some_and(|active| active.id == id) {
                guard.active = None;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::FakeTransport;
    use std::time::Duration;
    use uuid::Uuid;

    fn key() -> CharacteristicKey {
        CharacteristicKey::new("dev-1", Uuid::from_u128(0xA))
    }

    fn registry(fake: &FakeTransport) -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(fake.clone()), Feed::new("characteristics"))
    }

    async fn next_value(rx: &FeedReceiver<CharacteristicValue>) -> CharacteristicValue {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("value in time")
            .expect("feed open")
    }

    #[tokio::test]
    async fn test_values_are_forwarded_with_key() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.values();

        registry.subscribe(&key()).await.unwrap();
        fake.notify(&key(), &[0x42]);

        let value = next_value(&rx).await;
        assert_eq!(value.key, key());
        assert_eq!(value.origin, ValueOrigin::Notification);
        assert_eq!(value.result, OperationResult::Success(vec![0x42]));
    }

    #[tokio::test]
    async fn test_resubscribe_cancels_old_stream_first() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.values();

        registry.subscribe(&key()).await.unwrap();
        registry.subscribe(&key()).await.unwrap();

        assert_eq!(fake.live_notification_streams(&key()), 1);
        let journal = fake.journal();
        let k = key().to_string();
        assert_eq!(
            journal,
            vec![
                format!("subscribe {}", k),
                format!("cancel {}", k),
                format!("subscribe {}", k),
            ]
        );

        assert_eq!(fake.notify(&key(), &[7]), 1);
        assert_eq!(next_value(&rx).await.result, OperationResult::Success(vec![7]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_error_terminates_entry() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.values();

        registry.subscribe(&key()).await.unwrap();
        fake.fail_notifications(&key(), "GATT_INSUF_AUTHENTICATION");

        let value = next_value(&rx).await;
        assert_eq!(
            value.result.failure_reason(),
            Some("GATT_INSUF_AUTHENTICATION")
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registry.is_subscribed(&key()).await);
        assert_eq!(fake.live_notification_streams(&key()), 0);
        assert_eq!(fake.notify(&key(), &[1]), 0);
    }

    #[tokio::test]
    async fn test_setup_failure_is_reported_both_ways() {
        let fake = FakeTransport::new();
        fake.fail_subscribe(key(), "characteristic has no CCCD");
        let registry = registry(&fake);
        let rx = registry.values();

        let err = registry.subscribe(&key()).await.unwrap_err();
        assert!(matches!(err, SessionError::SubscriptionFailed { .. }));
        assert!(!next_value(&rx).await.result.is_success());
        assert!(!registry.is_subscribed(&key()).await);
    }

    #[tokio::test]
    async fn test_stalled_setup_fails_within_bound() {
        let fake = FakeTransport::new();
        fake.stall("subscribe");
        let registry = registry(&fake).with_setup_timeout(Duration::from_millis(30));
        let rx = registry.values();

        let err = tokio::time::timeout(Duration::from_secs(1), registry.subscribe(&key()))
            .await
            .expect("setup must give up")
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(!next_value(&rx).await.result.is_success());
        assert!(!registry.is_subscribed(&key()).await);
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_key_is_noop() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);

        registry.unsubscribe(&key()).await;
        assert!(fake.journal().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all_releases_streams() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let other = CharacteristicKey::new("dev-2", Uuid::from_u128(0xB));

        registry.subscribe(&key()).await.unwrap();
        registry.subscribe(&other).await.unwrap();
        assert_eq!(registry.active_keys().await.len(), 2);

        registry.unsubscribe_all().await;

        assert!(registry.active_keys().await.is_empty());
        assert_eq!(fake.live_notification_streams(&key()), 0);
        assert_eq!(fake.live_notification_streams(&other), 0);
    }

    #[tokio::test]
    async fn test_read_results_are_tagged() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.values();

        registry.publish_read(&key(), 9, OperationResult::Failure("timeout".into()));

        let value = next_value(&rx).await;
        assert_eq!(value.origin, ValueOrigin::Read { request_id: 9 });
    }
}
