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

//! Connection registry.
//!
//! One entry per device id, each behind its own async mutex. The registry-wide
//! map lock is only taken to find or create an entry, never across an await.

use anyhow::{anyhow, Result};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::feed::{Feed, FeedReceiver};
use crate::model::{ConnectionState, ConnectionUpdate, DeviceId};
use crate::transport::{BleTransport, LinkEvent, LinkStream};

/// Background task driving one connect attempt.
struct LinkTask {
    cancel: CancellationToken,
    _handle: JoinHandle<()>,
}

#[derive(Default)]
struct DeviceEntry {
    state: ConnectionState,
    /// Bumped whenever the current attempt is superseded. A task only applies
    /// updates while its attempt number is current.
    attempt: u64,
    link: Option<LinkTask>,
}

type SharedEntry = Arc<AsyncMutex<DeviceEntry>>;

/// Upper bound for a transport `disconnect` issued during teardown.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracks connection state per device and publishes every transition.
pub struct ConnectionRegistry {
    transport: Arc<dyn BleTransport>,
    entries: Mutex<HashMap<DeviceId, SharedEntry>>,
    updates: Feed<ConnectionUpdate>,
    call_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(transport: Arc<dyn BleTransport>, updates: Feed<ConnectionUpdate>) -> Self {
        Self {
            transport,
            entries: Mutex::new(HashMap::new()),
            updates,
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound for transport `disconnect` calls. On expiry the state
    /// transition completes anyway.
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Observe connection updates produced from now on.
    pub fn updates(&self) -> FeedReceiver<ConnectionUpdate> {
        self.updates.subscribe()
    }

    fn entry(&self, device_id: &DeviceId) -> SharedEntry {
        self.entries
            .lock()
            .entry(device_id.clone())
            .or_default()
            .clone()
    }

    fn existing_entry(&self, device_id: &DeviceId) -> Option<SharedEntry> {
        self.entries.lock().get(device_id).cloned()
    }

    /// Current state of a device. Untracked devices are `Disconnected`.
    pub async fn state(&self, device_id: &DeviceId) -> ConnectionState {
        match self.existing_entry(device_id) {
            Some(entry) => entry.lock().await.state,
            None => ConnectionState::Disconnected,
        }
    }

    /// State of every tracked device.
    pub async fn snapshot(&self) -> HashMap<DeviceId, ConnectionState> {
        let entries: Vec<(DeviceId, SharedEntry)> = self
            .entries
            .lock()
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let mut snapshot = HashMap::with_capacity(entries.len());
        for (id, entry) in entries {
            let state = entry.lock().await.state;
            snapshot.insert(id, state);
        }
        snapshot
    }

    pub fn tracked_devices(&self) -> Vec<DeviceId> {
        self.entries.lock().keys().cloned().collect()
    }

    /// Start connecting to a device. No-op while connecting or connected.
    pub async fn connect(&self, device_id: &DeviceId, timeout: Duration) {
        let entry = self.entry(device_id);
        let mut slot = entry.lock().await;

        if slot.state.is_active() {
            debug!("{} already {}, ignoring connect", device_id, slot.state.as_str());
            return;
        }

        info!("Connecting to {} (timeout {:?})", device_id, timeout);
        slot.attempt += 1;
        transition(&mut slot, &self.updates, device_id, ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let attempt = Attempt {
            transport: self.transport.clone(),
            entry: entry.clone(),
            updates: self.updates.clone(),
            device_id: device_id.clone(),
            number: slot.attempt,
            cancel: cancel.clone(),
            timeout,
            call_timeout: self.call_timeout,
        };
        let handle = tokio::spawn(attempt.run());
        slot.link = Some(LinkTask {
            cancel,
            _handle: handle,
        });
    }

    /// Tear down a device connection. No-op for unknown or disconnected devices.
    pub async fn disconnect(&self, device_id: &DeviceId) {
        let Some(entry) = self.existing_entry(device_id) else {
            debug!("Disconnect for untracked device {}, ignoring", device_id);
            return;
        };
        let mut slot = entry.lock().await;
        if slot.state == ConnectionState::Disconnected {
            return;
        }

        info!("Disconnecting {}", device_id);
        slot.attempt += 1;
        if let Some(link) = slot.link.take() {
            link.cancel.cancel();
        }
        transition(&mut slot, &self.updates, device_id, ConnectionState::Disconnecting);

        release(&*self.transport, device_id, self.call_timeout).await;
        transition(&mut slot, &self.updates, device_id, ConnectionState::Disconnected);
    }

    /// Disconnect every tracked device.
    pub async fn disconnect_all(&self) {
        let devices = self.tracked_devices();
        if devices.is_empty() {
            return;
        }
        info!("Disconnecting {} device(s)", devices.len());
        futures::future::join_all(devices.iter().map(|id| self.disconnect(id))).await;
    }
}

/// Ask the transport to drop a link, giving up after `limit`.
async fn release(transport: &dyn BleTransport, device_id: &DeviceId, limit: Duration) {
    match tokio::time::timeout(limit, transport.disconnect(device_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Transport disconnect of {} failed: {:#}", device_id, e),
        Err(_) => warn!("Transport disconnect of {} timed out after {:?}", device_id, limit),
    }
}

/// Set the state and publish the transition. Caller holds the entry lock.
fn transition(
    slot: &mut DeviceEntry,
    updates: &Feed<ConnectionUpdate>,
    device_id: &DeviceId,
    state: ConnectionState,
) {
    slot.state = state;
    updates.publish(ConnectionUpdate::state(device_id.clone(), state));
}

struct Attempt {
    transport: Arc<dyn BleTransport>,
    entry: SharedEntry,
    updates: Feed<ConnectionUpdate>,
    device_id: DeviceId,
    number: u64,
    cancel: CancellationToken,
    timeout: Duration,
    call_timeout: Duration,
}

impl Attempt {
    async fn run(self) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            outcome = tokio::time::timeout(self.timeout, self.establish()) => outcome,
        };

        let link = match outcome {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                warn!("Connection to {} failed: {:#}", self.device_id, e);
                self.finish(Some(format!("{:#}", e))).await;
                return;
            }
            Err(_) => {
                warn!("Connection to {} timed out", self.device_id);
                let current = self
                    .finish(Some(format!("Connection timed out after {:?}", self.timeout)))
                    .await;
                if current {
                    release(&*self.transport, &self.device_id, self.call_timeout).await;
                }
                return;
            }
        };

        if !self.apply(ConnectionState::Connected, None).await {
            return;
        }
        info!("Connected to {}", self.device_id);

        let failure = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return,
            failure = watch(link) => failure,
        };
        info!("Link to {} dropped", self.device_id);
        self.finish(failure).await;
    }

    async fn establish(&self) -> Result<LinkStream> {
        let mut link = self.transport.connect(&self.device_id, self.timeout).await?;
        loop {
            match link.next().await {
                Some(Ok(LinkEvent::Connected)) => return Ok(link),
                Some(Ok(LinkEvent::Disconnected { reason })) => {
                    return Err(anyhow!(reason.unwrap_or_else(|| {
                        "Disconnected before the link was established".to_string()
                    })))
                }
                Some(Err(e)) => return Err(e),
                None => return Err(anyhow!("Link closed before it was established")),
            }
        }
    }

    async fn finish(&self, failure: Option<String>) -> bool {
        self.apply(ConnectionState::Disconnected, failure).await
    }

    /// Apply a state reported by this attempt, unless it was superseded.
    async fn apply(&self, state: ConnectionState, failure: Option<String>) -> bool {
        let mut slot = self.entry.lock().await;
        if slot.attempt != self.number {
            debug!("Dropping stale {} for {}", state.as_str(), self.device_id);
            return false;
        }
        slot.state = state;
        if state == ConnectionState::Disconnected {
            slot.link = None;
        }
        let update = match failure {
            Some(reason) => ConnectionUpdate::failure(
                self.device_id.clone(),
                SessionError::ConnectionFailed {
                    device_id: self.device_id.clone(),
                    reason,
                }
                .to_string(),
            ),
            None => ConnectionUpdate::state(self.device_id.clone(), state),
        };
        self.updates.publish(update);
        true
    }
}

/// Follow an established link until it goes down. Returns the failure, if any.
async fn watch(mut link: LinkStream) -> Option<String> {
    loop {
        match link.next().await {
            Some(Ok(LinkEvent::Connected)) => continue,
            Some(Ok(LinkEvent::Disconnected { reason })) => return reason,
            Some(Err(e)) => return Some(format!("{:#}", e)),
            None => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::fake::{ConnectBehavior, FakeTransport};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn registry(fake: &FakeTransport) -> ConnectionRegistry {
        ConnectionRegistry::new(Arc::new(fake.clone()), Feed::new("connections"))
    }

    async fn next_update(rx: &FeedReceiver<ConnectionUpdate>) -> ConnectionUpdate {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("update in time")
            .expect("feed open")
    }

    #[tokio::test]
    async fn test_connect_emits_connecting_then_connected() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.updates();
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, TIMEOUT).await;

        assert_eq!(next_update(&rx).await.state, ConnectionState::Connecting);
        assert_eq!(next_update(&rx).await.state, ConnectionState::Connected);
        assert_eq!(registry.state(&dev).await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let fake = FakeTransport::new();
        fake.set_connect_behavior("dev-1", ConnectBehavior::Manual);
        let registry = registry(&fake);
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, TIMEOUT).await;
        registry.connect(&dev, TIMEOUT).await;
        tokio::task::yield_now().await;

        assert_eq!(registry.state(&dev).await, ConnectionState::Connecting);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fake.count("connect dev-1"), 1);
    }

    #[tokio::test]
    async fn test_disconnect_unknown_device_is_silent() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.updates();

        registry.disconnect(&"ghost".into()).await;

        assert!(rx.try_recv().is_err());
        assert!(fake.journal().is_empty());
        assert_eq!(registry.state(&"ghost".into()).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_link_up_racing_disconnect_is_dropped() {
        let fake = FakeTransport::new();
        fake.set_connect_behavior("dev-1", ConnectBehavior::Manual);
        let registry = Arc::new(registry(&fake));
        let rx = registry.updates();
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, TIMEOUT).await;
        while fake.count("connect dev-1") == 0 {
            tokio::task::yield_now().await;
        }

        // Hold the entry so the disconnect queues ahead of the attempt.
        let entry = registry.entry(&dev);
        let held = entry.lock().await;
        let pending = tokio::spawn({
            let registry = registry.clone();
            let dev = dev.clone();
            async move { registry.disconnect(&dev).await }
        });
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        // The stack reports link-up while the disconnect is waiting.
        assert!(fake.push_link(&dev, LinkEvent::Connected));
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        drop(held);
        pending.await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let states: Vec<ConnectionState> =
            std::iter::from_fn(|| rx.try_recv().ok()).map(|u| u.state).collect();
        assert_eq!(
            states,
            vec![
                ConnectionState::Connecting,
                ConnectionState::Disconnecting,
                ConnectionState::Disconnected
            ]
        );
        assert_eq!(registry.state(&dev).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_repeated_disconnect_is_noop() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.updates();
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, TIMEOUT).await;
        next_update(&rx).await;
        next_update(&rx).await;

        tokio::join!(registry.disconnect(&dev), registry.disconnect(&dev));
        registry.disconnect(&dev).await;

        assert_eq!(next_update(&rx).await.state, ConnectionState::Disconnecting);
        assert_eq!(next_update(&rx).await.state, ConnectionState::Disconnected);
        assert!(rx.try_recv().is_err());
        assert_eq!(fake.count("disconnect dev-1"), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_reports_failure() {
        let fake = FakeTransport::new();
        fake.set_connect_behavior("dev-1", ConnectBehavior::Manual);
        let registry = registry(&fake);
        let rx = registry.updates();
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, Duration::from_millis(20)).await;

        assert_eq!(next_update(&rx).await.state, ConnectionState::Connecting);
        let update = next_update(&rx).await;
        assert!(update.is_failure());
        assert!(update.failure.unwrap().contains("timed out"));
        assert_eq!(registry.state(&dev).await, ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fake.count("disconnect dev-1"), 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_with_stalled_cleanup() {
        let fake = FakeTransport::new();
        fake.set_connect_behavior("dev-1", ConnectBehavior::Manual);
        fake.stall("disconnect");
        let registry = registry(&fake).with_call_timeout(Duration::from_millis(50));
        let rx = registry.updates();
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, Duration::from_millis(20)).await;

        assert_eq!(next_update(&rx).await.state, ConnectionState::Connecting);
        let update = next_update(&rx).await;
        assert!(update.is_failure());
        assert_eq!(update.state, ConnectionState::Disconnected);
        assert_eq!(registry.state(&dev).await, ConnectionState::Disconnected);

        registry.connect(&dev, TIMEOUT).await;
        assert_eq!(next_update(&rx).await.state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_stalled_transport_disconnect_still_completes() {
        let fake = FakeTransport::new();
        let registry = registry(&fake).with_call_timeout(Duration::from_millis(50));
        let rx = registry.updates();
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, TIMEOUT).await;
        next_update(&rx).await;
        next_update(&rx).await;

        fake.stall("disconnect");
        tokio::time::timeout(Duration::from_secs(1), registry.disconnect(&dev))
            .await
            .expect("disconnect must give up on a stalled transport");

        assert_eq!(next_update(&rx).await.state, ConnectionState::Disconnecting);
        assert_eq!(next_update(&rx).await.state, ConnectionState::Disconnected);
        assert_eq!(registry.state(&dev).await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_transport_rejection_reports_failure() {
        let fake = FakeTransport::new();
        fake.set_connect_behavior("dev-1", ConnectBehavior::Reject("le-connection-abort".into()));
        let registry = registry(&fake);
        let rx = registry.updates();

        registry.connect(&"dev-1".into(), TIMEOUT).await;

        next_update(&rx).await;
        let update = next_update(&rx).await;
        assert_eq!(update.state, ConnectionState::Disconnected);
        assert_eq!(
            update.failure.as_deref(),
            Some("Connection to dev-1 failed: le-connection-abort")
        );
    }

    #[tokio::test]
    async fn test_remote_drop_after_connect() {
        let fake = FakeTransport::new();
        let registry = registry(&fake);
        let rx = registry.updates();
        let dev: DeviceId = "dev-1".into();

        registry.connect(&dev, TIMEOUT).await;
        next_update(&rx).await;
        next_update(&rx).await;

        fake.push_link(&dev, LinkEvent::Disconnected { reason: Some("supervision timeout".into()) });

        let update = next_update(&rx).await;
        assert!(update.is_failure());
        assert_eq!(registry.state(&dev).await, ConnectionState::Disconnected);

        // A dropped device can be connected again.
        registry.connect(&dev, TIMEOUT).await;
        assert_eq!(next_update(&rx).await.state, ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_disconnect_all_with_pending_connect() {
        let fake = FakeTransport::new();
        fake.set_connect_behavior("dev-2", ConnectBehavior::Manual);
        let registry = registry(&fake);

        registry.connect(&"dev-1".into(), TIMEOUT).await;
        registry.connect(&"dev-2".into(), TIMEOUT).await;

        tokio::time::timeout(Duration::from_secs(1), registry.disconnect_all())
            .await
            .expect("disconnect_all must not block on a pending connect");

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.values().all(|s| *s == ConnectionState::Disconnected));
    }
}
