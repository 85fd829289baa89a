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

//! Session manager.
//!
//! Owns one active session at a time: the connection and subscription
//! registries, the operation dispatcher, the scanner and the radio status pump.
//! Event feeds belong to the manager itself so observers survive
//! re-initialization.

pub mod connections;
pub mod notifications;
pub mod operations;
pub mod scanner;

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::feed::{Feed, FeedReceiver};
use crate::model::{
    BleStatus, CharacteristicKey, CharacteristicValue, ConnectionPriority, ConnectionState,
    ConnectionUpdate, DeviceId, DeviceOutcome, DiscoveredService, ScanFilter, WriteInfo,
};
use crate::transport::BleTransport;

pub use connections::ConnectionRegistry;
pub use notifications::SubscriptionRegistry;
pub use operations::OperationDispatcher;
pub use scanner::{ScanResult, Scanner};

/// Outbound event feeds, one per channel.
#[derive(Clone)]
pub struct EventFeeds {
    pub connections: Feed<ConnectionUpdate>,
    pub characteristics: Feed<CharacteristicValue>,
    pub status: Feed<BleStatus>,
    pub scan: Feed<ScanResult>,
}

impl Default for EventFeeds {
    fn default() -> Self {
        Self {
            connections: Feed::new("connection-updates"),
            characteristics: Feed::new("characteristic-notifications"),
            status: Feed::new("radio-status"),
            scan: Feed::new("scan-results"),
        }
    }
}

/// Everything created by `initialize` and torn down by `deinitialize`.
struct ActiveSession {
    connections: ConnectionRegistry,
    subscriptions: Arc<SubscriptionRegistry>,
    operations: Arc<OperationDispatcher>,
    scanner: Scanner,
    status_pump: JoinHandle<()>,
}

impl ActiveSession {
    fn start(transport: &Arc<dyn BleTransport>, config: &SessionConfig, feeds: &EventFeeds) -> Self {
        Self {
            connections: ConnectionRegistry::new(transport.clone(), feeds.connections.clone())
                .with_call_timeout(config.transport_timeout()),
            subscriptions: Arc::new(
                SubscriptionRegistry::new(transport.clone(), feeds.characteristics.clone())
                    .with_setup_timeout(config.transport_timeout()),
            ),
            operations: Arc::new(OperationDispatcher::new(
                transport.clone(),
                config.operation_timeout(),
            )),
            scanner: Scanner::new(transport.clone(), feeds.scan.clone())
                .with_setup_timeout(config.transport_timeout()),
            status_pump: tokio::spawn(pump_status(
                transport.clone(),
                feeds.status.clone(),
                config.status_listen_delay(),
            )),
        }
    }

    async fn teardown(&self) {
        self.scanner.stop_scan().await;
        self.operations.shutdown();
        self.subscriptions.unsubscribe_all().await;
        self.connections.disconnect_all().await;
        self.status_pump.abort();
    }
}

/// Forward the transport's radio status to the status feed.
async fn pump_status(transport: Arc<dyn BleTransport>, feed: Feed<BleStatus>, delay: Duration) {
    tokio::time::sleep(delay).await;

    let mut statuses = match transport.observe_status().await {
        Ok(statuses) => statuses,
        Err(e) => {
            warn!("Radio status unavailable: {:#}", e);
            return;
        }
    };

    while let Some(status) = statuses.next().await {
        debug!("Radio status: {:?}", status);
        feed.publish(status);
    }
    debug!("Radio status stream ended");
}

pub struct SessionManager {
    transport: Arc<dyn BleTransport>,
    config: SessionConfig,
    feeds: EventFeeds,
    active: RwLock<Option<ActiveSession>>,
    next_request_id: AtomicU64,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn BleTransport>, config: SessionConfig) -> Self {
        Self::with_feeds(transport, config, EventFeeds::default())
    }

    pub fn with_feeds(transport: Arc<dyn BleTransport>, config: SessionConfig, feeds: EventFeeds) -> Self {
        Self {
            transport,
            config,
            feeds,
            active: RwLock::new(None),
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn feeds(&self) -> &EventFeeds {
        &self.feeds
    }

    pub fn connection_updates(&self) -> FeedReceiver<ConnectionUpdate> {
        self.feeds.connections.subscribe()
    }

    pub fn characteristic_values(&self) -> FeedReceiver<CharacteristicValue> {
        self.feeds.characteristics.subscribe()
    }

    pub fn status_updates(&self) -> FeedReceiver<BleStatus> {
        self.feeds.status.subscribe()
    }

    pub fn scan_results(&self) -> FeedReceiver<ScanResult> {
        self.feeds.scan.subscribe()
    }

    pub async fn is_initialized(&self) -> bool {
        self.active.read().await.is_some()
    }

    async fn session(&self) -> SessionResult<RwLockReadGuard<'_, ActiveSession>> {
        RwLockReadGuard::try_map(self.active.read().await, Option::as_ref)
            .map_err(|_| SessionError::NotInitialized)
    }

    /// Start a fresh session, tearing down any previous one first.
    pub async fn initialize(&self) -> SessionResult<()> {
        self.deinitialize().await;

        self.transport.initialize().await.map_err(|e| {
            warn!("Transport initialization failed: {:#}", e);
            SessionError::OperationFailed(format!("{:#}", e))
        })?;

        let session = ActiveSession::start(&self.transport, &self.config, &self.feeds);
        let replaced = self.active.write().await.replace(session);
        if let Some(previous) = replaced {
            previous.teardown().await;
        }

        info!("Session initialized on {}", self.transport.backend_name());
        Ok(())
    }

    /// Tear down the active session. Does nothing when uninitialized.
    pub async fn deinitialize(&self) {
        // Resolve in-flight operations so their callers release the session.
        if let Some(session) = self.active.read().await.as_ref() {
            session.operations.shutdown();
        }

        let previous = self.active.write().await.take();
        if let Some(session) = previous {
            session.teardown().await;
            info!("Session deinitialized");
        }
    }

    pub async fn scan_for_devices(&self, filter: ScanFilter) -> SessionResult<()> {
        self.session().await?.scanner.scan_for_devices(filter).await;
        Ok(())
    }

    pub async fn stop_scan(&self) -> SessionResult<()> {
        self.session().await?.scanner.stop_scan().await;
        Ok(())
    }

    /// Start connecting; progress arrives on the connection feed.
    pub async fn connect_to_device(
        &self,
        device_id: &DeviceId,
        timeout: Option<Duration>,
    ) -> SessionResult<()> {
        let timeout = timeout.unwrap_or_else(|| self.config.connect_timeout());
        self.session().await?.connections.connect(device_id, timeout).await;
        Ok(())
    }

    pub async fn disconnect_from_device(&self, device_id: &DeviceId) -> SessionResult<()> {
        self.session().await?.connections.disconnect(device_id).await;
        Ok(())
    }

    pub async fn connection_state(&self, device_id: &DeviceId) -> SessionResult<ConnectionState> {
        Ok(self.session().await?.connections.state(device_id).await)
    }

    pub async fn connection_snapshot(&self) -> SessionResult<HashMap<DeviceId, ConnectionState>> {
        Ok(self.session().await?.connections.snapshot().await)
    }

    pub async fn clear_gatt_cache(&self, device_id: &DeviceId) -> SessionResult<DeviceOutcome<()>> {
        Ok(self.session().await?.operations.clear_gatt_cache(device_id).await)
    }

    /// Start a single read. The value is delivered on the characteristic feed
    /// tagged with the returned request id.
    pub async fn read_characteristic(
        &self,
        key: &CharacteristicKey,
        request_id: Option<u64>,
    ) -> SessionResult<u64> {
        let session = self.session().await?;
        let request_id =
            request_id.unwrap_or_else(|| self.next_request_id.fetch_add(1, Ordering::Relaxed));

        let operations = session.operations.clone();
        let subscriptions = session.subscriptions.clone();
        let key = key.clone();
        tokio::spawn(async move {
            let result = operations.read(&key).await;
            subscriptions.publish_read(&key, request_id, result);
        });
        Ok(request_id)
    }

    pub async fn write_characteristic_with_response(
        &self,
        key: &CharacteristicKey,
        value: Vec<u8>,
    ) -> SessionResult<WriteInfo> {
        Ok(self.session().await?.operations.write_with_response(key, value).await)
    }

    pub async fn write_characteristic_without_response(
        &self,
        key: &CharacteristicKey,
        value: Vec<u8>,
    ) -> SessionResult<WriteInfo> {
        Ok(self.session().await?.operations.write_without_response(key, value).await)
    }

    /// Subscribe to notifications. Setup failures are reported on the
    /// characteristic feed, not to the caller.
    pub async fn read_notifications(&self, key: &CharacteristicKey) -> SessionResult<()> {
        let session = self.session().await?;
        if let Err(e) = session.subscriptions.subscribe(key).await {
            debug!("{}", e);
        }
        Ok(())
    }

    pub async fn stop_notifications(&self, key: &CharacteristicKey) -> SessionResult<()> {
        self.session().await?.subscriptions.unsubscribe(key).await;
        Ok(())
    }

    pub async fn active_subscriptions(&self) -> SessionResult<Vec<CharacteristicKey>> {
        Ok(self.session().await?.subscriptions.active_keys().await)
    }

    pub async fn negotiate_mtu_size(
        &self,
        device_id: &DeviceId,
        size: u16,
    ) -> SessionResult<DeviceOutcome<u16>> {
        Ok(self.session().await?.operations.negotiate_mtu(device_id, size).await)
    }

    pub async fn request_connection_priority(
        &self,
        device_id: &DeviceId,
        priority: ConnectionPriority,
    ) -> SessionResult<DeviceOutcome<()>> {
        Ok(self
            .session()
            .await?
            .operations
            .request_connection_priority(device_id, priority)
            .await)
    }

    pub async fn discover_services(
        &self,
        device_id: &DeviceId,
    ) -> SessionResult<Vec<DiscoveredService>> {
        self.session().await?.operations.discover_services(device_id).await
    }

    /// The characteristic observer went away: drop every subscription.
    pub async fn characteristic_observer_lost(&self) {
        if let Ok(session) = self.session().await {
            info!("Characteristic observer detached, cancelling subscriptions");
            session.subscriptions.unsubscribe_all().await;
        }
    }

    /// The connection observer went away: disconnect everything.
    pub async fn connection_observer_lost(&self) {
        if let Ok(session) = self.session().await {
            info!("Connection observer detached, disconnecting all devices");
            session.connections.disconnect_all().await;
        }
    }
}
