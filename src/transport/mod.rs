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

//! Transport adapter boundary.
//!
//! The session layer never talks to a radio stack directly. It drives a
//! [`BleTransport`], which performs the actual BLE work and reports outcomes
//! as futures (single-shot operations) or streams (links, notifications,
//! scans, radio status). Errors at this boundary are plain `anyhow::Error`;
//! the session converts them into structured results.

#[cfg(any(test, feature = "test-util"))]
pub mod fake;

#[cfg(feature = "bluez")]
pub mod bluez;

use anyhow::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

use crate::model::{
    BleStatus, CharacteristicKey, ConnectionPriority, DeviceId, DiscoveredDevice,
    DiscoveredService, ScanFilter,
};

#[cfg(any(test, feature = "test-util"))]
pub use fake::FakeTransport;

/// Link-level events reported for a connection attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The link is up.
    Connected,
    /// The link went down, optionally with a reason reported by the stack.
    Disconnected { reason: Option<String> },
}

pub type LinkStream = BoxStream<'static, Result<LinkEvent>>;
pub type ValueStream = BoxStream<'static, Result<Vec<u8>>>;
pub type ScanStream = BoxStream<'static, Result<DiscoveredDevice>>;
pub type StatusStream = BoxStream<'static, BleStatus>;

/// Capability performing the actual BLE operations.
///
/// Dropping a returned stream must release whatever the transport holds for
/// it (notification session, scan session, link watcher).
#[async_trait]
pub trait BleTransport: Send + Sync + 'static {
    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;

    /// Prepare the underlying stack. Called on every session initialize.
    async fn initialize(&self) -> Result<()>;

    /// Start scanning. Dropping the stream stops the scan.
    async fn scan(&self, filter: &ScanFilter) -> Result<ScanStream>;

    /// Start connecting. The stream reports `Connected` once the link is up
    /// and `Disconnected` whenever it goes down.
    async fn connect(&self, device_id: &DeviceId, timeout: Duration) -> Result<LinkStream>;

    async fn disconnect(&self, device_id: &DeviceId) -> Result<()>;

    async fn discover_services(&self, device_id: &DeviceId) -> Result<Vec<DiscoveredService>>;

    async fn read_characteristic(&self, key: &CharacteristicKey) -> Result<Vec<u8>>;

    async fn write_characteristic(
        &self,
        key: &CharacteristicKey,
        value: &[u8],
        with_response: bool,
    ) -> Result<()>;

    /// Enable notifications. Dropping the stream disables them.
    async fn subscribe_notifications(&self, key: &CharacteristicKey) -> Result<ValueStream>;

    /// Negotiate the ATT MTU, returning the size actually in effect.
    async fn negotiate_mtu(&self, device_id: &DeviceId, size: u16) -> Result<u16>;

    async fn request_connection_priority(
        &self,
        device_id: &DeviceId,
        priority: ConnectionPriority,
    ) -> Result<()>;

    async fn clear_gatt_cache(&self, device_id: &DeviceId) -> Result<()>;

    /// Radio status changes, starting with the current status.
    async fn observe_status(&self) -> Result<StatusStream>;
}
