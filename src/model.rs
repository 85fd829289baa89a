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

//! Data model shared by the registries, the dispatcher and the command surface.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Opaque identifier of a peer device (a MAC address on BlueZ).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DeviceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A characteristic on a specific device. Subscriptions are keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicKey {
    pub device_id: DeviceId,
    pub characteristic: Uuid,
}

impl CharacteristicKey {
    pub fn new(device_id: impl Into<DeviceId>, characteristic: Uuid) -> Self {
        Self {
            device_id: device_id.into(),
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.characteristic)
    }
}

/// Connection state of one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting",
        }
    }

    /// Whether a connect request should be ignored in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Connecting | ConnectionState::Connected)
    }
}

/// A connection state transition or a connection failure.
///
/// Failure updates always report `Disconnected`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionUpdate {
    pub device_id: DeviceId,
    pub state: ConnectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ConnectionUpdate {
    pub fn state(device_id: DeviceId, state: ConnectionState) -> Self {
        Self {
            device_id,
            state,
            failure: None,
        }
    }

    pub fn failure(device_id: DeviceId, reason: impl Into<String>) -> Self {
        Self {
            device_id,
            state: ConnectionState::Disconnected,
            failure: Some(reason.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Terminal outcome of a single-shot operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "value", rename_all = "snake_case")]
pub enum OperationResult<T> {
    Success(T),
    Failure(String),
}

impl<T> OperationResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationResult::Success(_))
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            OperationResult::Success(_) => None,
            OperationResult::Failure(reason) => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationResult<U> {
        match self {
            OperationResult::Success(value) => OperationResult::Success(f(value)),
            OperationResult::Failure(reason) => OperationResult::Failure(reason),
        }
    }

    pub fn into_result(self) -> Result<T, String> {
        match self {
            OperationResult::Success(value) => Ok(value),
            OperationResult::Failure(reason) => Err(reason),
        }
    }
}

impl<T> From<anyhow::Result<T>> for OperationResult<T> {
    fn from(result: anyhow::Result<T>) -> Self {
        match result {
            Ok(value) => OperationResult::Success(value),
            Err(e) => OperationResult::Failure(format!("{:#}", e)),
        }
    }
}

/// Where an item on the characteristic feed came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueOrigin {
    /// Live notification from an active subscription.
    Notification,
    /// Result of a single-shot read, correlated with the request that issued it.
    Read { request_id: u64 },
}

/// One item on the characteristic feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicValue {
    pub key: CharacteristicKey,
    pub origin: ValueOrigin,
    pub result: OperationResult<Vec<u8>>,
}

/// A discovered GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub service_uuid: Uuid,
    pub characteristic_uuids: Vec<Uuid>,
    #[serde(default)]
    pub included_services: Vec<DiscoveredService>,
}

/// Requested connection interval trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPriority {
    #[default]
    Balanced,
    HighPerformance,
    LowPower,
}

impl ConnectionPriority {
    pub fn code(&self) -> i32 {
        match self {
            Self::Balanced => 0,
            Self::HighPerformance => 1,
            Self::LowPower => 2,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Balanced),
            1 => Some(Self::HighPerformance),
            2 => Some(Self::LowPower),
            _ => None,
        }
    }
}

/// Radio status as reported by the host stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BleStatus {
    #[default]
    Unknown,
    Unsupported,
    Unauthorized,
    PoweredOff,
    LocationServicesDisabled,
    Ready,
}

impl BleStatus {
    pub fn code(&self) -> i32 {
        match self {
            Self::Unknown => 0,
            Self::Unsupported => 1,
            Self::Unauthorized => 2,
            Self::PoweredOff => 3,
            Self::LocationServicesDisabled => 4,
            Self::Ready => 5,
        }
    }
}

/// Scan duty cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanMode {
    Opportunistic,
    LowPower,
    #[default]
    Balanced,
    LowLatency,
}

/// Parameters of a device scan.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanFilter {
    /// Only report devices advertising one of these services. Empty means all.
    pub service_uuids: Vec<Uuid>,
    pub scan_mode: ScanMode,
    pub require_location_services: bool,
}

impl ScanFilter {
    pub fn matches(&self, device: &DiscoveredDevice) -> bool {
        self.service_uuids.is_empty()
            || self
                .service_uuids
                .iter()
                .any(|uuid| device.service_uuids.contains(uuid))
    }
}

/// A device seen while scanning.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub id: DeviceId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    #[serde(default)]
    pub service_uuids: Vec<Uuid>,
    #[serde(default)]
    pub service_data: HashMap<Uuid, Vec<u8>>,
    #[serde(default)]
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

/// Result of a write, tagged with the characteristic it targeted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteInfo {
    pub key: CharacteristicKey,
    pub result: OperationResult<()>,
}

/// Result of a device-level operation (MTU, priority, cache clear).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceOutcome<T> {
    pub device_id: DeviceId,
    pub result: OperationResult<T>,
}
