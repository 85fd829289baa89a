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

//! Command surface: typed requests, responses and outbound events.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::codec::Codec;
use crate::error::{SessionError, SessionResult};
use crate::model::{
    BleStatus, CharacteristicKey, CharacteristicValue, ConnectionPriority, ConnectionUpdate,
    DeviceId, DeviceOutcome, DiscoveredService, ScanFilter, WriteInfo,
};
use crate::session::{ScanResult, SessionManager};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub device_id: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub device_id: DeviceId,
    /// Falls back to the configured connect timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    #[serde(flatten)]
    pub key: CharacteristicKey,
    /// Correlation id echoed on the characteristic feed. Generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    #[serde(flatten)]
    pub key: CharacteristicKey,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MtuRequest {
    pub device_id: DeviceId,
    pub mtu_size: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRequest {
    pub device_id: DeviceId,
    pub priority: ConnectionPriority,
}

/// A decoded front-end request.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Initialize,
    Deinitialize,
    ScanForDevices(ScanFilter),
    ConnectToDevice(ConnectRequest),
    DisconnectFromDevice(DeviceRequest),
    ClearGattCache(DeviceRequest),
    ReadCharacteristic(ReadRequest),
    WriteCharacteristicWithResponse(WriteRequest),
    WriteCharacteristicWithoutResponse(WriteRequest),
    ReadNotifications(CharacteristicKey),
    StopNotifications(CharacteristicKey),
    NegotiateMtuSize(MtuRequest),
    RequestConnectionPriority(PriorityRequest),
    DiscoverServices(DeviceRequest),
}

impl Command {
    pub const METHODS: [&'static str; 14] = [
        "initialize",
        "deinitialize",
        "scanForDevices",
        "connectToDevice",
        "disconnectFromDevice",
        "clearGattCache",
        "readCharacteristic",
        "writeCharacteristicWithResponse",
        "writeCharacteristicWithoutResponse",
        "readNotifications",
        "stopNotifications",
        "negotiateMtuSize",
        "requestConnectionPriority",
        "discoverServices",
    ];

    /// Wire name of the command.
    pub fn method(&self) -> &'static str {
        match self {
            Command::Initialize => "initialize",
            Command::Deinitialize => "deinitialize",
            Command::ScanForDevices(_) => "scanForDevices",
            Command::ConnectToDevice(_) => "connectToDevice",
            Command::DisconnectFromDevice(_) => "disconnectFromDevice",
            Command::ClearGattCache(_) => "clearGattCache",
            Command::ReadCharacteristic(_) => "readCharacteristic",
            Command::WriteCharacteristicWithResponse(_) => "writeCharacteristicWithResponse",
            Command::WriteCharacteristicWithoutResponse(_) => "writeCharacteristicWithoutResponse",
            Command::ReadNotifications(_) => "readNotifications",
            Command::StopNotifications(_) => "stopNotifications",
            Command::NegotiateMtuSize(_) => "negotiateMtuSize",
            Command::RequestConnectionPriority(_) => "requestConnectionPriority",
            Command::DiscoverServices(_) => "discoverServices",
        }
    }

    /// Methods whose reply waits on the radio. Everything else only changes
    /// session state and must be applied in arrival order.
    pub fn is_single_shot(method: &str) -> bool {
        matches!(
            method,
            "clearGattCache"
                | "writeCharacteristicWithResponse"
                | "writeCharacteristicWithoutResponse"
                | "negotiateMtuSize"
                | "requestConnectionPriority"
                | "discoverServices"
        )
    }
}

/// Reply payload of a successful command.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    /// Accepted; any outcome arrives on an event feed.
    Empty,
    ReadStarted {
        request_id: u64,
    },
    Write(WriteInfo),
    Mtu(DeviceOutcome<u16>),
    Device(DeviceOutcome<()>),
    Services {
        device_id: DeviceId,
        services: Vec<DiscoveredService>,
    },
}

/// Outbound event feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventChannel {
    ConnectionUpdates,
    CharacteristicNotifications,
    RadioStatus,
    ScanResults,
}

impl EventChannel {
    pub fn name(&self) -> &'static str {
        match self {
            EventChannel::ConnectionUpdates => "connection-updates",
            EventChannel::CharacteristicNotifications => "characteristic-notifications",
            EventChannel::RadioStatus => "radio-status",
            EventChannel::ScanResults => "scan-results",
        }
    }
}

/// One item on an event feed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Connection(ConnectionUpdate),
    Characteristic(CharacteristicValue),
    Status(BleStatus),
    Scan(ScanResult),
}

impl Event {
    pub fn channel(&self) -> EventChannel {
        match self {
            Event::Connection(_) => EventChannel::ConnectionUpdates,
            Event::Characteristic(_) => EventChannel::CharacteristicNotifications,
            Event::Status(_) => EventChannel::RadioStatus,
            Event::Scan(_) => EventChannel::ScanResults,
        }
    }
}

/// Entry point for opaque front-end requests.
#[async_trait]
pub trait CommandPort: Send + Sync {
    /// Decode `args`, run `method` and return the encoded reply.
    async fn execute(&self, method: &str, args: &[u8]) -> SessionResult<Vec<u8>>;
}

/// Routes decoded commands to the session manager.
pub struct Dispatcher<C> {
    session: Arc<SessionManager>,
    codec: C,
}

impl<C: Codec> Dispatcher<C> {
    pub fn new(session: Arc<SessionManager>, codec: C) -> Self {
        Self { session, codec }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub async fn handle(&self, command: Command) -> SessionResult<Response> {
        let session = &self.session;
        match command {
            Command::Initialize => {
                session.initialize().await?;
                Ok(Response::Empty)
            }
            Command::Deinitialize => {
                session.deinitialize().await;
                Ok(Response::Empty)
            }
            Command::ScanForDevices(filter) => {
                session.scan_for_devices(filter).await?;
                Ok(Response::Empty)
            }
            Command::ConnectToDevice(request) => {
                let timeout = request.timeout_ms.map(Duration::from_millis);
                session.connect_to_device(&request.device_id, timeout).await?;
                Ok(Response::Empty)
            }
            Command::DisconnectFromDevice(request) => {
                session.disconnect_from_device(&request.device_id).await?;
                Ok(Response::Empty)
            }
            Command::ClearGattCache(request) => Ok(Response::Device(
                session.clear_gatt_cache(&request.device_id).await?,
            )),
            Command::ReadCharacteristic(request) => {
                let request_id = session
                    .read_characteristic(&request.key, request.request_id)
                    .await?;
                Ok(Response::ReadStarted { request_id })
            }
            Command::WriteCharacteristicWithResponse(request) => Ok(Response::Write(
                session
                    .write_characteristic_with_response(&request.key, request.value)
                    .await?,
            )),
            Command::WriteCharacteristicWithoutResponse(request) => Ok(Response::Write(
                session
                    .write_characteristic_without_response(&request.key, request.value)
                    .await?,
            )),
            Command::ReadNotifications(key) => {
                session.read_notifications(&key).await?;
                Ok(Response::Empty)
            }
            Command::StopNotifications(key) => {
                session.stop_notifications(&key).await?;
                Ok(Response::Empty)
            }
            Command::NegotiateMtuSize(request) => Ok(Response::Mtu(
                session
                    .negotiate_mtu_size(&request.device_id, request.mtu_size)
                    .await?,
            )),
            Command::RequestConnectionPriority(request) => Ok(Response::Device(
                session
                    .request_connection_priority(&request.device_id, request.priority)
                    .await?,
            )),
            Command::DiscoverServices(request) => {
                let services = session.discover_services(&request.device_id).await?;
                Ok(Response::Services {
                    device_id: request.device_id,
                    services,
                })
            }
        }
    }
}

#[async_trait]
impl<C: Codec> CommandPort for Dispatcher<C> {
    async fn execute(&self, method: &str, args: &[u8]) -> SessionResult<Vec<u8>> {
        let command = self.codec.decode_request(method, args)?;
        debug!("Executing {}", command.method());

        let response = self.handle(command).await?;
        self.codec
            .encode_response(&response)
            .map_err(|e| SessionError::OperationFailed(format!("{:#}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::config::SessionConfig;
    use crate::transport::fake::FakeTransport;
    use serde_json::{json, Value};

    fn dispatcher(fake: &FakeTransport) -> Dispatcher<JsonCodec> {
        let config = SessionConfig {
            status_listen_delay_ms: 0,
            ..SessionConfig::default()
        };
        let session = Arc::new(SessionManager::new(Arc::new(fake.clone()), config));
        Dispatcher::new(session, JsonCodec)
    }

    async fn call(port: &impl CommandPort, method: &str, args: Value) -> SessionResult<Value> {
        let bytes = port.execute(method, args.to_string().as_bytes()).await?;
        Ok(serde_json::from_slice(&bytes).unwrap())
    }

    #[test]
    fn test_method_names_are_unique() {
        let mut names = Command::METHODS.to_vec();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), 14);
    }

    #[test]
    fn test_event_channels() {
        assert_eq!(
            Event::Status(BleStatus::Ready).channel().name(),
            "radio-status"
        );
        assert_eq!(
            serde_json::to_value(Event::Status(BleStatus::PoweredOff)).unwrap(),
            json!("powered_off")
        );
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let fake = FakeTransport::new();
        let port = dispatcher(&fake);

        let err = call(&port, "requestMtu", json!({})).await.unwrap_err();
        assert_eq!(err, SessionError::UnsupportedCommand("requestMtu".to_string()));
        assert_eq!(err.code(), "not_implemented");
    }

    #[tokio::test]
    async fn test_uninitialized_commands_fail() {
        let fake = FakeTransport::new();
        let port = dispatcher(&fake);

        let err = call(&port, "connectToDevice", json!({"device_id": "AA:BB"}))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::NotInitialized);
    }

    #[tokio::test]
    async fn test_connect_replies_immediately_with_null() {
        let fake = FakeTransport::new();
        let port = dispatcher(&fake);

        assert_eq!(call(&port, "initialize", json!(null)).await.unwrap(), Value::Null);
        assert_eq!(
            call(&port, "connectToDevice", json!({"device_id": "AA:BB", "timeout_ms": 500}))
                .await
                .unwrap(),
            Value::Null
        );
    }

    #[tokio::test]
    async fn test_write_reply_carries_info() {
        let fake = FakeTransport::new();
        let port = dispatcher(&fake);
        call(&port, "initialize", json!({})).await.unwrap();

        let reply = call(
            &port,
            "writeCharacteristicWithoutResponse",
            json!({
                "device_id": "AA:BB",
                "characteristic": "00002a37-0000-1000-8000-00805f9b34fb",
                "value": [1, 2, 3]
            }),
        )
        .await
        .unwrap();

        assert_eq!(reply["key"]["device_id"], "AA:BB");
        assert_eq!(reply["result"]["outcome"], "success");
        let writes = fake.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].1, vec![1, 2, 3]);
        assert!(!writes[0].2);
    }

    #[tokio::test]
    async fn test_mtu_reply() {
        let fake = FakeTransport::new();
        let port = dispatcher(&fake);
        call(&port, "initialize", json!({})).await.unwrap();

        let reply = call(&port, "negotiateMtuSize", json!({"device_id": "AA:BB", "mtu_size": 247}))
            .await
            .unwrap();
        assert_eq!(
            reply,
            json!({"device_id": "AA:BB", "result": {"outcome": "success", "value": 247}})
        );
    }

    #[tokio::test]
    async fn test_discovery_failure_is_command_error() {
        let fake = FakeTransport::new();
        fake.fail("discover_services", "GATT error 133");
        let port = dispatcher(&fake);
        call(&port, "initialize", json!({})).await.unwrap();

        let err = call(&port, "discoverServices", json!({"device_id": "AA:BB"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "service_discovery_failure");
        assert!(err.to_string().contains("GATT error 133"));
    }

    #[tokio::test]
    async fn test_priority_failure_is_payload() {
        let fake = FakeTransport::new();
        fake.fail("request_connection_priority", "not supported");
        let port = dispatcher(&fake);
        call(&port, "initialize", json!({})).await.unwrap();

        let reply = call(
            &port,
            "requestConnectionPriority",
            json!({"device_id": "AA:BB", "priority": "high_performance"}),
        )
        .await
        .unwrap();
        assert_eq!(reply["result"]["outcome"], "failure");
        assert_eq!(reply["result"]["value"], "not supported");
    }

    #[tokio::test]
    async fn test_read_reply_has_request_id() {
        let fake = FakeTransport::new();
        let port = dispatcher(&fake);
        call(&port, "initialize", json!({})).await.unwrap();

        let reply = call(
            &port,
            "readCharacteristic",
            json!({
                "device_id": "AA:BB",
                "characteristic": "00002a37-0000-1000-8000-00805f9b34fb",
                "request_id": 9
            }),
        )
        .await
        .unwrap();
        assert_eq!(reply, json!({"request_id": 9}));
    }
}
