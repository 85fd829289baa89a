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

//! Request and reply encoding.

use anyhow::Result;
use serde::de::DeserializeOwned;

use crate::command::{Command, Event, Response};
use crate::error::{SessionError, SessionResult};

/// Converts opaque front-end bytes to commands and results back to bytes.
pub trait Codec: Send + Sync + 'static {
    /// Unknown methods yield [`SessionError::UnsupportedCommand`], malformed
    /// arguments [`SessionError::InvalidArguments`].
    fn decode_request(&self, method: &str, args: &[u8]) -> SessionResult<Command>;

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>>;

    fn encode_event(&self, event: &Event) -> Result<Vec<u8>>;
}

/// JSON arguments and payloads via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    fn args<T: DeserializeOwned>(method: &str, args: &[u8]) -> SessionResult<T> {
        serde_json::from_slice(args)
            .map_err(|e| SessionError::InvalidArguments(format!("{}: {}", method, e)))
    }

    /// Scan filters are optional; an empty or null body means "no filter".
    fn optional_args<T: DeserializeOwned + Default>(method: &str, args: &[u8]) -> SessionResult<T> {
        if args.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        Self::args::<Option<T>>(method, args).map(Option::unwrap_or_default)
    }
}

impl Codec for JsonCodec {
    fn decode_request(&self, method: &str, args: &[u8]) -> SessionResult<Command> {
        let command = match method {
            "initialize" => Command::Initialize,
            "deinitialize" => Command::Deinitialize,
            "scanForDevices" => Command::ScanForDevices(Self::optional_args(method, args)?),
            "connectToDevice" => Command::ConnectToDevice(Self::args(method, args)?),
            "disconnectFromDevice" => Command::DisconnectFromDevice(Self::args(method, args)?),
            "clearGattCache" => Command::ClearGattCache(Self::args(method, args)?),
            "readCharacteristic" => Command::ReadCharacteristic(Self::args(method, args)?),
            "writeCharacteristicWithResponse" => {
                Command::WriteCharacteristicWithResponse(Self::args(method, args)?)
            }
            "writeCharacteristicWithoutResponse" => {
                Command::WriteCharacteristicWithoutResponse(Self::args(method, args)?)
            }
            "readNotifications" => Command::ReadNotifications(Self::args(method, args)?),
            "stopNotifications" => Command::StopNotifications(Self::args(method, args)?),
            "negotiateMtuSize" => Command::NegotiateMtuSize(Self::args(method, args)?),
            "requestConnectionPriority" => {
                Command::RequestConnectionPriority(Self::args(method, args)?)
            }
            "discoverServices" => Command::DiscoverServices(Self::args(method, args)?),
            other => return Err(SessionError::UnsupportedCommand(other.to_string())),
        };
        Ok(command)
    }

    fn encode_response(&self, response: &Response) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(response)?)
    }

    fn encode_event(&self, event: &Event) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(event)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{ConnectRequest, ReadRequest};
    use crate::model::{
        CharacteristicKey, CharacteristicValue, ConnectionUpdate, DeviceId,
        OperationResult, ScanMode, ValueOrigin,
    };
    use uuid::Uuid;

    const BATTERY_LEVEL: &str = "00002a19-0000-1000-8000-00805f9b34fb";

    #[test]
    fn test_decode_connect() {
        let command = JsonCodec
            .decode_request("connectToDevice", br#"{"device_id":"AA:BB","timeout_ms":1500}"#)
            .unwrap();
        assert_eq!(
            command,
            Command::ConnectToDevice(ConnectRequest {
                device_id: DeviceId::from("AA:BB"),
                timeout_ms: Some(1500),
            })
        );
    }

    #[test]
    fn test_decode_read_without_request_id() {
        let args = format!(r#"{{"device_id":"AA:BB","characteristic":"{}"}}"#, BATTERY_LEVEL);
        let command = JsonCodec
            .decode_request("readCharacteristic", args.as_bytes())
            .unwrap();
        assert_eq!(
            command,
            Command::ReadCharacteristic(ReadRequest {
                key: CharacteristicKey::new("AA:BB", Uuid::parse_str(BATTERY_LEVEL).unwrap()),
                request_id: None,
            })
        );
    }

    #[test]
    fn test_scan_filter_is_optional() {
        for body in [&b""[..], b"null", b"  "] {
            assert_eq!(
                JsonCodec.decode_request("scanForDevices", body).unwrap(),
                Command::ScanForDevices(Default::default())
            );
        }

        let command = JsonCodec
            .decode_request("scanForDevices", br#"{"scan_mode":"low_latency"}"#)
            .unwrap();
        match command {
            Command::ScanForDevices(filter) => assert_eq!(filter.scan_mode, ScanMode::LowLatency),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_malformed_arguments() {
        let err = JsonCodec
            .decode_request("negotiateMtuSize", br#"{"device_id":"AA:BB"}"#)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_arguments");
        assert!(err.to_string().contains("negotiateMtuSize"));

        let err = JsonCodec
            .decode_request("readNotifications", br#"{"device_id":"AA:BB","characteristic":"nope"}"#)
            .unwrap_err();
        assert_eq!(err.code(), "invalid_arguments");
    }

    #[test]
    fn test_unknown_method() {
        assert_eq!(
            JsonCodec.decode_request("pair", b"{}").unwrap_err(),
            SessionError::UnsupportedCommand("pair".to_string())
        );
    }

    #[test]
    fn test_encode_events() {
        let update = Event::Connection(ConnectionUpdate::failure(
            DeviceId::from("AA:BB"),
            "timed out",
        ));
        let json: serde_json::Value =
            serde_json::from_slice(&JsonCodec.encode_event(&update).unwrap()).unwrap();
        assert_eq!(json["state"], "disconnected");
        assert_eq!(json["failure"], "timed out");

        let value = Event::Characteristic(CharacteristicValue {
            key: CharacteristicKey::new("AA:BB", Uuid::parse_str(BATTERY_LEVEL).unwrap()),
            origin: ValueOrigin::Read { request_id: 3 },
            result: OperationResult::Success(vec![99]),
        });
        let json: serde_json::Value =
            serde_json::from_slice(&JsonCodec.encode_event(&value).unwrap()).unwrap();
        assert_eq!(json["origin"], serde_json::json!({"kind": "read", "request_id": 3}));
        assert_eq!(json["result"]["value"], serde_json::json!([99]));
    }

    #[test]
    fn test_empty_response_is_null() {
        assert_eq!(JsonCodec.encode_response(&Response::Empty).unwrap(), b"null");
    }
}
