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

//! Error taxonomy of the session layer.

use thiserror::Error;

use crate::model::{CharacteristicKey, DeviceId};

/// Errors surfaced by the session layer.
///
/// Transport errors are always converted into one of these (or into a failure
/// payload) before they leave the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Connection to {device_id} failed: {reason}")]
    ConnectionFailed { device_id: DeviceId, reason: String },
    #[error("Operation failed: {0}")]
    OperationFailed(String),
    #[error("Subscription to {key} failed: {reason}")]
    SubscriptionFailed {
        key: CharacteristicKey,
        reason: String,
    },
    #[error("Service discovery on {device_id} failed: {reason}")]
    ServiceDiscoveryFailed { device_id: DeviceId, reason: String },
    #[error("Unsupported command: {0}")]
    UnsupportedCommand(String),
    #[error("Session is not initialized")]
    NotInitialized,
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
}

impl SessionError {
    /// Stable code reported to the front end alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionFailed { .. } => "connection_failure",
            Self::OperationFailed(_) => "operation_failure",
            Self::SubscriptionFailed { .. } => "subscription_failure",
            Self::ServiceDiscoveryFailed { .. } => "service_discovery_failure",
            Self::UnsupportedCommand(_) => "not_implemented",
            Self::NotInitialized => "not_initialized",
            Self::InvalidArguments(_) => "invalid_arguments",
        }
    }
}

pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = SessionError::ServiceDiscoveryFailed {
            device_id: "dev-x".into(),
            reason: "GATT_ERROR".into(),
        };
        assert_eq!(err.code(), "service_discovery_failure");
        assert_eq!(
            err.to_string(),
            "Service discovery on dev-x failed: GATT_ERROR"
        );
        assert_eq!(
            SessionError::UnsupportedCommand("frobnicate".into()).code(),
            "not_implemented"
        );
    }
}
