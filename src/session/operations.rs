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

//! Single-shot operation dispatcher.
//!
//! Every operation runs as its own task and resolves to exactly one
//! [`OperationResult`]: transport errors, timeouts, panics and shutdown all
//! come back through the same return path a success would use.

use anyhow::anyhow;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::model::{
    CharacteristicKey, ConnectionPriority, DeviceId, DeviceOutcome, DiscoveredService,
    OperationResult, WriteInfo,
};
use crate::transport::BleTransport;

/// Runs read/write/MTU/priority/discovery/cache operations against the transport.
pub struct OperationDispatcher {
    transport: Arc<dyn BleTransport>,
    timeout: Option<Duration>,
    shutdown: CancellationToken,
}

impl OperationDispatcher {
    pub fn new(transport: Arc<dyn BleTransport>, timeout: Option<Duration>) -> Self {
        Self {
            transport,
            timeout,
            shutdown: CancellationToken::new(),
        }
    }

    /// Resolve every in-flight operation as a failure and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    async fn run<T, F, Fut>(&self, label: String, op: F) -> OperationResult<T>
    where
        F: FnOnce(Arc<dyn BleTransport>) -> Fut,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let fut = op(self.transport.clone());
        let timeout = self.timeout;
        let shutdown = self.shutdown.clone();

        let handle = tokio::spawn(async move {
            let limited = async move {
                match timeout {
                    Some(limit) => tokio::time::timeout(limit, fut)
                        .await
                        .map_err(|_| anyhow!("Operation timed out after {:?}", limit))?,
                    None => fut.await,
                }
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => Err(anyhow!("Session was deinitialized")),
                result = limited => result,
            }
        });

        let result = match handle.await {
            Ok(result) => OperationResult::from(result),
            Err(e) if e.is_cancelled() => OperationResult::Failure("Operation was cancelled".into()),
            Err(_) => OperationResult::Failure("Operation aborted unexpectedly".into()),
        };

        match result.failure_reason() {
            Some(reason) => warn!("{} failed: {}", label, reason),
            None => debug!("{} succeeded", label),
        }
        result
    }

    pub async fn read(&self, key: &CharacteristicKey) -> OperationResult<Vec<u8>> {
        let target = key.clone();
        self.run(format!("Read {}", key), move |transport| async move {
            transport.read_characteristic(&target).await
        })
        .await
    }

    pub async fn write(
        &self,
        key: &CharacteristicKey,
        value: Vec<u8>,
        with_response: bool,
    ) -> WriteInfo {
        let target = key.clone();
        let result = self
            .run(format!("Write {} ({} bytes)", key, value.len()), move |transport| async move {
                transport
                    .write_characteristic(&target, &value, with_response)
                    .await
            })
            .await;
        WriteInfo {
            key: key.clone(),
            result,
        }
    }

    pub async fn write_with_response(&self, key: &CharacteristicKey, value: Vec<u8>) -> WriteInfo {
        self.write(key, value, true).await
    }

    pub async fn write_without_response(
        &self,
        key: &CharacteristicKey,
        value: Vec<u8>,
    ) -> WriteInfo {
        self.write(key, value, false).await
    }

    pub async fn negotiate_mtu(&self, device_id: &DeviceId, size: u16) -> DeviceOutcome<u16> {
        let target = device_id.clone();
        let result = self
            .run(format!("MTU {} on {}", size, device_id), move |transport| async move {
                transport.negotiate_mtu(&target, size).await
            })
            .await;
        DeviceOutcome {
            device_id: device_id.clone(),
            result,
        }
    }

    pub async fn request_connection_priority(
        &self,
        device_id: &DeviceId,
        priority: ConnectionPriority,
    ) -> DeviceOutcome<()> {
        let target = device_id.clone();
        let result = self
            .run(format!("Priority {:?} on {}", priority, device_id), move |transport| async move {
                transport.request_connection_priority(&target, priority).await
            })
            .await;
        DeviceOutcome {
            device_id: device_id.clone(),
            result,
        }
    }

    pub async fn clear_gatt_cache(&self, device_id: &DeviceId) -> DeviceOutcome<()> {
        let target = device_id.clone();
        let result = self
            .run(format!("Clear GATT cache on {}", device_id), move |transport| async move {
                transport.clear_gatt_cache(&target).await
            })
            .await;
        DeviceOutcome {
            device_id: device_id.clone(),
            result,
        }
    }

    /// Discover services. Failures surface as [`SessionError::ServiceDiscoveryFailed`].
    pub async fn discover_services(
        &self,
        device_id: &DeviceId,
    ) -> SessionResult<Vec<DiscoveredService>> {
        let target = device_id.clone();
        self.run(format!("Discover services on {}", device_id), move |transport| async move {
            transport.discover_services(&target).await
        })
        .await
        .into_result()
        .map_err(|reason| SessionError::ServiceDiscoveryFailed {
            device_id: device_id.clone(),
            reason,
        })
    }
}
