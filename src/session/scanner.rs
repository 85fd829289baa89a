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

//! Device scanning. One scan runs at a time; a new request replaces it.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::feed::Feed;
use crate::model::{DiscoveredDevice, OperationResult, ScanFilter};
use crate::transport::{BleTransport, ScanStream};

/// Item on the scan feed.
pub type ScanResult = OperationResult<DiscoveredDevice>;

struct ScanTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Scanner {
    transport: Arc<dyn BleTransport>,
    results: Feed<ScanResult>,
    current: AsyncMutex<Option<ScanTask>>,
    setup_timeout: Duration,
}

impl ScanTask {
    async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                warn!("Scan task panicked");
            }
        }
    }
}

impl Scanner {
    pub fn new(transport: Arc<dyn BleTransport>, results: Feed<ScanResult>) -> Self {
        Self {
            transport,
            results,
            current: AsyncMutex::new(None),
            setup_timeout: super::connections::DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Bound for starting a scan on the transport.
    pub fn with_setup_timeout(mut self, setup_timeout: Duration) -> Self {
        self.setup_timeout = setup_timeout;
        self
    }

    /// Start scanning with `filter`, stopping any scan already running.
    /// Setup errors are published on the scan feed.
    pub async fn scan_for_devices(&self, filter: ScanFilter) {
        let mut current = self.current.lock().await;
        if let Some(previous) = current.take() {
            debug!("Replacing running scan");
            previous.stop().await;
        }

        let setup = tokio::time::timeout(self.setup_timeout, self.transport.scan(&filter))
            .await
            .unwrap_or_else(|_| {
                Err(anyhow::anyhow!(
                    "Starting scan timed out after {:?}",
                    self.setup_timeout
                ))
            });
        let stream = match setup {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to start scan: {:#}", e);
                self.results
                    .publish(OperationResult::Failure(format!("{:#}", e)));
                return;
            }
        };

        info!(
            "Scanning for devices ({} service filter(s), {:?})",
            filter.service_uuids.len(),
            filter.scan_mode
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(forward(
            stream,
            filter,
            self.results.clone(),
            cancel.clone(),
        ));
        *current = Some(ScanTask { cancel, handle });
    }

    pub async fn stop_scan(&self) {
        if let Some(task) = self.current.lock().await.take() {
            info!("Stopping scan");
            task.stop().await;
        }
    }

    pub async fn is_scanning(&self) -> bool {
        self.current
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

async fn forward(
    mut stream: ScanStream,
    filter: ScanFilter,
    results: Feed<ScanResult>,
    cancel: CancellationToken,
) {
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            item = stream.next() => item,
        };
        match item {
            Some(Ok(device)) => {
                if filter.matches(&device) {
                    results.publish(OperationResult::Success(device));
                }
            }
            Some(Err(e)) => {
                warn!("Scan failed: {:#}", e);
                results.publish(OperationResult::Failure(format!("{:#}", e)));
                return;
            }
            None => {
                debug!("Scan stream ended");
                return;
            }
        }
    }
}
