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

//! ble-session: BLE GATT session manager speaking JSON lines on stdio.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ble_session::config::Config;
use ble_session::transport::bluez::BluezTransport;
use ble_session::{LinePort, SessionManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging. Stdout carries the command port.
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble_session=info".parse()?),
        )
        .init();

    info!("Starting ble-session v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let transport = BluezTransport::new(&config.bluetooth).await?;
    let session = Arc::new(SessionManager::new(
        Arc::new(transport),
        config.session.clone(),
    ));
    let port = LinePort::new(session.clone());

    tokio::select! {
        result = port.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout()) => {
            if let Err(e) = result {
                error!("Command port failed: {:#}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    session.deinitialize().await;
    info!("Shutdown complete");
    Ok(())
}
