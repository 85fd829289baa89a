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

//! Configuration module.
//!
//! Handles loading and saving session settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const APP_DIR: &str = "ble-session";

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session timing.
    pub session: SessionConfig,

    /// Bluetooth settings.
    pub bluetooth: BluetoothConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Connect timeout used when a request does not carry one.
    pub connect_timeout_ms: u64,

    /// Upper bound for single-shot operations. Zero disables it.
    pub operation_timeout_ms: u64,

    /// Delay before the radio status stream is observed after initialize.
    pub status_listen_delay_ms: u64,

    /// Upper bound for transport disconnects and for subscription or scan
    /// setup. Teardown completes once it expires.
    pub transport_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            operation_timeout_ms: 30_000,
            status_listen_delay_ms: 500,
            transport_timeout_ms: 5_000,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        (self.operation_timeout_ms > 0).then(|| Duration::from_millis(self.operation_timeout_ms))
    }

    pub fn status_listen_delay(&self) -> Duration {
        Duration::from_millis(self.status_listen_delay_ms)
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Adapter name such as "hci0". The default adapter is used when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter: Option<String>,
}

impl Config {
    /// Default location: `<config dir>/ble-session/config.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from the default location, creating it on first run.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path` or write the defaults there.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config = toml::from_str(&content)?;
            debug!("Loaded configuration from {}", path.display());
            return Ok(config);
        }

        let config = Self::default();
        config.save_to(path)?;
        debug!("Wrote default configuration to {}", path.display());
        Ok(config)
    }

    /// Save configuration to the default location.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::default_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
