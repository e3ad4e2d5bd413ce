// Copyright 2026 ble2mqtt contributors
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
//! Handles loading and saving gateway settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth link settings.
    pub bluetooth: BluetoothConfig,

    /// MQTT broker settings.
    pub cloud: CloudConfig,

    /// Telemetry settings.
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Admission ceiling for concurrently open device sessions.
    pub max_concurrent_sessions: usize,

    /// Discovery window duration before the scan auto-stops.
    pub scan_window_ms: u64,

    /// Base delay for the linear reconnect backoff.
    pub reconnect_base_delay_ms: u64,

    /// Retry budget before a dropped session is given up.
    pub max_reconnect_attempts: u32,

    /// Device addresses to connect to as soon as they are discovered.
    pub auto_connect: Vec<String>,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sessions: 5,
            scan_window_ms: 10_000,
            reconnect_base_delay_ms: 3_000,
            max_reconnect_attempts: 3,
            auto_connect: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudConfig {
    /// MQTT broker hostname.
    pub broker_host: String,

    /// MQTT broker port.
    pub broker_port: u16,

    /// MQTT client id. A random suffix is generated when unset.
    pub client_id: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Ring buffer size for each metric stream.
    pub history_capacity: usize,

    /// Eviction age for the receive-timestamp pairing table.
    pub stale_pairing_window_ms: u64,

    /// Per-message broker cost in USD, used for cost projection.
    pub cost_per_message_usd: f64,

    /// Interval between host resource samples.
    pub resource_sample_interval_ms: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            history_capacity: 60,
            stale_pairing_window_ms: 30_000,
            cost_per_message_usd: 0.000001,
            resource_sample_interval_ms: 1_000,
        }
    }
}

impl Config {
    /// Load configuration from the default location or create it.
    pub fn load() -> Result<Self> {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ble2mqtt");

        std::fs::create_dir_all(&config_dir)?;

        Self::load_from(&config_dir.join("config.toml"))
    }

    /// Load configuration from a specific path, writing defaults if absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
