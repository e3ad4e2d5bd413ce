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

//! Queryable gateway state.
//!
//! Holds the user-visible view of the gateway: per-device status and last
//! error, scan activity, pool occupancy and cumulative forwarding counters.
//! Consumers poll snapshots; the event processor is the only writer.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Last known status of one device, kept after disconnect.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    pub identity: String,
    pub display_name: Option<String>,
    pub state: String,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Full point-in-time view for the presentation layer.
#[derive(Debug, Clone, Default)]
pub struct GatewaySnapshot {
    pub devices: Vec<DeviceStatus>,
    pub scanning: bool,
    pub pool_active: usize,
    pub pool_max: usize,
    pub notifications_received: u64,
    pub publishes_succeeded: u64,
    pub publishes_failed: u64,
    pub writes_acked: u64,
    pub writes_failed: u64,
}

#[derive(Default)]
struct StateInner {
    devices: HashMap<String, DeviceStatus>,
    scanning: bool,
    pool_active: usize,
    pool_max: usize,
    notifications_received: u64,
    publishes_succeeded: u64,
    publishes_failed: u64,
    writes_acked: u64,
    writes_failed: u64,
}

#[derive(Default)]
pub struct GatewayState {
    inner: RwLock<StateInner>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_device_state(&self, identity: &str, name: Option<&str>, state: &str) {
        let mut inner = self.inner.write();
        let entry = inner
            .devices
            .entry(identity.to_string())
            .or_insert_with(|| DeviceStatus {
                identity: identity.to_string(),
                display_name: None,
                state: String::new(),
                last_error: None,
                updated_at: Utc::now(),
            });
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            entry.display_name = Some(name.to_string());
        }
        entry.state = state.to_string();
        entry.updated_at = Utc::now();
    }

    /// Record a device error, creating the status entry if the device never
    /// reached a tracked state (a synchronous open failure, for instance).
    pub fn set_device_error(&self, identity: &str, error: &str) {
        let mut inner = self.inner.write();
        let entry = inner
            .devices
            .entry(identity.to_string())
            .or_insert_with(|| DeviceStatus {
                identity: identity.to_string(),
                display_name: None,
                state: "Disconnected".to_string(),
                last_error: None,
                updated_at: Utc::now(),
            });
        entry.last_error = Some(error.to_string());
        entry.updated_at = Utc::now();
    }

    pub fn set_scanning(&self, scanning: bool) {
        self.inner.write().scanning = scanning;
    }

    pub fn set_occupancy(&self, active: usize, max: usize) {
        let mut inner = self.inner.write();
        inner.pool_active = active;
        inner.pool_max = max;
    }

    pub fn record_receive(&self) {
        self.inner.write().notifications_received += 1;
    }

    pub fn record_publish(&self, success: bool) {
        let mut inner = self.inner.write();
        if success {
            inner.publishes_succeeded += 1;
        } else {
            inner.publishes_failed += 1;
        }
    }

    pub fn record_write_ack(&self, success: bool) {
        let mut inner = self.inner.write();
        if success {
            inner.writes_acked += 1;
        } else {
            inner.writes_failed += 1;
        }
    }

    pub fn device(&self, identity: &str) -> Option<DeviceStatus> {
        self.inner.read().devices.get(identity).cloned()
    }

    pub fn snapshot(&self) -> GatewaySnapshot {
        let inner = self.inner.read();
        let mut devices: Vec<DeviceStatus> = inner.devices.values().cloned().collect();
        devices.sort_by(|a, b| a.identity.cmp(&b.identity));
        GatewaySnapshot {
            devices,
            scanning: inner.scanning,
            pool_active: inner.pool_active,
            pool_max: inner.pool_max,
            notifications_received: inner.notifications_received,
            publishes_succeeded: inner.publishes_succeeded,
            publishes_failed: inner.publishes_failed,
            writes_acked: inner.writes_acked,
            writes_failed: inner.writes_failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_status_survives_disconnect() {
        let state = GatewayState::new();
        state.set_device_state("AA", Some("Sensor"), "Ready");
        state.set_device_error("AA", "link open failed");
        state.set_device_state("AA", None, "Disconnected");

        let status = state.device("AA").unwrap();
        assert_eq!(status.state, "Disconnected");
        assert_eq!(status.display_name.as_deref(), Some("Sensor"));
        assert_eq!(status.last_error.as_deref(), Some("link open failed"));
    }

    #[test]
    fn test_counters() {
        let state = GatewayState::new();
        state.record_receive();
        state.record_publish(true);
        state.record_publish(false);
        state.record_publish(true);
        state.record_write_ack(true);
        state.record_write_ack(false);

        let snapshot = state.snapshot();
        assert_eq!(snapshot.notifications_received, 1);
        assert_eq!(snapshot.publishes_succeeded, 2);
        assert_eq!(snapshot.publishes_failed, 1);
        assert_eq!(snapshot.writes_acked, 1);
        assert_eq!(snapshot.writes_failed, 1);
    }

    #[test]
    fn test_error_creates_status_entry() {
        let state = GatewayState::new();
        state.set_device_error("AA", "link open failed");

        let status = state.device("AA").unwrap();
        assert_eq!(status.state, "Disconnected");
        assert_eq!(status.last_error.as_deref(), Some("link open failed"));
    }

    #[test]
    fn test_snapshot_sorted_by_identity() {
        let state = GatewayState::new();
        state.set_device_state("CC", None, "Ready");
        state.set_device_state("AA", None, "Connecting");
        let snapshot = state.snapshot();
        assert_eq!(snapshot.devices[0].identity, "AA");
        assert_eq!(snapshot.devices[1].identity, "CC");
    }
}
