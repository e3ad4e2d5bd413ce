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

//! Host resource sampling.

use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Networks, System};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::metrics::MetricsAggregator;

/// Periodically samples CPU, memory and network usage into the metrics
/// history.
pub struct ResourceMonitor {
    task: JoinHandle<()>,
}

impl ResourceMonitor {
    pub fn spawn(metrics: Arc<MetricsAggregator>, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut sys = System::new();
            let mut networks = Networks::new_with_refreshed_list();
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                sys.refresh_cpu_usage();
                sys.refresh_memory();
                networks.refresh();

                let cpu_percent = sys.global_cpu_info().cpu_usage();
                let memory_used_mb = sys.used_memory() / (1024 * 1024);
                let memory_total_mb = sys.total_memory() / (1024 * 1024);
                // Bytes moved since the previous refresh, over all interfaces.
                let bytes: u64 = networks
                    .iter()
                    .map(|(_, data)| data.received() + data.transmitted())
                    .sum();
                let network_kbps = bytes as f64 / 1024.0 / interval.as_secs_f64();

                debug!(
                    "Resource sample: cpu {:.1}%, mem {}/{} MB, net {:.1} KB/s",
                    cpu_percent, memory_used_mb, memory_total_mb, network_kbps
                );
                metrics.record_resource(cpu_percent, memory_used_mb, memory_total_mb, network_kbps);
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for ResourceMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
