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

//! BLE-to-MQTT gateway daemon.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ble2mqtt::bluetooth::{BluerLink, ConnectionPool, LinkFacade, PoolSettings, Scanner};
use ble2mqtt::bridge::DataBridge;
use ble2mqtt::cloud::MqttPublisher;
use ble2mqtt::config::Config;
use ble2mqtt::events::{EventProcessor, GatewayEvent};
use ble2mqtt::metrics::MetricsAggregator;
use ble2mqtt::monitor::ResourceMonitor;
use ble2mqtt::state::GatewayState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ble2mqtt=info".parse().unwrap()),
        )
        .init();

    info!("Starting ble2mqtt v{}...", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    let (event_tx, event_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    // Bluetooth link layer
    let link = Arc::new(BluerLink::new(event_tx.clone()).await?);

    // Cloud publish transport
    let publisher = Arc::new(MqttPublisher::new(&config.cloud));

    // Gateway core
    let metrics = Arc::new(MetricsAggregator::new(config.metrics.clone()));
    let state = Arc::new(GatewayState::new());
    let pool = Arc::new(ConnectionPool::new(
        link.clone(),
        event_tx.clone(),
        PoolSettings {
            max_sessions: config.bluetooth.max_concurrent_sessions,
            reconnect_base_delay: Duration::from_millis(config.bluetooth.reconnect_base_delay_ms),
            max_reconnect_attempts: config.bluetooth.max_reconnect_attempts,
        },
    ));
    let facade = Arc::new(LinkFacade::new(link.clone()));
    let scanner = Arc::new(Scanner::new(
        link.clone(),
        event_tx.clone(),
        Duration::from_millis(config.bluetooth.scan_window_ms),
    ));
    let bridge = Arc::new(DataBridge::new(
        publisher.clone(),
        metrics.clone(),
        state.clone(),
    ));

    let monitor = ResourceMonitor::spawn(
        metrics.clone(),
        Duration::from_millis(config.metrics.resource_sample_interval_ms),
    );

    let processor = EventProcessor::new(
        event_tx.clone(),
        pool.clone(),
        facade,
        scanner.clone(),
        bridge,
        metrics,
        state,
        config.bluetooth.auto_connect.clone(),
    );
    let dispatch = tokio::spawn(async move { processor.run(event_rx).await });

    // Kick off an initial discovery window; auto-connect devices are
    // connected as they are sighted.
    if let Err(e) = scanner.start().await {
        warn!("Initial scan failed: {}", e);
    }

    info!("Gateway running");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    scanner.stop().await;
    pool.disconnect_all().await;
    monitor.stop();
    publisher.shutdown().await;
    dispatch.abort();

    info!("ble2mqtt stopped");
    Ok(())
}
