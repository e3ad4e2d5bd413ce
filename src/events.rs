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

//! Central event dispatch.
//!
//! Everything that happens in the gateway arrives on one channel: link
//! transport events, pool and scanner notifications, and elapsed timers.
//! The processor consumes them in arrival order, so state transitions for
//! any one device are serialized without further locking.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bluetooth::pool::{ConnectionPool, PoolEvent};
use crate::bluetooth::scanner::{ScanEvent, Scanner};
use crate::bluetooth::transport::LinkEvent;
use crate::bluetooth::{DiscoveredCapabilities, LinkFacade};
use crate::bridge::{DataBridge, InboundMessage};
use crate::error::GatewayError;
use crate::metrics::MetricsAggregator;
use crate::state::GatewayState;

/// Union of everything the dispatch loop consumes.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    Link(LinkEvent),
    Pool(PoolEvent),
    Scan(ScanEvent),
    /// Capability discovery finished on a worker task.
    CapabilitiesResolved {
        identity: String,
        result: Result<DiscoveredCapabilities, GatewayError>,
    },
    /// A scheduled reconnect delay elapsed.
    ReconnectDue { identity: String },
    /// A scan window timer elapsed.
    ScanWindowElapsed { window: u64 },
}

/// Owns the dispatch loop and wires the gateway components together.
pub struct EventProcessor {
    events: mpsc::UnboundedSender<GatewayEvent>,
    pool: Arc<ConnectionPool>,
    facade: Arc<LinkFacade>,
    scanner: Arc<Scanner>,
    bridge: Arc<DataBridge>,
    metrics: Arc<MetricsAggregator>,
    state: Arc<GatewayState>,
    auto_connect: Vec<String>,
}

impl EventProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        events: mpsc::UnboundedSender<GatewayEvent>,
        pool: Arc<ConnectionPool>,
        facade: Arc<LinkFacade>,
        scanner: Arc<Scanner>,
        bridge: Arc<DataBridge>,
        metrics: Arc<MetricsAggregator>,
        state: Arc<GatewayState>,
        auto_connect: Vec<String>,
    ) -> Self {
        Self {
            events,
            pool,
            facade,
            scanner,
            bridge,
            metrics,
            state,
            auto_connect,
        }
    }

    /// Consume events until the channel closes. Also drives the metrics
    /// sample clock at 1 Hz.
    pub async fn run(&self, mut rx: mpsc::UnboundedReceiver<GatewayEvent>) {
        let mut sample_clock = tokio::time::interval(Duration::from_secs(1));
        sample_clock.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!("Event processor started");
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else {
                        info!("Event channel closed, processor stopping");
                        break;
                    };
                    self.handle_event(event).await;
                }
                _ = sample_clock.tick() => {
                    self.metrics.tick();
                }
            }
        }
    }

    pub async fn handle_event(&self, event: GatewayEvent) {
        match event {
            GatewayEvent::Link(event) => self.handle_link_event(event).await,
            GatewayEvent::Pool(event) => self.handle_pool_event(event),
            GatewayEvent::Scan(event) => self.handle_scan_event(event).await,
            GatewayEvent::CapabilitiesResolved { identity, result } => {
                self.on_capabilities_resolved(identity, result).await;
            }
            GatewayEvent::ReconnectDue { identity } => {
                self.pool.retry(&identity).await;
            }
            GatewayEvent::ScanWindowElapsed { window } => {
                self.scanner.on_window_elapsed(window).await;
            }
        }
    }

    async fn handle_link_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::DeviceDiscovered {
                identity,
                name,
                rssi,
            } => {
                self.scanner.on_device_seen(&identity, name, rssi);
            }
            LinkEvent::LinkUp { identity, name } => {
                self.pool.on_link_up(&identity, name.as_deref());
                self.pool.mark_discovering(&identity);
                // Discovery is a remote round-trip; run it on a worker so a
                // slow device cannot stall dispatch for the others. The
                // outcome loops back onto the channel.
                let facade = self.facade.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = facade.discover_capabilities(&identity).await;
                    if let Ok(caps) = &result {
                        if caps.notify.is_some() && !facade.enable_notifications(&identity).await {
                            warn!("Failed to enable notifications on {}", identity);
                        }
                    }
                    let _ = events.send(GatewayEvent::CapabilitiesResolved { identity, result });
                });
            }
            LinkEvent::LinkDown { identity } => {
                self.facade.release(&identity);
                self.pool.on_link_down(&identity);
            }
            LinkEvent::Notification {
                identity,
                channel,
                payload,
            } => {
                self.metrics.record_receive(&identity);
                self.state.record_receive();
                let message = InboundMessage::new(
                    &identity,
                    self.pool.display_name(&identity),
                    channel,
                    payload,
                );
                if let Err(e) = self.bridge.forward(&message).await {
                    debug!("Forward failed for {}: {}", identity, e);
                }
            }
            LinkEvent::WriteAck { identity, success } => {
                debug!("Write ack from {}: success={}", identity, success);
                self.state.record_write_ack(success);
            }
        }
    }

    async fn on_capabilities_resolved(
        &self,
        identity: String,
        result: Result<DiscoveredCapabilities, GatewayError>,
    ) {
        match result {
            Ok(_) => self.pool.on_capabilities_ready(&identity),
            Err(e) => {
                error!("Capability discovery failed on {}: {}", identity, e);
                self.state.set_device_error(&identity, &e.to_string());
                self.pool.on_capability_failure(&identity, e).await;
            }
        }
    }

    fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Connected { identity, name } => {
                self.state
                    .set_device_state(&identity, name.as_deref(), "Connected");
            }
            PoolEvent::Ready { identity } => {
                self.state.set_device_state(&identity, None, "Ready");
            }
            PoolEvent::Disconnected { identity, name } => {
                self.state
                    .set_device_state(&identity, name.as_deref(), "Disconnected");
            }
            PoolEvent::Reconnecting { identity, attempt } => {
                self.state.set_device_state(&identity, None, "Reconnecting");
                debug!("Reconnect attempt {} pending for {}", attempt, identity);
            }
            PoolEvent::Error { identity, error } => {
                self.state.set_device_error(&identity, &error.to_string());
            }
            PoolEvent::Failed { identity, error } => {
                error!("Device {} failed: {}", identity, error);
                self.state.set_device_error(&identity, &error.to_string());
            }
            PoolEvent::Occupancy { active, max } => {
                self.state.set_occupancy(active, max);
            }
        }
    }

    async fn handle_scan_event(&self, event: ScanEvent) {
        match event {
            ScanEvent::Started => self.state.set_scanning(true),
            ScanEvent::Stopped => self.state.set_scanning(false),
            ScanEvent::DeviceFound { identity, name, .. } => {
                if self.auto_connect.iter().any(|a| a == &identity) {
                    info!(
                        "Auto-connecting {} ({})",
                        identity,
                        name.as_deref().unwrap_or("unknown")
                    );
                    if let Err(e) = self.pool.connect(&identity, 0).await {
                        warn!("Auto-connect failed for {}: {}", identity, e);
                    }
                }
            }
        }
    }
}
