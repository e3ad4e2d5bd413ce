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

//! BlueZ-backed link transport.
//!
//! Bridges the BlueZ D-Bus API onto [`LinkTransport`]: open/close map to
//! device connect/disconnect, discovery enumerates GATT services and
//! characteristics, and notification streams are pumped onto the gateway
//! event channel by per-characteristic tasks.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::WriteOp;
use bluer::{Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::transport::{LinkEvent, LinkTransport, SubChannel};
use crate::error::GatewayError;
use crate::events::GatewayEvent;

/// Per-link bookkeeping: the monitor task, notification pumps and the
/// characteristic handles resolved during discovery.
struct OpenLink {
    monitor: JoinHandle<()>,
    notify_pumps: HashMap<(String, String), JoinHandle<()>>,
    characteristics: HashMap<(String, String), Characteristic>,
}

impl OpenLink {
    fn abort_tasks(&mut self) {
        self.monitor.abort();
        for (_, pump) in self.notify_pumps.drain() {
            pump.abort();
        }
    }
}

/// [`LinkTransport`] implementation over the system BlueZ daemon.
pub struct BluerLink {
    adapter: Adapter,
    events: mpsc::UnboundedSender<GatewayEvent>,
    links: Mutex<HashMap<String, OpenLink>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BluerLink {
    /// Connect to the BlueZ daemon and power on the default adapter.
    pub async fn new(events: mpsc::UnboundedSender<GatewayEvent>) -> Result<Self> {
        let session = Session::new()
            .await
            .context("Failed to connect to BlueZ daemon")?;
        let adapter = session
            .default_adapter()
            .await
            .context("No Bluetooth adapter found")?;
        adapter
            .set_powered(true)
            .await
            .context("Failed to power on adapter")?;

        info!("Bluetooth adapter ready: {}", adapter.name());

        Ok(Self {
            adapter,
            events,
            links: Mutex::new(HashMap::new()),
            scan_task: Mutex::new(None),
        })
    }

    fn parse_address(identity: &str) -> Result<Address, GatewayError> {
        identity
            .parse::<Address>()
            .map_err(|e| GatewayError::LinkOpenFailed {
                identity: identity.to_string(),
                reason: format!("invalid address: {e}"),
            })
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.events.send(GatewayEvent::Link(event));
    }

    /// Connect and then watch for the link dropping. Runs as a task so
    /// `open` returns as soon as the request is issued; link-up, link-down
    /// and failures all arrive as events.
    fn spawn_monitor(&self, identity: String, device: bluer::Device) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = device.connect().await {
                warn!("Connect failed for {}: {}", identity, e);
                let _ = events.send(GatewayEvent::Link(LinkEvent::LinkDown {
                    identity: identity.clone(),
                }));
                return;
            }

            let name = device.name().await.ok().flatten();
            let _ = events.send(GatewayEvent::Link(LinkEvent::LinkUp {
                identity: identity.clone(),
                name,
            }));

            let Ok(mut changes) = device.events().await else {
                let _ = events.send(GatewayEvent::Link(LinkEvent::LinkDown { identity }));
                return;
            };
            while let Some(event) = changes.next().await {
                let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event
                else {
                    continue;
                };
                if !connected {
                    break;
                }
            }
            let _ = events.send(GatewayEvent::Link(LinkEvent::LinkDown { identity }));
        })
    }
}

#[async_trait]
impl LinkTransport for BluerLink {
    async fn open(&self, identity: &str) -> Result<(), GatewayError> {
        let address = Self::parse_address(identity)?;
        let device = self
            .adapter
            .device(address)
            .map_err(|e| GatewayError::LinkOpenFailed {
                identity: identity.to_string(),
                reason: e.to_string(),
            })?;

        let monitor = self.spawn_monitor(identity.to_string(), device);
        let mut links = self.links.lock();
        if let Some(mut stale) = links.insert(
            identity.to_string(),
            OpenLink {
                monitor,
                notify_pumps: HashMap::new(),
                characteristics: HashMap::new(),
            },
        ) {
            stale.abort_tasks();
        }
        Ok(())
    }

    async fn close(&self, identity: &str) {
        let link = self.links.lock().remove(identity);
        let Some(mut link) = link else { return };
        link.abort_tasks();

        let device = Self::parse_address(identity)
            .ok()
            .and_then(|a| self.adapter.device(a).ok());
        if let Some(device) = device {
            if let Err(e) = device.disconnect().await {
                warn!("Disconnect failed for {}: {}", identity, e);
            }
        }

        // The monitor is gone, so deliver the link-down ourselves.
        self.emit(LinkEvent::LinkDown {
            identity: identity.to_string(),
        });
    }

    async fn discover(&self, identity: &str) -> Result<Vec<SubChannel>, GatewayError> {
        let address = Self::parse_address(identity)?;
        let map_err = |e: bluer::Error| GatewayError::CapabilityDiscoveryFailed {
            identity: identity.to_string(),
            reason: e.to_string(),
        };

        let device = self.adapter.device(address).map_err(map_err)?;

        let mut channels = Vec::new();
        let mut handles = HashMap::new();
        for service in device.services().await.map_err(map_err)? {
            let service_id = service.uuid().await.map_err(map_err)?.to_string();
            for characteristic in service.characteristics().await.map_err(map_err)? {
                let id = characteristic.uuid().await.map_err(map_err)?.to_string();
                let flags = characteristic.flags().await.map_err(map_err)?;
                channels.push(SubChannel {
                    service: service_id.clone(),
                    id: id.clone(),
                    notify: flags.notify,
                    write: flags.write,
                    write_without_response: flags.write_without_response,
                });
                handles.insert((service_id.clone(), id), characteristic);
            }
        }

        debug!("Discovered {} sub-channels on {}", channels.len(), identity);

        let mut links = self.links.lock();
        match links.get_mut(identity) {
            Some(link) => link.characteristics = handles,
            None => {
                return Err(GatewayError::CapabilityDiscoveryFailed {
                    identity: identity.to_string(),
                    reason: "link is not open".to_string(),
                })
            }
        }
        Ok(channels)
    }

    async fn set_notify(&self, identity: &str, channel: &SubChannel, enabled: bool) -> bool {
        let key = (channel.service.clone(), channel.id.clone());

        if !enabled {
            let pump = self
                .links
                .lock()
                .get_mut(identity)
                .and_then(|l| l.notify_pumps.remove(&key));
            if let Some(pump) = pump {
                pump.abort();
            }
            return true;
        }

        let characteristic = self
            .links
            .lock()
            .get(identity)
            .and_then(|l| l.characteristics.get(&key).cloned());
        let Some(characteristic) = characteristic else {
            warn!("No characteristic {} on {}", channel.id, identity);
            return false;
        };

        let stream = match characteristic.notify().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Notify subscribe failed on {}: {}", identity, e);
                return false;
            }
        };

        let events = self.events.clone();
        let identity_owned = identity.to_string();
        let channel_owned = channel.clone();
        let pump = tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(payload) = stream.next().await {
                let _ = events.send(GatewayEvent::Link(LinkEvent::Notification {
                    identity: identity_owned.clone(),
                    channel: channel_owned.clone(),
                    payload,
                }));
            }
        });

        if let Some(link) = self.links.lock().get_mut(identity) {
            if let Some(stale) = link.notify_pumps.insert(key, pump) {
                stale.abort();
            }
        } else {
            pump.abort();
            return false;
        }
        true
    }

    async fn write(&self, identity: &str, channel: &SubChannel, payload: &[u8]) -> bool {
        let key = (channel.service.clone(), channel.id.clone());
        let characteristic = self
            .links
            .lock()
            .get(identity)
            .and_then(|l| l.characteristics.get(&key).cloned());
        let Some(characteristic) = characteristic else {
            warn!("No characteristic {} on {}", channel.id, identity);
            return false;
        };

        let op_type = if channel.write {
            WriteOp::Request
        } else {
            WriteOp::Command
        };
        let request = CharacteristicWriteRequest {
            op_type,
            ..Default::default()
        };

        let success = match characteristic.write_ext(payload, &request).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Write failed on {}: {}", identity, e);
                false
            }
        };
        self.emit(LinkEvent::WriteAck {
            identity: identity.to_string(),
            success,
        });
        success
    }

    async fn scan_start(&self) -> Result<(), GatewayError> {
        if self.scan_task.lock().is_some() {
            return Ok(());
        }

        let discover = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| match e.kind {
                bluer::ErrorKind::InProgress => GatewayError::ScanBusy,
                _ => GatewayError::PermissionMissing(e.to_string()),
            })?;

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let task = tokio::spawn(async move {
            futures::pin_mut!(discover);
            while let Some(event) = discover.next().await {
                let AdapterEvent::DeviceAdded(address) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(address) else {
                    continue;
                };
                let name = device.name().await.ok().flatten();
                let rssi = device.rssi().await.ok().flatten();
                let _ = events.send(GatewayEvent::Link(LinkEvent::DeviceDiscovered {
                    identity: address.to_string(),
                    name,
                    rssi,
                }));
            }
        });

        *self.scan_task.lock() = Some(task);
        Ok(())
    }

    async fn scan_stop(&self) {
        // Dropping the discovery stream releases the BlueZ discovery session.
        if let Some(task) = self.scan_task.lock().take() {
            task.abort();
        }
    }
}
