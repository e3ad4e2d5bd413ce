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

//! Time-boxed peripheral discovery.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::transport::LinkTransport;
use crate::error::GatewayError;
use crate::events::GatewayEvent;

/// Cached view of a peripheral sighted during the current window.
#[derive(Debug, Clone)]
pub struct SeenDevice {
    pub name: Option<String>,
    pub rssi: Option<i16>,
}

/// Discovery notifications emitted by the scanner.
#[derive(Debug, Clone)]
pub enum ScanEvent {
    Started,
    Stopped,
    /// First sighting of an identity within the current window.
    DeviceFound {
        identity: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
}

struct ScanWindow {
    running: bool,
    generation: u64,
    seen: HashMap<String, SeenDevice>,
}

/// Runs timed discovery windows and deduplicates sightings by identity.
///
/// Re-sightings within a window update the cached name and signal strength
/// but are not re-reported; callers wanting live updates poll
/// [`Scanner::discovered`] instead of the event stream.
pub struct Scanner {
    transport: Arc<dyn LinkTransport>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    window_duration: Duration,
    window: Mutex<ScanWindow>,
}

impl Scanner {
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        events: mpsc::UnboundedSender<GatewayEvent>,
        window_duration: Duration,
    ) -> Self {
        Self {
            transport,
            events,
            window_duration,
            window: Mutex::new(ScanWindow {
                running: false,
                generation: 0,
                seen: HashMap::new(),
            }),
        }
    }

    /// Begin a discovery window; auto-stops after the configured duration.
    pub async fn start(&self) -> Result<(), GatewayError> {
        let generation = {
            let mut window = self.window.lock();
            if window.running {
                return Err(GatewayError::ScanBusy);
            }
            window.running = true;
            window.generation += 1;
            window.seen.clear();
            window.generation
        };

        if let Err(e) = self.transport.scan_start().await {
            self.window.lock().running = false;
            return Err(e);
        }

        info!("Scan started ({:?} window)", self.window_duration);
        self.emit(ScanEvent::Started);

        let events = self.events.clone();
        let duration = self.window_duration;
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = events.send(GatewayEvent::ScanWindowElapsed { window: generation });
        });

        Ok(())
    }

    /// End the discovery window; idempotent.
    pub async fn stop(&self) {
        {
            let mut window = self.window.lock();
            if !window.running {
                return;
            }
            window.running = false;
        }
        self.transport.scan_stop().await;
        info!("Scan stopped");
        self.emit(ScanEvent::Stopped);
    }

    /// A window timer elapsed; stop only if it is still the current window.
    pub async fn on_window_elapsed(&self, generation: u64) {
        let current = {
            let window = self.window.lock();
            window.running && window.generation == generation
        };
        if current {
            debug!("Scan window elapsed");
            self.stop().await;
        }
    }

    /// Record a sighting; first sighting per window is reported.
    pub fn on_device_seen(&self, identity: &str, name: Option<String>, rssi: Option<i16>) {
        let mut window = self.window.lock();
        if !window.running {
            return;
        }

        match window.seen.get_mut(identity) {
            Some(cached) => {
                // A sighting without a name or signal reading keeps the
                // last known value.
                if name.is_some() {
                    cached.name = name;
                }
                if rssi.is_some() {
                    cached.rssi = rssi;
                }
            }
            None => {
                debug!("Device found: {} (rssi {:?})", identity, rssi);
                window.seen.insert(
                    identity.to_string(),
                    SeenDevice {
                        name: name.clone(),
                        rssi,
                    },
                );
                drop(window);
                self.emit(ScanEvent::DeviceFound {
                    identity: identity.to_string(),
                    name,
                    rssi,
                });
            }
        }
    }

    /// Copy of the devices sighted in the current or last window.
    pub fn discovered(&self) -> HashMap<String, SeenDevice> {
        self.window.lock().seen.clone()
    }

    pub fn is_running(&self) -> bool {
        self.window.lock().running
    }

    fn emit(&self, event: ScanEvent) {
        let _ = self.events.send(GatewayEvent::Scan(event));
    }
}
