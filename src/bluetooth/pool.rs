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

//! Multi-device connection pool.
//!
//! Admission control under a hard concurrency ceiling, per-device session
//! state machines, and reconnection with escalating delay and a bounded
//! retry count.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::transport::LinkTransport;
use crate::error::GatewayError;
use crate::events::GatewayEvent;

/// Per-session connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    DiscoveringCapabilities,
    Ready,
    Reconnecting,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::DiscoveringCapabilities => "Discovering",
            SessionState::Ready => "Ready",
            SessionState::Reconnecting => "Reconnecting",
        }
    }
}

/// The pool's record of one device session.
#[derive(Debug, Clone)]
pub struct DeviceSession {
    pub identity: String,
    pub display_name: Option<String>,
    pub state: SessionState,
    pub connect_time: Option<DateTime<Utc>>,
    pub reconnect_attempts: u32,
    /// Set by an explicit disconnect; suppresses reconnection.
    closing: bool,
}

impl DeviceSession {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            display_name: None,
            state: SessionState::Connecting,
            connect_time: None,
            reconnect_attempts: 0,
            closing: false,
        }
    }
}

/// Ephemeral admission request; not persisted beyond the decision.
#[derive(Debug)]
struct ConnectionRequest {
    identity: String,
    priority: i32,
    requested_at: DateTime<Utc>,
}

/// Outcome of an accepted connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A new session was created and the open call was issued.
    Accepted,
    /// The identity already has a live session; no-op success.
    AlreadyActive,
}

/// Lifecycle notifications emitted by the pool.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Connected {
        identity: String,
        name: Option<String>,
    },
    Ready {
        identity: String,
    },
    Disconnected {
        identity: String,
        name: Option<String>,
    },
    Reconnecting {
        identity: String,
        attempt: u32,
    },
    /// A recoverable per-device error, reported while the retry budget lasts.
    Error {
        identity: String,
        error: GatewayError,
    },
    /// The session was removed after exhausting its retry budget.
    Failed {
        identity: String,
        error: GatewayError,
    },
    Occupancy {
        active: usize,
        max: usize,
    },
}

/// Pool tuning knobs, taken from [`crate::config::BluetoothConfig`].
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_sessions: usize,
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
}

/// Admission control and lifecycle orchestration for all device sessions.
///
/// State transitions for a single identity are serialized by the dispatch
/// loop; the session table itself is concurrency-safe because open/close
/// completions may arrive from worker tasks.
pub struct ConnectionPool {
    transport: Arc<dyn LinkTransport>,
    events: mpsc::UnboundedSender<GatewayEvent>,
    settings: PoolSettings,
    sessions: Mutex<HashMap<String, DeviceSession>>,
}

impl ConnectionPool {
    pub fn new(
        transport: Arc<dyn LinkTransport>,
        events: mpsc::UnboundedSender<GatewayEvent>,
        settings: PoolSettings,
    ) -> Self {
        Self {
            transport,
            events,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Request admission for a device and issue the underlying open call.
    ///
    /// Connecting an identity that already has a live session is a no-op
    /// success. A pool at capacity rejects with `AdmissionDenied`; the
    /// caller may retry later, the pool does not queue.
    pub async fn connect(&self, identity: &str, priority: i32) -> Result<Admission, GatewayError> {
        let request = ConnectionRequest {
            identity: identity.to_string(),
            priority,
            requested_at: Utc::now(),
        };

        {
            let mut sessions = self.sessions.lock();

            if let Some(session) = sessions.get(identity) {
                if session.state != SessionState::Disconnected {
                    debug!("Device already active, ignoring connect: {}", identity);
                    return Ok(Admission::AlreadyActive);
                }
            }

            if sessions.len() >= self.settings.max_sessions {
                warn!(
                    "Admission denied for {} (pool {}/{})",
                    identity,
                    sessions.len(),
                    self.settings.max_sessions
                );
                return Err(GatewayError::AdmissionDenied {
                    active: sessions.len(),
                    max: self.settings.max_sessions,
                });
            }

            debug!(
                "Admitting {} (priority {}, requested {})",
                request.identity, request.priority, request.requested_at
            );
            sessions.insert(identity.to_string(), DeviceSession::new(identity));
        }
        self.emit_occupancy();

        match self.transport.open(identity).await {
            Ok(()) => {
                info!("Connecting to device: {}", identity);
                Ok(Admission::Accepted)
            }
            Err(e) => {
                // Synchronous open failure discards the session outright.
                self.sessions.lock().remove(identity);
                self.emit_occupancy();
                let error = GatewayError::LinkOpenFailed {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                };
                self.emit(PoolEvent::Failed {
                    identity: identity.to_string(),
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    /// Explicitly disconnect a device; terminal, never reconnects.
    ///
    /// Disconnecting an absent identity is a no-op.
    pub async fn disconnect(&self, identity: &str) {
        let close_link = {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(identity) {
                None => return,
                Some(session) if session.state == SessionState::Reconnecting => {
                    // No live link to close; drop the session and cancel the
                    // pending retry by absence.
                    let name = session.display_name.clone();
                    sessions.remove(identity);
                    self.emit(PoolEvent::Disconnected {
                        identity: identity.to_string(),
                        name,
                    });
                    false
                }
                Some(session) => {
                    session.closing = true;
                    true
                }
            }
        };

        if close_link {
            info!("Disconnecting device: {}", identity);
            self.transport.close(identity).await;
        } else {
            self.emit_occupancy();
        }
    }

    /// Disconnect every live session.
    pub async fn disconnect_all(&self) {
        let identities: Vec<String> = self.sessions.lock().keys().cloned().collect();
        info!("Disconnecting all devices ({})", identities.len());
        for identity in identities {
            self.disconnect(&identity).await;
        }
    }

    /// Link-up completion: Connecting/Reconnecting -> Connected.
    pub fn on_link_up(&self, identity: &str, name: Option<&str>) {
        let event = {
            let mut sessions = self.sessions.lock();
            let Some(session) = sessions.get_mut(identity) else {
                warn!("Link up for unknown session: {}", identity);
                return;
            };
            session.state = SessionState::Connected;
            session.connect_time = Some(Utc::now());
            if let Some(name) = name.filter(|n| !n.is_empty()) {
                // Last known non-empty name wins.
                session.display_name = Some(name.to_string());
            }
            PoolEvent::Connected {
                identity: identity.to_string(),
                name: session.display_name.clone(),
            }
        };
        info!("Device connected: {}", identity);
        self.emit(event);
    }

    /// Capability discovery has started on a connected link.
    pub fn mark_discovering(&self, identity: &str) {
        let mut sessions = self.sessions.lock();
        if let Some(session) = sessions.get_mut(identity) {
            if session.state == SessionState::Connected {
                session.state = SessionState::DiscoveringCapabilities;
            }
        }
    }

    /// Capability discovery succeeded: session is promoted to Ready.
    ///
    /// Discovery runs on a worker, so the link may have dropped in the
    /// meantime; a result for a session no longer on a live link is stale
    /// and ignored.
    pub fn on_capabilities_ready(&self, identity: &str) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(identity) else {
            return;
        };
        if !matches!(
            session.state,
            SessionState::Connected | SessionState::DiscoveringCapabilities
        ) {
            debug!("Stale capability result for {} ignored", identity);
            return;
        }
        session.state = SessionState::Ready;
        session.reconnect_attempts = 0;
        drop(sessions);
        info!("Device ready: {}", identity);
        self.emit(PoolEvent::Ready {
            identity: identity.to_string(),
        });
    }

    /// Capability discovery failed; counts toward the reconnect budget.
    pub async fn on_capability_failure(&self, identity: &str, error: GatewayError) {
        {
            let sessions = self.sessions.lock();
            match sessions.get(identity) {
                Some(session)
                    if matches!(
                        session.state,
                        SessionState::Connected | SessionState::DiscoveringCapabilities
                    ) => {}
                _ => {
                    debug!("Stale capability failure for {} ignored", identity);
                    return;
                }
            }
        }
        warn!("Capability discovery failed for {}: {}", identity, error);
        self.emit(PoolEvent::Error {
            identity: identity.to_string(),
            error,
        });
        // Closing the link produces the link-down event that drives the
        // normal reconnect evaluation.
        self.transport.close(identity).await;
    }

    /// Link dropped or closed: evaluate cleanup and reconnection.
    pub fn on_link_down(&self, identity: &str) {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(identity) else {
            return;
        };

        session.state = SessionState::Disconnected;
        let name = session.display_name.clone();
        let closing = session.closing;
        let attempts = session.reconnect_attempts;

        if closing || attempts >= self.settings.max_reconnect_attempts {
            sessions.remove(identity);
            drop(sessions);
            info!("Device disconnected: {}", identity);
            self.emit(PoolEvent::Disconnected {
                identity: identity.to_string(),
                name,
            });
            self.emit_occupancy();
            if !closing {
                let error = GatewayError::LinkOpenFailed {
                    identity: identity.to_string(),
                    reason: format!(
                        "gave up after {} reconnect attempts",
                        self.settings.max_reconnect_attempts
                    ),
                };
                warn!("Reconnect budget exhausted for {}", identity);
                self.emit(PoolEvent::Failed {
                    identity: identity.to_string(),
                    error,
                });
            }
            return;
        }

        session.reconnect_attempts += 1;
        let attempt = session.reconnect_attempts;
        session.state = SessionState::Reconnecting;
        drop(sessions);

        info!("Device disconnected: {}", identity);
        self.emit(PoolEvent::Disconnected {
            identity: identity.to_string(),
            name,
        });
        self.schedule_reconnect(identity, attempt);
    }

    /// A scheduled reconnect delay elapsed; re-issue the open call if the
    /// session is still waiting for it.
    pub async fn retry(&self, identity: &str) {
        {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(identity) {
                // Superseded by an explicit disconnect or a fresh connect.
                None => return,
                Some(session) if session.state != SessionState::Reconnecting => {
                    debug!("Stale reconnect for {} ignored", identity);
                    return;
                }
                Some(session) => session.state = SessionState::Connecting,
            }
        }

        debug!("Reconnecting to {}", identity);
        if let Err(e) = self.transport.open(identity).await {
            warn!("Reconnect open failed for {}: {}", identity, e);
            self.emit(PoolEvent::Error {
                identity: identity.to_string(),
                error: GatewayError::LinkOpenFailed {
                    identity: identity.to_string(),
                    reason: e.to_string(),
                },
            });
            // A failed open consumes budget like a link drop.
            self.on_link_down(identity);
        }
    }

    /// Linear backoff: the Nth retry waits base x N.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        self.settings.reconnect_base_delay * attempt
    }

    fn schedule_reconnect(&self, identity: &str, attempt: u32) {
        let delay = self.reconnect_delay(attempt);
        info!(
            "Scheduling reconnect for {} (attempt {}/{}) in {:?}",
            identity, attempt, self.settings.max_reconnect_attempts, delay
        );
        self.emit(PoolEvent::Reconnecting {
            identity: identity.to_string(),
            attempt,
        });

        let events = self.events.clone();
        let identity = identity.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(GatewayEvent::ReconnectDue { identity });
        });
    }

    /// Number of sessions occupying pool slots.
    pub fn active_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn max_sessions(&self) -> usize {
        self.settings.max_sessions
    }

    /// Snapshot of one session.
    pub fn session(&self, identity: &str) -> Option<DeviceSession> {
        self.sessions.lock().get(identity).cloned()
    }

    /// Snapshot of all sessions.
    pub fn sessions(&self) -> Vec<DeviceSession> {
        self.sessions.lock().values().cloned().collect()
    }

    pub fn display_name(&self, identity: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(identity)
            .and_then(|s| s.display_name.clone())
    }

    fn emit(&self, event: PoolEvent) {
        let _ = self.events.send(GatewayEvent::Pool(event));
    }

    fn emit_occupancy(&self) {
        let active = self.sessions.lock().len();
        self.emit(PoolEvent::Occupancy {
            active,
            max: self.settings.max_sessions,
        });
    }
}
