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

//! Gateway error taxonomy.

use thiserror::Error;

/// Errors surfaced by the gateway core.
///
/// Session-level failures (`LinkOpenFailed`, `CapabilityDiscoveryFailed`)
/// are handled by the reconnect state machine up to the retry budget and
/// then surfaced as a terminal per-device error. Forwarding failures never
/// affect session state. None of these are fatal to the process.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Connection pool is at capacity; the caller may retry later.
    #[error("connection pool at capacity ({active}/{max})")]
    AdmissionDenied { active: usize, max: usize },

    /// The underlying link open call failed.
    #[error("link open failed for {identity}: {reason}")]
    LinkOpenFailed { identity: String, reason: String },

    /// Connected, but no usable sub-channels were found or discovery errored.
    #[error("capability discovery failed for {identity}: {reason}")]
    CapabilityDiscoveryFailed { identity: String, reason: String },

    /// No notify-capable sub-channel was discovered on this link.
    #[error("no notify-capable channel on {0}")]
    NotifyUnavailable(String),

    /// No write-capable sub-channel was discovered on this link.
    #[error("no write-capable channel on {0}")]
    WriteUnavailable(String),

    /// A forwarding attempt failed; the message is dropped (at-most-once).
    #[error("publish to {topic} failed")]
    PublishFailed { topic: String },

    /// Preconditions for scanning or connecting are not met.
    #[error("bluetooth preconditions not met: {0}")]
    PermissionMissing(String),

    /// A discovery window is already open.
    #[error("scan already in progress")]
    ScanBusy,
}
