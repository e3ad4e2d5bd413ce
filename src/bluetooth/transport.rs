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

//! Link transport abstraction.
//!
//! The pool, facade and scanner are written against this trait so the same
//! logic runs over the real BlueZ adapter and over fakes in tests.

use async_trait::async_trait;

use crate::error::GatewayError;

/// A discovered notify- or write-capable endpoint on an open link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubChannel {
    /// Identity of the service this channel belongs to.
    pub service: String,
    /// Identity of the channel itself.
    pub id: String,
    /// Channel supports notifications.
    pub notify: bool,
    /// Channel supports acknowledged writes.
    pub write: bool,
    /// Channel supports unacknowledged writes.
    pub write_without_response: bool,
}

impl SubChannel {
    /// Whether this channel can carry outbound commands.
    pub fn writable(&self) -> bool {
        self.write || self.write_without_response
    }
}

/// Events emitted by a link transport.
///
/// All events are posted onto the gateway's single dispatch channel;
/// nothing in the transport mutates session state directly.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// A peripheral was sighted during discovery.
    DeviceDiscovered {
        identity: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// An open call completed and the link is up.
    LinkUp {
        identity: String,
        name: Option<String>,
    },
    /// The link dropped or was closed.
    LinkDown { identity: String },
    /// An inbound notification payload arrived.
    Notification {
        identity: String,
        channel: SubChannel,
        payload: Vec<u8>,
    },
    /// An outbound write completed.
    WriteAck { identity: String, success: bool },
}

/// Opaque link capability consumed by the gateway core.
///
/// `open` resolves when the request was issued; link-up, link-down,
/// notifications and write acknowledgements are delivered asynchronously
/// as [`LinkEvent`]s.
#[async_trait]
pub trait LinkTransport: Send + Sync + 'static {
    /// Open a link to the given device.
    async fn open(&self, identity: &str) -> Result<(), GatewayError>;

    /// Close the link; the resulting link-down event performs cleanup.
    async fn close(&self, identity: &str);

    /// Enumerate sub-channels on a connected link, in declaration order.
    async fn discover(&self, identity: &str) -> Result<Vec<SubChannel>, GatewayError>;

    /// Enable or disable notifications on a sub-channel.
    async fn set_notify(&self, identity: &str, channel: &SubChannel, enabled: bool) -> bool;

    /// Write bytes to a sub-channel; completion arrives as a `WriteAck`.
    async fn write(&self, identity: &str, channel: &SubChannel, payload: &[u8]) -> bool;

    /// Begin peripheral discovery.
    async fn scan_start(&self) -> Result<(), GatewayError>;

    /// End peripheral discovery; idempotent.
    async fn scan_stop(&self);
}
