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

//! Per-session capability routing.
//!
//! Discovers the notify- and write-capable sub-channels on a connected
//! link and routes notification enablement and outbound writes to them.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::transport::{LinkTransport, SubChannel};
use crate::error::GatewayError;

/// The two roles selected by capability discovery. Either may be absent;
/// features depending on a missing role fail explicitly.
#[derive(Debug, Clone)]
pub struct DiscoveredCapabilities {
    pub notify: Option<SubChannel>,
    pub write: Option<SubChannel>,
}

/// Translation layer between the opaque link capability and the pool.
pub struct LinkFacade {
    transport: Arc<dyn LinkTransport>,
    notify_channels: Mutex<HashMap<String, SubChannel>>,
    write_channels: Mutex<HashMap<String, SubChannel>>,
}

impl LinkFacade {
    pub fn new(transport: Arc<dyn LinkTransport>) -> Self {
        Self {
            transport,
            notify_channels: Mutex::new(HashMap::new()),
            write_channels: Mutex::new(HashMap::new()),
        }
    }

    /// Discover sub-channels on a connected link and select the first
    /// notify-capable and the first write-capable one, in declaration
    /// order. Fails when discovery errors or no usable channel exists.
    pub async fn discover_capabilities(
        &self,
        identity: &str,
    ) -> Result<DiscoveredCapabilities, GatewayError> {
        let channels = self.transport.discover(identity).await?;

        let notify = channels.iter().find(|c| c.notify).cloned();
        let write = channels.iter().find(|c| c.writable()).cloned();

        if notify.is_none() && write.is_none() {
            return Err(GatewayError::CapabilityDiscoveryFailed {
                identity: identity.to_string(),
                reason: "no usable sub-channels".to_string(),
            });
        }

        if let Some(channel) = &notify {
            debug!("Notify channel for {}: {}", identity, channel.id);
            self.notify_channels
                .lock()
                .insert(identity.to_string(), channel.clone());
        }
        if let Some(channel) = &write {
            debug!("Write channel for {}: {}", identity, channel.id);
            self.write_channels
                .lock()
                .insert(identity.to_string(), channel.clone());
        }

        Ok(DiscoveredCapabilities { notify, write })
    }

    /// Enable notifications on the discovered notify channel.
    /// Returns false when no notify channel was discovered.
    pub async fn enable_notifications(&self, identity: &str) -> bool {
        let channel = self.notify_channels.lock().get(identity).cloned();
        match channel {
            Some(channel) => self.transport.set_notify(identity, &channel, true).await,
            None => {
                warn!("{}", GatewayError::NotifyUnavailable(identity.to_string()));
                false
            }
        }
    }

    /// Write bytes to the discovered write channel. Returns false when no
    /// write channel was discovered; success arrives as a write ack event.
    pub async fn send(&self, identity: &str, payload: &[u8]) -> bool {
        let channel = self.write_channels.lock().get(identity).cloned();
        match channel {
            Some(channel) => self.transport.write(identity, &channel, payload).await,
            None => {
                warn!("{}", GatewayError::WriteUnavailable(identity.to_string()));
                false
            }
        }
    }

    /// Send a text command over the write channel.
    pub async fn send_command(&self, identity: &str, command: &str) -> bool {
        self.send(identity, command.as_bytes()).await
    }

    /// Drop the routing entries for an identity after its link went down.
    pub fn release(&self, identity: &str) {
        self.notify_channels.lock().remove(identity);
        self.write_channels.lock().remove(identity);
    }

    pub fn has_notify(&self, identity: &str) -> bool {
        self.notify_channels.lock().contains_key(identity)
    }

    pub fn has_write(&self, identity: &str) -> bool {
        self.write_channels.lock().contains_key(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn channel(service: &str, id: &str, notify: bool, write: bool, wwr: bool) -> SubChannel {
        SubChannel {
            service: service.to_string(),
            id: id.to_string(),
            notify,
            write,
            write_without_response: wwr,
        }
    }

    struct FakeLink {
        channels: Vec<SubChannel>,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl LinkTransport for FakeLink {
        async fn open(&self, _: &str) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn close(&self, _: &str) {}
        async fn discover(&self, _: &str) -> Result<Vec<SubChannel>, GatewayError> {
            Ok(self.channels.clone())
        }
        async fn set_notify(&self, _: &str, _: &SubChannel, _: bool) -> bool {
            true
        }
        async fn write(&self, _: &str, _: &SubChannel, _: &[u8]) -> bool {
            self.writes.fetch_add(1, Ordering::SeqCst);
            true
        }
        async fn scan_start(&self) -> Result<(), GatewayError> {
            Ok(())
        }
        async fn scan_stop(&self) {}
    }

    fn facade_with(channels: Vec<SubChannel>) -> (Arc<FakeLink>, LinkFacade) {
        let link = Arc::new(FakeLink {
            channels,
            writes: AtomicUsize::new(0),
        });
        let facade = LinkFacade::new(link.clone());
        (link, facade)
    }

    #[tokio::test]
    async fn test_selects_first_of_each_role() {
        let (_link, facade) = facade_with(vec![
            channel("s1", "c1", false, false, false),
            channel("s1", "c2", true, false, false),
            channel("s1", "c3", true, false, false),
            channel("s2", "c4", false, false, true),
            channel("s2", "c5", false, true, false),
        ]);

        let caps = facade.discover_capabilities("AA").await.unwrap();
        assert_eq!(caps.notify.unwrap().id, "c2");
        assert_eq!(caps.write.unwrap().id, "c4");
        assert!(facade.has_notify("AA"));
        assert!(facade.has_write("AA"));
    }

    #[tokio::test]
    async fn test_no_usable_channels_fails() {
        let (_link, facade) = facade_with(vec![channel("s1", "c1", false, false, false)]);
        assert!(matches!(
            facade.discover_capabilities("AA").await,
            Err(GatewayError::CapabilityDiscoveryFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_role_disables_feature() {
        let (link, facade) = facade_with(vec![channel("s1", "c1", true, false, false)]);

        let caps = facade.discover_capabilities("AA").await.unwrap();
        assert!(caps.write.is_none());

        assert!(facade.enable_notifications("AA").await);
        assert!(!facade.send("AA", b"cmd").await);
        assert_eq!(link.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_release_clears_routing() {
        let (_link, facade) = facade_with(vec![channel("s1", "c1", true, true, false)]);
        facade.discover_capabilities("AA").await.unwrap();
        facade.release("AA");
        assert!(!facade.enable_notifications("AA").await);
        assert!(!facade.send_command("AA", "ping").await);
    }
}
