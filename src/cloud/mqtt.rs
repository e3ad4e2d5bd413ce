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

//! MQTT publish transport.
//!
//! Wraps an async MQTT client with a background event-loop task that
//! tracks broker connectivity. Publishes use QoS 0; the bridge treats a
//! failed handoff as a dropped message.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, Incoming, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::transport::PublishTransport;
use crate::config::CloudConfig;

pub struct MqttPublisher {
    client: AsyncClient,
    connected: Arc<AtomicBool>,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Build the client and start the event-loop task. The broker session
    /// is established in the background; publishes before the first
    /// connack are dropped.
    pub fn new(config: &CloudConfig) -> Self {
        let client_id = config
            .client_id
            .clone()
            .unwrap_or_else(|| format!("ble2mqtt-{}", Uuid::new_v4().simple()));

        let mut options = MqttOptions::new(&client_id, &config.broker_host, config.broker_port);
        options.set_keep_alive(Duration::from_secs(15));

        info!(
            "MQTT client {} -> {}:{}",
            client_id, config.broker_host, config.broker_port
        );

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));

        let connected_flag = connected.clone();
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!("MQTT broker session established");
                        connected_flag.store(true, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(ConnectionError::RequestsDone) => break,
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        connected_flag.store(false, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self {
            client,
            connected,
            event_loop,
        }
    }

    /// Disconnect from the broker and stop the event-loop task.
    pub async fn shutdown(&self) {
        let _ = self.client.disconnect().await;
        self.connected.store(false, Ordering::SeqCst);
        self.event_loop.abort();
    }
}

#[async_trait]
impl PublishTransport for MqttPublisher {
    async fn publish(&self, topic: &str, payload: &[u8]) -> bool {
        if !self.is_connected() {
            debug!("Dropping publish to {}: broker offline", topic);
            return false;
        }
        match self
            .client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Publish to {} failed: {}", topic, e);
                false
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
