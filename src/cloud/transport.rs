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

//! Outbound publish abstraction.

use async_trait::async_trait;

/// Fire-and-forget publish capability consumed by the data bridge.
///
/// Delivery is at-most-once: a `false` return means the message was
/// dropped and nobody retries it.
#[async_trait]
pub trait PublishTransport: Send + Sync + 'static {
    /// Publish a payload to a topic; returns whether the handoff succeeded.
    async fn publish(&self, topic: &str, payload: &[u8]) -> bool;

    /// Whether the transport currently has a live broker session.
    fn is_connected(&self) -> bool;
}
