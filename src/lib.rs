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

//! BLE-to-MQTT gateway.
//!
//! Maintains a bounded pool of concurrent BLE links, classifies inbound
//! notification payloads and republishes them to an MQTT broker, while
//! deriving throughput, latency and cost telemetry from the event stream.

pub mod bluetooth;
pub mod bridge;
pub mod cloud;
pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod state;

pub use config::Config;
pub use error::GatewayError;
pub use events::{EventProcessor, GatewayEvent};
