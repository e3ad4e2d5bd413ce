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

//! Bluetooth side of the gateway: link transport, scanning, the
//! connection pool and capability routing.

pub mod adapter;
pub mod facade;
pub mod pool;
pub mod scanner;
pub mod transport;

pub use adapter::BluerLink;
pub use facade::{DiscoveredCapabilities, LinkFacade};
pub use pool::{Admission, ConnectionPool, DeviceSession, PoolEvent, PoolSettings, SessionState};
pub use scanner::{ScanEvent, Scanner, SeenDevice};
pub use transport::{LinkEvent, LinkTransport, SubChannel};
