// Copyright 2026 Daniel Pelikan
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

//! Bluetooth session core.
//!
//! Device discovery, connection negotiation as both acceptor and dialer,
//! framed sessions, and the state machine sequencing them.

pub mod bluez;
mod device;
mod frame;
mod manager;
mod negotiator;
mod platform;
mod protocol;
mod session;
pub mod sim;

pub use device::{DeviceAddress, DeviceDescriptor, DeviceRegistry, ScanUpdate};
pub use frame::{encode_frame, Frame, FrameDecoder, FrameKind, DEFAULT_MAX_FRAME_LEN};
pub use manager::{ManagerHandle, SessionManager};
pub use negotiator::{NegotiationSignal, Negotiator, NegotiatorConfig, Resolution};
pub use platform::{
    Acceptor, AdapterState, BluetoothAdapter, BoxLink, DiscoveryStream, Link, ServiceId,
};
pub use protocol::{client_handshake, server_handshake, Hello, PROTOCOL_VERSION};
pub use session::{ConnectionRole, ReadyLink, Session, SessionEnd};
