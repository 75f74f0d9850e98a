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

//! Connection state machine states.

use serde::{Deserialize, Serialize};

/// Process-wide connection state, owned by the session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Adapter off or not yet confirmed enabled.
    Inactive,
    /// Adapter on, acceptor listening, no session.
    Disconnected,
    /// Device selection: discovery running.
    Pairing,
    /// Dial and/or accept in flight.
    Connecting,
    /// A session is bound.
    Connected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Inactive => "INACTIVE",
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Pairing => "PAIRING",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
        }
    }

    /// Status line for display.
    pub fn label(&self) -> &'static str {
        match self {
            ConnectionState::Inactive => "Please turn on Bluetooth",
            ConnectionState::Disconnected => "Not connected",
            ConnectionState::Pairing => "Pairing",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        }
    }

    /// Whether the acceptor should be running in this state.
    pub fn listens(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Pairing | ConnectionState::Connecting
        )
    }

    /// Transition table of the session manager.
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Inactive, Disconnected)
                | (Disconnected, Pairing)
                | (Disconnected, Connecting)
                | (Disconnected, Connected)
                | (Disconnected, Inactive)
                | (Pairing, Connecting)
                | (Pairing, Connected)
                | (Pairing, Disconnected)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
