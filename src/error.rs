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

//! Error types for the Bluetooth session core.

use std::io;
use thiserror::Error;

/// Result type alias using [`BtError`].
pub type Result<T> = std::result::Result<T, BtError>;

/// Errors raised by the session core.
///
/// Recoverable errors leave the state machine where it was (or return it to
/// `Disconnected`); session-fatal errors end only the active session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BtError {
    /// No usable adapter. Fatal to every Bluetooth operation until the user
    /// turns Bluetooth back on.
    #[error("Bluetooth adapter unavailable")]
    AdapterUnavailable,

    /// Adapter present but switched off; retry once enabled.
    #[error("Bluetooth adapter disabled")]
    AdapterDisabled,

    /// Discovery could not be started or aborted mid-way.
    #[error("Scan failed: {0}")]
    ScanFailed(String),

    /// Neither the outbound nor the inbound path produced a session.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// A session is already live.
    #[error("Already connected")]
    AlreadyConnected,

    /// A connection attempt is already in flight.
    #[error("Connection attempt already in progress")]
    ConnectInProgress,

    /// No session to send on.
    #[error("Not connected")]
    NotConnected,

    /// The peer did not complete the HELLO exchange.
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Writing to the session link failed.
    #[error("Write failed: {0}")]
    WriteFailed(String),

    /// Reading from the session link failed.
    #[error("Read failed: {0}")]
    ReadFailed(String),

    /// Peer sent bytes that violate the framing.
    #[error("Framing error: {0}")]
    Frame(String),

    /// Other I/O error.
    #[error("IO error: {0}")]
    Io(String),
}

impl BtError {
    /// Create a ScanFailed error
    pub fn scan(msg: impl Into<String>) -> Self {
        Self::ScanFailed(msg.into())
    }

    /// Create a ConnectFailed error
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::ConnectFailed(msg.into())
    }

    /// Create a HandshakeFailed error
    pub fn handshake(msg: impl Into<String>) -> Self {
        Self::HandshakeFailed(msg.into())
    }

    /// Human-readable notice shown to the user alongside the failure.
    pub fn toast_text(&self) -> String {
        match self {
            Self::AdapterUnavailable => "Please turn on Bluetooth".to_string(),
            Self::AdapterDisabled => "Bluetooth is off - enable it and try again".to_string(),
            Self::ScanFailed(e) => format!("Could not search for devices: {}", e),
            Self::ConnectFailed(e) => format!("Unable to connect device: {}", e),
            Self::AlreadyConnected => "Already connected - disconnect first".to_string(),
            Self::ConnectInProgress => "Already connecting".to_string(),
            Self::NotConnected => "Connect before sending a message".to_string(),
            Self::HandshakeFailed(e) => format!("Device did not respond: {}", e),
            Self::WriteFailed(e) => format!("Message could not be sent: {}", e),
            Self::ReadFailed(e) => format!("Device connection was lost: {}", e),
            Self::Frame(e) => format!("Device sent a malformed message: {}", e),
            Self::Io(e) => format!("Bluetooth error: {}", e),
        }
    }
}

// io::Error is not Clone, so events carry its rendering instead.
impl From<io::Error> for BtError {
    fn from(err: io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
