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

//! Event bus between the session core and its observers.
//!
//! Events flow out to any number of subscribers; commands flow in through
//! the manager handle.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::bluetooth::{DeviceAddress, DeviceDescriptor};
use crate::error::BtError;
use crate::state::ConnectionState;

/// Message received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Local>,
}

impl InboundMessage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            timestamp: Local::now(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Message written to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub bytes: Vec<u8>,
    pub timestamp: DateTime<Local>,
}

impl OutboundMessage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            timestamp: Local::now(),
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEndCause {
    /// The peer closed the link.
    PeerClosed,
    /// Reading failed (including framing violations).
    ReadFailed(String),
    /// Writing failed.
    WriteFailed(String),
    /// Explicit local disconnect.
    LocalDisconnect,
}

impl SessionEndCause {
    /// Error equivalent, if the session ended by failure.
    pub fn error(&self) -> Option<BtError> {
        match self {
            Self::ReadFailed(e) => Some(BtError::ReadFailed(e.clone())),
            Self::WriteFailed(e) => Some(BtError::WriteFailed(e.clone())),
            Self::PeerClosed | Self::LocalDisconnect => None,
        }
    }

    pub fn toast_text(&self) -> String {
        match self {
            Self::PeerClosed => "Device connection was lost".to_string(),
            Self::LocalDisconnect => "Disconnected".to_string(),
            Self::ReadFailed(_) | Self::WriteFailed(_) => self
                .error()
                .map(|e| e.toast_text())
                .unwrap_or_default(),
        }
    }
}

impl fmt::Display for SessionEndCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::ReadFailed(e) => write!(f, "read failed: {}", e),
            Self::WriteFailed(e) => write!(f, "write failed: {}", e),
            Self::LocalDisconnect => f.write_str("disconnected locally"),
        }
    }
}

/// Events published by the session core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The connection state machine moved.
    StateChanged(ConnectionState),
    /// A device was listed or discovered. May repeat per address.
    DeviceDiscovered(DeviceDescriptor),
    /// A message arrived from the connected peer.
    MessageReceived {
        message: InboundMessage,
        from: DeviceAddress,
        /// Name the peer introduced itself with.
        name: String,
    },
    /// A message was written to the peer.
    MessageSent(OutboundMessage),
    /// User-facing transient notice.
    Toast(String),
    /// The active session ended.
    SessionEnded(SessionEndCause),
}

impl Event {
    /// New state, if this is a state change.
    pub fn state(&self) -> Option<ConnectionState> {
        match self {
            Event::StateChanged(state) => Some(*state),
            _ => None,
        }
    }
}

/// Commands accepted from the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start or stop device discovery.
    Scan(ScanAction),
    /// Dial a device. `secure: None` picks secure for bonded devices.
    Connect {
        address: DeviceAddress,
        secure: Option<bool>,
    },
    /// Tear down whatever is active.
    Disconnect,
    /// Send a message on the active session.
    Send(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanAction {
    Start,
    Stop,
}

impl Command {
    /// Parse a console line.
    ///
    /// `scan`, `scan stop`, `connect <addr> [secure|insecure]`, `disconnect`,
    /// `send <text>`.
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        match word.to_lowercase().as_str() {
            "scan" => match rest.to_lowercase().as_str() {
                "" | "start" => Ok(Command::Scan(ScanAction::Start)),
                "stop" => Ok(Command::Scan(ScanAction::Stop)),
                other => Err(format!("unknown scan action: {}", other)),
            },
            "connect" => {
                let mut parts = rest.split_whitespace();
                let address = parts
                    .next()
                    .ok_or_else(|| "connect needs a device address".to_string())?
                    .parse::<DeviceAddress>()?;
                let secure = match parts.next().map(|s| s.to_lowercase()) {
                    None => None,
                    Some(s) if s == "secure" => Some(true),
                    Some(s) if s == "insecure" => Some(false),
                    Some(s) => return Err(format!("unknown security mode: {}", s)),
                };
                Ok(Command::Connect { address, secure })
            }
            "disconnect" => Ok(Command::Disconnect),
            "send" => Ok(Command::Send(rest.as_bytes().to_vec())),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

/// Fan-out channel for [`Event`]s.
///
/// Publishing is serialized, so every subscriber sees the same order.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Deliver an event to all live subscribers.
    pub fn publish(&self, event: Event) {
        debug!("Event: {:?}", event);
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
