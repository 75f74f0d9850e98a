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

//! Text rendering of bus events for the command-line front ends.

use tracing::debug;

use crate::bluetooth::DeviceDescriptor;
use crate::events::Event;
use crate::state::ConnectionState;

/// Turns events into printable lines and keeps the conversation.
pub struct Console {
    state: ConnectionState,
    transcript: Vec<String>,
}

impl Console {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Inactive,
            transcript: Vec::new(),
        }
    }

    /// Last state seen on the bus.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Messages of the current conversation.
    pub fn transcript(&self) -> &[String] {
        &self.transcript
    }

    /// Process a single event.
    pub fn process_event(&mut self, event: &Event) -> Vec<String> {
        match event {
            Event::StateChanged(state) => {
                self.state = *state;
                if *state == ConnectionState::Connected {
                    self.transcript.clear();
                }
                vec![format!("[{}]", state.label())]
            }
            Event::DeviceDiscovered(device) => vec![format_device(device)],
            Event::MessageReceived {
                message,
                from,
                name,
            } => {
                let line = if name.is_empty() {
                    format!("{}:  {}", from, message.text())
                } else {
                    format!("{}:  {}", name, message.text())
                };
                self.transcript.push(line.clone());
                vec![line]
            }
            Event::MessageSent(message) => {
                let line = format!("Me:  {}", message.text());
                self.transcript.push(line.clone());
                vec![line]
            }
            Event::Toast(text) => vec![format!("! {}", text)],
            Event::SessionEnded(cause) => {
                debug!("Session ended after {} messages", self.transcript.len());
                vec![format!("Session ended: {}", cause)]
            }
        }
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// One line per device, as listed by `devices` and discovery.
pub fn format_device(device: &DeviceDescriptor) -> String {
    if device.bonded {
        format!("  {}  {} (paired)", device.address, device.name)
    } else {
        format!("  {}  {}", device.address, device.name)
    }
}
