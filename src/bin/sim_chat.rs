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

//! Two simulated phones dialing each other at once.
//!
//! Usage: cargo run --bin sim_chat

use anyhow::{bail, Result};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairit::bluetooth::sim::SimRadio;
use pairit::bluetooth::{ManagerHandle, SessionManager};
use pairit::config::Config;
use pairit::console::Console;
use pairit::events::{Event, EventBus};
use pairit::state::ConnectionState;

async fn endpoint(
    radio: &SimRadio,
    address: &str,
    name: &str,
) -> Result<(ManagerHandle, mpsc::UnboundedReceiver<Event>)> {
    let adapter = radio.adapter(address.parse().map_err(anyhow::Error::msg)?, name);
    adapter.set_dial_latency(Duration::from_millis(20));

    let mut config = Config::default().with_device_name(name);
    config.bluetooth.auto_scan = false;

    let bus = EventBus::new();
    let events = bus.subscribe();
    let handle = SessionManager::spawn(adapter, &config, bus).await?;
    Ok((handle, events))
}

/// Print events from one side until `until` matches or the wait times out.
async fn drain(
    label: &str,
    console: &mut Console,
    events: &mut mpsc::UnboundedReceiver<Event>,
    until: impl Fn(&Event) -> bool,
) -> Result<()> {
    loop {
        let event = match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => bail!("{} stopped", label),
            Err(_) => bail!("{} timed out", label),
        };
        for line in console.process_event(&event) {
            println!("{:>6} | {}", label, line);
        }
        if until(&event) {
            return Ok(());
        }
    }
}

fn connected(event: &Event) -> bool {
    event.state() == Some(ConnectionState::Connected)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("pairit=warn".parse()?))
        .init();

    let radio = SimRadio::new();
    let (alice, mut alice_events) = endpoint(&radio, "00:00:00:00:00:0A", "alice").await?;
    let (bob, mut bob_events) = endpoint(&radio, "00:00:00:00:00:0B", "bob").await?;
    let mut alice_console = Console::new();
    let mut bob_console = Console::new();

    // Both sides dial at the same time.
    alice.connect("00:00:00:00:00:0B".parse().map_err(anyhow::Error::msg)?, Some(false))?;
    bob.connect("00:00:00:00:00:0A".parse().map_err(anyhow::Error::msg)?, Some(false))?;

    drain("alice", &mut alice_console, &mut alice_events, connected).await?;
    drain("bob", &mut bob_console, &mut bob_events, connected).await?;

    alice.send("hi bob")?;
    drain("bob", &mut bob_console, &mut bob_events, |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await?;
    bob.send("hi alice")?;
    drain("alice", &mut alice_console, &mut alice_events, |e| {
        matches!(e, Event::MessageReceived { .. })
    })
    .await?;

    alice.disconnect()?;
    drain("bob", &mut bob_console, &mut bob_events, |e| {
        e.state() == Some(ConnectionState::Disconnected)
    })
    .await?;

    alice.shutdown().await?;
    bob.shutdown().await?;
    println!("open link ends after shutdown: {}", radio.open_link_ends());
    Ok(())
}
