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

//! PairIt command-line chat.

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pairit::bluetooth::bluez::BluezAdapter;
use pairit::bluetooth::SessionManager;
use pairit::config::Config;
use pairit::console::{format_device, Console};
use pairit::events::{Command, EventBus};

const HELP: &str = "commands: scan | scan stop | connect <addr> [secure|insecure] | \
                    disconnect | send <text> | devices | quit";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("pairit=info".parse()?))
        .init();

    info!("Starting PairIt v{}...", env!("CARGO_PKG_VERSION"));

    let config = Config::load()?;
    info!("Configuration loaded");

    let adapter = match BluezAdapter::new(&config.bluetooth.device_name).await {
        Ok(adapter) => Arc::new(adapter),
        Err(e) => {
            error!("No Bluetooth adapter: {}", e);
            println!("Sorry! This device doesn't support bluetooth!");
            return Err(e);
        }
    };

    let bus = EventBus::new();
    let mut events = bus.subscribe();
    let handle = SessionManager::spawn(adapter, &config, bus).await?;
    let mut console = Console::new();

    println!("{}", HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                for line in console.process_event(&event) {
                    println!("{}", line);
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    "quit" | "exit" => break,
                    "help" => println!("{}", HELP),
                    "devices" => {
                        for device in handle.devices().await? {
                            println!("{}", format_device(&device));
                        }
                    }
                    other => match Command::parse(other) {
                        Ok(command) => handle.execute(command)?,
                        Err(e) => println!("{} ({})", e, HELP),
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    handle.shutdown().await?;
    info!("PairIt stopped");
    Ok(())
}
