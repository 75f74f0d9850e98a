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

//! BlueZ adapter over RFCOMM sockets.

use async_trait::async_trait;
use bluer::rfcomm::{Listener, Security, SecurityLevel, Socket, SocketAddr};
use bluer::{Address, AdapterEvent, AdapterProperty};
use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::device::{DeviceAddress, DeviceDescriptor};
use super::platform::{
    Acceptor, AdapterState, BluetoothAdapter, BoxLink, DiscoveryStream, ServiceId,
};
use crate::error::{BtError, Result};

fn bluez_error(err: bluer::Error) -> BtError {
    BtError::Io(err.to_string())
}

fn to_bluer(address: &DeviceAddress) -> Result<Address> {
    address
        .as_str()
        .parse::<Address>()
        .map_err(|e| BtError::connect(format!("{}: {}", address, e)))
}

fn security(secure: bool) -> Security {
    Security {
        level: if secure {
            SecurityLevel::Medium
        } else {
            SecurityLevel::Low
        },
        key_size: 0,
    }
}

/// The system's default Bluetooth adapter.
pub struct BluezAdapter {
    adapter: bluer::Adapter,
    // Keeps the D-Bus connection alive.
    _session: bluer::Session,
    state: watch::Sender<AdapterState>,
    monitor: JoinHandle<()>,
}

impl BluezAdapter {
    /// Open the default adapter and advertise it under `name`.
    pub async fn new(name: &str) -> anyhow::Result<Self> {
        info!("Initializing Bluetooth adapter...");

        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        let powered = adapter.is_powered().await?;
        if powered {
            Self::advertise(&adapter, name).await;
        } else {
            info!("Adapter is powered off");
        }

        let (state, _) = watch::channel(if powered {
            AdapterState::On
        } else {
            AdapterState::Off
        });

        let events = adapter.events().await?;
        let monitor = {
            let state = state.clone();
            let adapter = adapter.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                let mut events = Box::pin(events);
                while let Some(event) = events.next().await {
                    if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(on)) = event {
                        info!("Adapter powered: {}", on);
                        if on {
                            Self::advertise(&adapter, &name).await;
                            state.send_replace(AdapterState::On);
                        } else {
                            state.send_replace(AdapterState::Off);
                        }
                    }
                }
                debug!("Adapter event stream ended");
            })
        };

        Ok(Self {
            adapter,
            _session: session,
            state,
            monitor,
        })
    }

    async fn advertise(adapter: &bluer::Adapter, name: &str) {
        if let Err(e) = adapter.set_alias(name.to_string()).await {
            warn!("Failed to set adapter alias: {}", e);
        }
        if let Err(e) = adapter.set_discoverable(true).await {
            warn!("Failed to make adapter discoverable: {}", e);
        }
        if let Err(e) = adapter.set_pairable(true).await {
            warn!("Failed to make adapter pairable: {}", e);
        }
        info!("Adapter is discoverable as {}", name);
    }

    async fn ensure_powered(&self) -> Result<()> {
        if self.adapter.is_powered().await.map_err(bluez_error)? {
            Ok(())
        } else {
            Err(BtError::AdapterDisabled)
        }
    }
}

impl Drop for BluezAdapter {
    fn drop(&mut self) {
        self.monitor.abort();
    }
}

async fn describe(adapter: &bluer::Adapter, addr: Address) -> DeviceDescriptor {
    let address = DeviceAddress::new(addr.to_string());
    let device = match adapter.device(addr) {
        Ok(device) => device,
        Err(_) => return DeviceDescriptor::unknown(address),
    };

    let name = match device.name().await {
        Ok(Some(name)) => name,
        _ => device.alias().await.unwrap_or_else(|_| address.to_string()),
    };
    let bonded = device.is_paired().await.unwrap_or(false);
    DeviceDescriptor::new(address, name, bonded)
}

#[async_trait]
impl BluetoothAdapter for BluezAdapter {
    async fn local_address(&self) -> Result<DeviceAddress> {
        let address = self.adapter.address().await.map_err(bluez_error)?;
        Ok(DeviceAddress::new(address.to_string()))
    }

    async fn is_enabled(&self) -> Result<bool> {
        self.adapter.is_powered().await.map_err(bluez_error)
    }

    fn state_changes(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let mut devices = Vec::new();

        for addr in self.adapter.device_addresses().await.map_err(bluez_error)? {
            let device = self.adapter.device(addr).map_err(bluez_error)?;
            if device.is_paired().await.unwrap_or(false) {
                let name = device.alias().await.unwrap_or_else(|_| addr.to_string());
                devices.push(DeviceDescriptor::new(
                    DeviceAddress::new(addr.to_string()),
                    name,
                    true,
                ));
            }
        }

        Ok(devices)
    }

    async fn discover(&self) -> Result<DiscoveryStream> {
        let events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| BtError::scan(e.to_string()))?;
        info!("Discovery started");

        let adapter = self.adapter.clone();
        let stream = events.filter_map(move |event| {
            let adapter = adapter.clone();
            async move {
                match event {
                    AdapterEvent::DeviceAdded(addr) => Some(Ok(describe(&adapter, addr).await)),
                    _ => None,
                }
            }
        });
        Ok(stream.boxed())
    }

    async fn listen(&self, service: ServiceId, secure: bool) -> Result<Box<dyn Acceptor>> {
        self.ensure_powered().await?;
        let socket = Socket::new()?;
        socket.set_security(security(secure))?;
        socket.bind(SocketAddr::new(Address::any(), service.channel))?;
        let listener = socket.listen(1)?;
        info!(
            "RFCOMM server listening on channel {} (service {})",
            service.channel, service.uuid
        );
        Ok(Box::new(BluezAcceptor { listener }))
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        service: ServiceId,
        secure: bool,
    ) -> Result<BoxLink> {
        self.ensure_powered().await?;
        let target = SocketAddr::new(to_bluer(address)?, service.channel);
        let socket = Socket::new()?;
        socket.set_security(security(secure))?;
        let stream = socket
            .connect(target)
            .await
            .map_err(|e| BtError::connect(e.to_string()))?;
        info!("RFCOMM link to {} on channel {}", address, service.channel);
        Ok(Box::new(stream))
    }
}

struct BluezAcceptor {
    listener: Listener,
}

#[async_trait]
impl Acceptor for BluezAcceptor {
    async fn accept(&mut self) -> Result<(BoxLink, DeviceAddress)> {
        let (stream, remote) = self.listener.accept().await?;
        Ok((Box::new(stream), DeviceAddress::new(remote.addr.to_string())))
    }
}
