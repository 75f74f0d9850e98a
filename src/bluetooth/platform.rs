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

//! Platform collaborator boundary.
//!
//! The session core only talks to the radio through these traits: adapter
//! power state, device enumeration, and socket-like connect/accept keyed by
//! device address and service identifier.

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use uuid::Uuid;

use super::device::{DeviceAddress, DeviceDescriptor};
use crate::error::Result;

/// Adapter power state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Off,
    TurningOn,
    On,
    TurningOff,
}

/// Service identifier a link is keyed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceId {
    pub uuid: Uuid,
    /// RFCOMM channel the service is bound to.
    pub channel: u8,
}

/// A connected byte stream to a peer.
pub trait Link: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Link for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed link handed between components by move.
pub type BoxLink = Box<dyn Link>;

/// Stream of discovery results; errors end the scan.
pub type DiscoveryStream = BoxStream<'static, Result<DeviceDescriptor>>;

/// Radio adapter.
#[async_trait]
pub trait BluetoothAdapter: Send + Sync + 'static {
    /// Address of the local adapter.
    async fn local_address(&self) -> Result<DeviceAddress>;

    async fn is_enabled(&self) -> Result<bool>;

    /// Subscribe to power state changes.
    fn state_changes(&self) -> watch::Receiver<AdapterState>;

    /// Devices bonded at the OS level, from the platform cache.
    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>>;

    /// Start discovery. Dropping the stream must release the scan.
    async fn discover(&self) -> Result<DiscoveryStream>;

    /// Bind a listening acceptor for `service`.
    async fn listen(&self, service: ServiceId, secure: bool) -> Result<Box<dyn Acceptor>>;

    /// Dial `address`. Dropping the future must abandon the attempt.
    async fn connect(
        &self,
        address: &DeviceAddress,
        service: ServiceId,
        secure: bool,
    ) -> Result<BoxLink>;
}

/// Passive side of connection establishment.
#[async_trait]
pub trait Acceptor: Send {
    /// Wait for the next inbound link.
    async fn accept(&mut self) -> Result<(BoxLink, DeviceAddress)>;
}
