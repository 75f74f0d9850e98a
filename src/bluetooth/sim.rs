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

//! In-process radio for tests and demos.
//!
//! A [`SimRadio`] connects any number of [`SimAdapter`]s by address. Links are
//! tokio duplex pipes; dial latency, scan results, the bonded list, power and
//! write faults are all scriptable.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::device::{DeviceAddress, DeviceDescriptor};
use super::platform::{
    Acceptor, AdapterState, BluetoothAdapter, BoxLink, DiscoveryStream, ServiceId,
};
use crate::error::{BtError, Result};

const PIPE_CAPACITY: usize = 64 * 1024;

type Inbound = (BoxLink, DeviceAddress);

struct Listener {
    token: u64,
    tx: mpsc::UnboundedSender<Inbound>,
}

/// Per-adapter state reachable from the radio.
#[derive(Clone)]
struct Endpoint {
    powered: Arc<AtomicBool>,
    write_fault: Arc<AtomicBool>,
    listener: Arc<Mutex<Option<Listener>>>,
}

struct RadioInner {
    endpoints: Mutex<HashMap<DeviceAddress, Endpoint>>,
    open_links: Arc<AtomicUsize>,
    next_token: AtomicU64,
}

/// Shared medium between simulated adapters.
#[derive(Clone)]
pub struct SimRadio {
    inner: Arc<RadioInner>,
}

impl SimRadio {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RadioInner {
                endpoints: Mutex::new(HashMap::new()),
                open_links: Arc::new(AtomicUsize::new(0)),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Register a powered-on adapter at `address`.
    pub fn adapter(&self, address: DeviceAddress, name: impl Into<String>) -> Arc<SimAdapter> {
        let endpoint = Endpoint {
            powered: Arc::new(AtomicBool::new(true)),
            write_fault: Arc::new(AtomicBool::new(false)),
            listener: Arc::new(Mutex::new(None)),
        };
        self.inner
            .endpoints
            .lock()
            .insert(address.clone(), endpoint.clone());

        let (state, _) = watch::channel(AdapterState::On);
        Arc::new(SimAdapter {
            address,
            name: name.into(),
            radio: self.clone(),
            endpoint,
            state,
            bonded: Mutex::new(Vec::new()),
            scan_results: Mutex::new(Vec::new()),
            scan_error: Mutex::new(None),
            scan_duration: Mutex::new(Duration::from_millis(50)),
            dial_latency: Mutex::new(Duration::ZERO),
            discovering: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Link ends not yet dropped, across all adapters.
    pub fn open_link_ends(&self) -> usize {
        self.inner.open_links.load(Ordering::SeqCst)
    }

    fn endpoint(&self, address: &DeviceAddress) -> Option<Endpoint> {
        self.inner.endpoints.lock().get(address).cloned()
    }

    fn link(&self, pipe: DuplexStream, write_fault: Arc<AtomicBool>) -> SimLink {
        self.inner.open_links.fetch_add(1, Ordering::SeqCst);
        SimLink {
            pipe,
            write_fault,
            open_links: self.inner.open_links.clone(),
        }
    }
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

/// Simulated adapter.
pub struct SimAdapter {
    address: DeviceAddress,
    name: String,
    radio: SimRadio,
    endpoint: Endpoint,
    state: watch::Sender<AdapterState>,
    bonded: Mutex<Vec<DeviceDescriptor>>,
    scan_results: Mutex<Vec<DeviceDescriptor>>,
    scan_error: Mutex<Option<BtError>>,
    scan_duration: Mutex<Duration>,
    dial_latency: Mutex<Duration>,
    discovering: Arc<AtomicUsize>,
}

impl SimAdapter {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Descriptor other adapters would see for this one.
    pub fn descriptor(&self, bonded: bool) -> DeviceDescriptor {
        DeviceDescriptor::new(self.address.clone(), self.name.clone(), bonded)
    }

    /// Switch the radio on or off, passing through the transitional state.
    pub fn set_powered(&self, on: bool) {
        if on {
            self.set_state(AdapterState::TurningOn);
            self.set_state(AdapterState::On);
        } else {
            self.set_state(AdapterState::TurningOff);
            self.set_state(AdapterState::Off);
        }
    }

    pub fn set_state(&self, state: AdapterState) {
        self.endpoint
            .powered
            .store(state == AdapterState::On, Ordering::SeqCst);
        info!("Sim adapter {} -> {:?}", self.address, state);
        self.state.send_replace(state);
    }

    pub fn set_bonded(&self, devices: Vec<DeviceDescriptor>) {
        *self.bonded.lock() = devices;
    }

    pub fn set_scan_results(&self, devices: Vec<DeviceDescriptor>) {
        *self.scan_results.lock() = devices;
    }

    /// Make the next scans abort with `error` after their results.
    pub fn set_scan_error(&self, error: Option<BtError>) {
        *self.scan_error.lock() = error;
    }

    /// How long a scan stays open after its last result.
    pub fn set_scan_duration(&self, duration: Duration) {
        *self.scan_duration.lock() = duration;
    }

    pub fn set_dial_latency(&self, latency: Duration) {
        *self.dial_latency.lock() = latency;
    }

    /// Make every write on this adapter's link ends fail.
    pub fn fail_writes(&self, fail: bool) {
        self.endpoint.write_fault.store(fail, Ordering::SeqCst);
    }

    /// Make the acceptor bound on this adapter fail its pending accept.
    pub fn fail_acceptor(&self) {
        if self.endpoint.listener.lock().take().is_some() {
            info!("Sim adapter {} acceptor failed", self.address);
        }
    }

    pub fn is_discovering(&self) -> bool {
        self.discovering.load(Ordering::SeqCst) > 0
    }

    pub fn is_listening(&self) -> bool {
        self.endpoint.listener.lock().is_some()
    }

    fn powered(&self) -> bool {
        self.endpoint.powered.load(Ordering::SeqCst)
    }
}

struct DiscoveryGuard(Arc<AtomicUsize>);

impl Drop for DiscoveryGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BluetoothAdapter for SimAdapter {
    async fn local_address(&self) -> Result<DeviceAddress> {
        Ok(self.address.clone())
    }

    async fn is_enabled(&self) -> Result<bool> {
        Ok(self.powered())
    }

    fn state_changes(&self) -> watch::Receiver<AdapterState> {
        self.state.subscribe()
    }

    async fn bonded_devices(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.bonded.lock().clone())
    }

    async fn discover(&self) -> Result<DiscoveryStream> {
        if !self.powered() {
            return Err(BtError::AdapterUnavailable);
        }

        self.discovering.fetch_add(1, Ordering::SeqCst);
        let guard = DiscoveryGuard(self.discovering.clone());

        let results: Vec<Result<DeviceDescriptor>> =
            self.scan_results.lock().iter().cloned().map(Ok).collect();
        let error = self.scan_error.lock().clone();
        let duration = *self.scan_duration.lock();

        let tail = futures::stream::once(async move {
            tokio::time::sleep(duration).await;
            error
        })
        .filter_map(|error| async move { error.map(Err::<DeviceDescriptor, BtError>) });

        let stream = futures::stream::iter(results)
            .chain(tail)
            .map(move |item| {
                let _scan = &guard;
                item
            });
        Ok(stream.boxed())
    }

    async fn listen(&self, service: ServiceId, secure: bool) -> Result<Box<dyn Acceptor>> {
        if !self.powered() {
            return Err(BtError::AdapterDisabled);
        }

        let mut slot = self.endpoint.listener.lock();
        if slot.is_some() {
            return Err(BtError::Io(format!(
                "channel {} already bound",
                service.channel
            )));
        }

        let token = self.radio.inner.next_token.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(Listener { token, tx });
        debug!(
            "Sim adapter {} listening on channel {} (secure: {})",
            self.address, service.channel, secure
        );

        Ok(Box::new(SimAcceptor {
            token,
            rx,
            slot: self.endpoint.listener.clone(),
        }))
    }

    async fn connect(
        &self,
        address: &DeviceAddress,
        service: ServiceId,
        secure: bool,
    ) -> Result<BoxLink> {
        if !self.powered() {
            return Err(BtError::AdapterDisabled);
        }

        let latency = *self.dial_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let target = self
            .radio
            .endpoint(address)
            .filter(|e| e.powered.load(Ordering::SeqCst))
            .ok_or_else(|| BtError::connect("host is down"))?;

        let (near, far) = tokio::io::duplex(PIPE_CAPACITY);
        let near = self.radio.link(near, self.endpoint.write_fault.clone());
        let far = self.radio.link(far, target.write_fault.clone());

        let delivered = match target.listener.lock().as_ref() {
            Some(listener) => listener
                .tx
                .send((Box::new(far), self.address.clone()))
                .is_ok(),
            None => false,
        };
        if !delivered {
            return Err(BtError::connect("connection refused"));
        }

        debug!(
            "Sim link {} -> {} on channel {} (secure: {})",
            self.address, address, service.channel, secure
        );
        Ok(Box::new(near))
    }
}

/// Acceptor bound to one adapter's service slot. Unbinds on drop.
pub struct SimAcceptor {
    token: u64,
    rx: mpsc::UnboundedReceiver<Inbound>,
    slot: Arc<Mutex<Option<Listener>>>,
}

#[async_trait]
impl Acceptor for SimAcceptor {
    async fn accept(&mut self) -> Result<(BoxLink, DeviceAddress)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| BtError::Io("acceptor closed".to_string()))
    }
}

impl Drop for SimAcceptor {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if slot.as_ref().map(|l| l.token) == Some(self.token) {
            *slot = None;
        }
    }
}

/// One end of a simulated RFCOMM link.
pub struct SimLink {
    pipe: DuplexStream,
    write_fault: Arc<AtomicBool>,
    open_links: Arc<AtomicUsize>,
}

impl Drop for SimLink {
    fn drop(&mut self) {
        self.open_links.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AsyncRead for SimLink {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_read(cx, buf)
    }
}

impl AsyncWrite for SimLink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_fault.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated write failure",
            )));
        }
        Pin::new(&mut this.pipe).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().pipe).poll_shutdown(cx)
    }
}
