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

//! Session manager: the connection state machine.
//!
//! The manager runs as a single task that owns the registry, the negotiator
//! and the active session. Commands, scan progress, negotiation signals,
//! session ends and adapter power changes are all funnelled into that task,
//! so every state transition is serialized.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::device::{DeviceAddress, DeviceDescriptor, DeviceRegistry, ScanUpdate};
use super::negotiator::{NegotiationSignal, Negotiator, Resolution};
use super::platform::{AdapterState, BluetoothAdapter};
use super::protocol::Hello;
use super::session::{ConnectionRole, ReadyLink, Session, SessionEnd};
use crate::config::Config;
use crate::error::{BtError, Result};
use crate::events::{Command, Event, EventBus, ScanAction, SessionEndCause};
use crate::state::ConnectionState;

enum Request {
    Command(Command),
    Devices(oneshot::Sender<Vec<DeviceDescriptor>>),
    State(oneshot::Sender<ConnectionState>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable front end of a running session manager.
#[derive(Clone)]
pub struct ManagerHandle {
    requests: mpsc::UnboundedSender<Request>,
    bus: EventBus,
}

impl ManagerHandle {
    /// Submit a command. Its outcome is reported on the event bus.
    pub fn execute(&self, command: Command) -> Result<()> {
        self.request(Request::Command(command))
    }

    pub fn scan_start(&self) -> Result<()> {
        self.execute(Command::Scan(ScanAction::Start))
    }

    pub fn scan_stop(&self) -> Result<()> {
        self.execute(Command::Scan(ScanAction::Stop))
    }

    /// Connect to `address`. `secure: None` picks secure for bonded devices.
    pub fn connect(&self, address: DeviceAddress, secure: Option<bool>) -> Result<()> {
        self.execute(Command::Connect { address, secure })
    }

    pub fn disconnect(&self) -> Result<()> {
        self.execute(Command::Disconnect)
    }

    pub fn send(&self, bytes: impl Into<Vec<u8>>) -> Result<()> {
        self.execute(Command::Send(bytes.into()))
    }

    /// Snapshot of the device registry.
    pub async fn devices(&self) -> Result<Vec<DeviceDescriptor>> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Devices(tx))?;
        rx.await.map_err(|_| stopped())
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::State(tx))?;
        rx.await.map_err(|_| stopped())
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        self.bus.subscribe()
    }

    /// Tear everything down and stop the manager task.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.request(Request::Shutdown(tx))?;
        rx.await.map_err(|_| stopped())
    }

    fn request(&self, request: Request) -> Result<()> {
        self.requests.send(request).map_err(|_| stopped())
    }
}

fn stopped() -> BtError {
    BtError::Io("session manager stopped".to_string())
}

/// The connection state machine.
pub struct SessionManager {
    adapter: Arc<dyn BluetoothAdapter>,
    bus: EventBus,
    state: ConnectionState,
    auto_scan: bool,
    max_frame_len: usize,
    registry: DeviceRegistry,
    negotiator: Negotiator,
    session: Option<Session>,
    next_session: u64,
    scan_found_new: bool,
    scan_tx: mpsc::UnboundedSender<ScanUpdate>,
    scan_rx: mpsc::UnboundedReceiver<ScanUpdate>,
    signal_rx: mpsc::UnboundedReceiver<NegotiationSignal>,
    end_tx: mpsc::UnboundedSender<SessionEnd>,
    end_rx: mpsc::UnboundedReceiver<SessionEnd>,
    adapter_states: watch::Receiver<AdapterState>,
    adapter_watch_open: bool,
}

impl SessionManager {
    /// Start a manager task on `adapter`, publishing to `bus`.
    pub async fn spawn(
        adapter: Arc<dyn BluetoothAdapter>,
        config: &Config,
        bus: EventBus,
    ) -> Result<ManagerHandle> {
        let local = Hello::new(
            adapter.local_address().await?,
            config.bluetooth.device_name.clone(),
        );
        info!("Local adapter {} ({})", local.address, local.name);

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (scan_tx, scan_rx) = mpsc::unbounded_channel();
        let (end_tx, end_rx) = mpsc::unbounded_channel();
        let (requests, request_rx) = mpsc::unbounded_channel();

        let manager = Self {
            registry: DeviceRegistry::new(adapter.clone(), config.scan_timeout()),
            negotiator: Negotiator::new(adapter.clone(), config.negotiator(), local, signal_tx),
            adapter_states: adapter.state_changes(),
            adapter_watch_open: true,
            adapter,
            bus: bus.clone(),
            state: ConnectionState::Inactive,
            auto_scan: config.bluetooth.auto_scan,
            max_frame_len: config.session.max_frame_len,
            session: None,
            next_session: 0,
            scan_found_new: false,
            scan_tx,
            scan_rx,
            signal_rx,
            end_tx,
            end_rx,
        };

        tokio::spawn(manager.run(request_rx));
        Ok(ManagerHandle { requests, bus })
    }

    async fn run(mut self, mut requests: mpsc::UnboundedReceiver<Request>) {
        self.start().await;

        loop {
            let deadline = self.negotiator.deadline();

            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Command(command)) => self.handle_command(command).await,
                    Some(Request::Devices(reply)) => {
                        let _ = reply.send(self.registry.devices());
                    }
                    Some(Request::State(reply)) => {
                        let _ = reply.send(self.state);
                    }
                    Some(Request::Shutdown(reply)) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(update) = self.scan_rx.recv() => self.on_scan_update(update).await,
                Some(signal) = self.signal_rx.recv() => self.on_signal(signal).await,
                Some(end) = self.end_rx.recv() => self.on_session_end(end).await,
                changed = self.adapter_states.changed(), if self.adapter_watch_open => match changed {
                    Ok(()) => {
                        let state = *self.adapter_states.borrow_and_update();
                        self.on_adapter_state(state).await;
                    }
                    Err(_) => {
                        warn!("Adapter state stream closed");
                        self.adapter_watch_open = false;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    let resolution = self.negotiator.on_deadline().await;
                    self.resolve(resolution).await;
                }
            }
        }
    }

    async fn start(&mut self) {
        match self.adapter.is_enabled().await {
            Ok(true) => self.activate().await,
            Ok(false) => {
                info!("Bluetooth adapter is off");
                self.toast(BtError::AdapterUnavailable.toast_text());
            }
            Err(e) => {
                error!("Failed to query adapter: {}", e);
                self.toast(e.toast_text());
            }
        }
    }

    /// Leave `Inactive`: listen, and scan if configured to.
    async fn activate(&mut self) {
        self.enter_disconnected().await;
        if self.auto_scan {
            self.start_scan().await;
        }
    }

    async fn handle_command(&mut self, command: Command) {
        debug!("Command in {}: {:?}", self.state, command);
        match command {
            Command::Scan(ScanAction::Start) => self.scan_requested().await,
            Command::Scan(ScanAction::Stop) => self.stop_scan().await,
            Command::Connect { address, secure } => self.connect(address, secure).await,
            Command::Disconnect => self.disconnect().await,
            Command::Send(bytes) => self.send(bytes),
        }
    }

    async fn scan_requested(&mut self) {
        match self.state {
            ConnectionState::Inactive => self.reject(BtError::AdapterUnavailable),
            ConnectionState::Connecting => self.reject(BtError::ConnectInProgress),
            ConnectionState::Connected => self.reject(BtError::AlreadyConnected),
            ConnectionState::Disconnected | ConnectionState::Pairing => self.start_scan().await,
        }
    }

    async fn start_scan(&mut self) {
        if let Err(e) = self.registry.start_scan(self.scan_tx.clone()).await {
            warn!("Scan not started: {}", e);
            self.toast(e.toast_text());
            if self.state == ConnectionState::Pairing {
                self.set_state(ConnectionState::Disconnected);
            }
            return;
        }

        self.scan_found_new = false;
        self.set_state(ConnectionState::Pairing);

        match self.registry.list_bonded().await {
            Ok(bonded) => {
                for device in bonded {
                    self.bus.publish(Event::DeviceDiscovered(device));
                }
            }
            Err(e) => warn!("Could not list bonded devices: {}", e),
        }
    }

    async fn stop_scan(&mut self) {
        if self.registry.stop_scan().await && self.state == ConnectionState::Pairing {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    async fn on_scan_update(&mut self, update: ScanUpdate) {
        match update {
            ScanUpdate::Found { scan, device } => {
                if !self.registry.is_current_scan(scan) {
                    return;
                }
                if !device.bonded {
                    self.scan_found_new = true;
                }
                if self.registry.record(device.clone()) {
                    self.bus.publish(Event::DeviceDiscovered(device));
                }
            }
            ScanUpdate::Finished { scan, error } => {
                if !self.registry.scan_finished(scan) {
                    return;
                }
                match error {
                    Some(e) => {
                        let e = match e {
                            BtError::ScanFailed(_) => e,
                            other => BtError::scan(other.to_string()),
                        };
                        self.toast(e.toast_text());
                    }
                    None if !self.scan_found_new => self.toast("No new devices found"),
                    None => {}
                }
                info!("Scan {} finished", scan);
                if self.state == ConnectionState::Pairing {
                    self.set_state(ConnectionState::Disconnected);
                }
            }
        }
    }

    async fn connect(&mut self, address: DeviceAddress, secure: Option<bool>) {
        match self.state {
            ConnectionState::Inactive => return self.reject(BtError::AdapterUnavailable),
            ConnectionState::Connecting => return self.reject(BtError::ConnectInProgress),
            ConnectionState::Connected => return self.reject(BtError::AlreadyConnected),
            ConnectionState::Disconnected | ConnectionState::Pairing => {}
        }

        if self.registry.stop_scan().await {
            debug!("Scan stopped for connect");
        }

        let target = self
            .registry
            .get(&address)
            .cloned()
            .unwrap_or_else(|| DeviceDescriptor::unknown(address));
        let secure = secure.unwrap_or(target.bonded);

        self.set_state(ConnectionState::Connecting);
        self.negotiator.connect(target, secure).await;
    }

    async fn disconnect(&mut self) {
        if self.state == ConnectionState::Inactive {
            debug!("Disconnect while inactive: nothing to do");
            return;
        }

        let closed = self.release().await;
        if closed {
            self.bus
                .publish(Event::SessionEnded(SessionEndCause::LocalDisconnect));
        }
        if self.state != ConnectionState::Disconnected {
            self.enter_disconnected().await;
        }
    }

    fn send(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            debug!("Ignoring empty message");
            return;
        }

        match &self.session {
            Some(session) if self.state == ConnectionState::Connected => {
                if let Err(e) = session.send(bytes) {
                    self.reject(e);
                }
            }
            _ => self.reject(BtError::NotConnected),
        }
    }

    async fn on_signal(&mut self, signal: NegotiationSignal) {
        let resolution = match signal {
            NegotiationSignal::LinkReady(ready) => {
                if matches!(
                    self.state,
                    ConnectionState::Connected | ConnectionState::Inactive
                ) {
                    debug!(
                        "Dropping link with {} in state {}",
                        ready.peer.address, self.state
                    );
                    return;
                }
                self.negotiator.on_link(ready).await
            }
            NegotiationSignal::ConnectFailed { attempt, error } => {
                self.negotiator.on_connect_failed(attempt, error).await
            }
            NegotiationSignal::AcceptFailed(error) => {
                match self.negotiator.on_accept_failed(error.clone()) {
                    Resolution::Pending => return self.restart_acceptor(error).await,
                    resolution => resolution,
                }
            }
        };
        self.resolve(resolution).await;
    }

    /// The acceptor died outside a failed negotiation. Bring it back if this
    /// state listens.
    async fn restart_acceptor(&mut self, error: BtError) {
        if !self.state.listens() {
            debug!("Acceptor gone in {}: {}", self.state, error);
            return;
        }

        self.toast(error.toast_text());
        match self.negotiator.listen().await {
            Ok(()) => info!("Acceptor restarted"),
            Err(e) => {
                error!("Failed to listen again: {}", e);
                self.toast(e.toast_text());
            }
        }
    }

    async fn resolve(&mut self, resolution: Resolution) {
        match resolution {
            Resolution::Adopt(ready) => self.bind(ready).await,
            Resolution::Pending => {}
            Resolution::Failed(e) => {
                warn!("Connection failed: {}", e);
                self.toast(e.toast_text());
                if self.state == ConnectionState::Connecting {
                    self.enter_disconnected().await;
                }
            }
        }
    }

    /// Bind a negotiated link as the one active session.
    async fn bind(&mut self, mut ready: ReadyLink) {
        self.negotiator.cancel().await;
        self.negotiator.stop_listening().await;
        self.registry.stop_scan().await;

        if let Some(known) = self.registry.get(&ready.peer.address) {
            ready.peer.bonded = known.bonded;
        }

        let greeting = match ready.role {
            ConnectionRole::Client => None,
            ConnectionRole::Server => match self.negotiator.greeting() {
                Ok(greeting) => Some(greeting),
                Err(e) => {
                    error!("Cannot answer {}: {}", ready.peer.address, e);
                    self.toast(e.toast_text());
                    self.enter_disconnected().await;
                    return;
                }
            },
        };

        let peer = ready.peer.clone();
        self.set_state(ConnectionState::Connected);

        self.next_session += 1;
        self.session = Some(Session::start(
            self.next_session,
            ready,
            greeting,
            self.max_frame_len,
            self.bus.clone(),
            self.end_tx.clone(),
        ));
        self.toast(format!("Connected to {}", peer.name));
    }

    async fn on_session_end(&mut self, end: SessionEnd) {
        if self.session.as_ref().map(|s| s.id()) != Some(end.session) {
            debug!("Ignoring end of stale session {}", end.session);
            return;
        }
        if let Some(mut session) = self.session.take() {
            info!(
                "Session {} with {} ({:?}) ended: {}",
                session.id(),
                session.peer().address,
                session.role(),
                end.cause
            );
            session.close().await;
        }

        self.toast(end.cause.toast_text());
        self.bus.publish(Event::SessionEnded(end.cause));
        self.enter_disconnected().await;
    }

    async fn on_adapter_state(&mut self, adapter: AdapterState) {
        debug!("Adapter state: {:?}", adapter);
        match adapter {
            AdapterState::On => {
                if self.state == ConnectionState::Inactive {
                    self.toast("Bluetooth enabled");
                    self.activate().await;
                }
            }
            AdapterState::TurningOff | AdapterState::Off => {
                if self.state == ConnectionState::Inactive {
                    return;
                }
                self.toast("Bluetooth turning off - disconnecting");
                let closed = self.release().await;
                self.negotiator.stop_listening().await;
                if closed {
                    self.bus
                        .publish(Event::SessionEnded(SessionEndCause::LocalDisconnect));
                }
                self.set_state(ConnectionState::Disconnected);
                self.set_state(ConnectionState::Inactive);
            }
            AdapterState::TurningOn => {}
        }
    }

    async fn shutdown(&mut self) {
        info!("Session manager shutting down");
        self.release().await;
        self.negotiator.stop_listening().await;
    }

    /// Stop the scan, abandon negotiation and close the session.
    ///
    /// Returns true if a session was closed.
    async fn release(&mut self) -> bool {
        self.registry.stop_scan().await;
        self.negotiator.cancel().await;
        match self.session.take() {
            Some(mut session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    async fn enter_disconnected(&mut self) {
        self.set_state(ConnectionState::Disconnected);
        if let Err(e) = self.negotiator.listen().await {
            error!("Failed to listen: {}", e);
            self.toast(e.toast_text());
        }
    }

    fn set_state(&mut self, next: ConnectionState) -> bool {
        if self.state == next {
            return false;
        }
        if !self.state.can_transition_to(next) {
            warn!("Ignoring invalid transition {} -> {}", self.state, next);
            return false;
        }
        info!("State: {} -> {}", self.state, next);
        self.state = next;
        self.bus.publish(Event::StateChanged(next));
        true
    }

    /// A request that cannot run in the current state.
    fn reject(&self, error: BtError) {
        info!("Rejected in {}: {}", self.state, error);
        self.toast(error.toast_text());
    }

    fn toast(&self, text: impl Into<String>) {
        self.bus.publish(Event::Toast(text.into()));
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::sim::{SimAdapter, SimRadio};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    fn config() -> Config {
        let mut config = Config::default().with_device_name("test");
        config.bluetooth.auto_scan = false;
        config.session.race_settle_ms = 200;
        config
    }

    async fn spawn(
        adapter: &Arc<SimAdapter>,
        config: &Config,
    ) -> (ManagerHandle, mpsc::UnboundedReceiver<Event>) {
        let bus = EventBus::new();
        let events = bus.subscribe();
        let handle = SessionManager::spawn(adapter.clone(), config, bus)
            .await
            .unwrap();
        (handle, events)
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    async fn wait_for_state(events: &mut mpsc::UnboundedReceiver<Event>, state: ConnectionState) {
        loop {
            if next_event(events).await.state() == Some(state) {
                return;
            }
        }
    }

    #[tokio::test]
    async fn test_starts_listening_when_enabled() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        let (handle, mut events) = spawn(&adapter, &config()).await;

        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Disconnected)
        );
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
        assert!(adapter.is_listening());

        handle.shutdown().await.unwrap();
        assert!(!adapter.is_listening());
    }

    #[tokio::test]
    async fn test_stays_inactive_when_disabled() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        adapter.set_powered(false);
        let (handle, mut events) = spawn(&adapter, &config()).await;

        assert_eq!(
            next_event(&mut events).await,
            Event::Toast("Please turn on Bluetooth".into())
        );
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Inactive);

        // Disconnect while inactive is a no-op.
        handle.disconnect().unwrap();
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Inactive);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_auto_scan_and_finish() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        adapter.set_bonded(vec![DeviceDescriptor::new(
            addr("00:00:00:00:00:0B"),
            "Bonded",
            true,
        )]);
        let mut config = config();
        config.bluetooth.auto_scan = true;
        let (_handle, mut events) = spawn(&adapter, &config).await;

        wait_for_state(&mut events, ConnectionState::Pairing).await;
        match next_event(&mut events).await {
            Event::DeviceDiscovered(device) => assert!(device.bonded),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            next_event(&mut events).await,
            Event::Toast("No new devices found".into())
        );
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_connect_to_absent_peer_fails_once() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        let (handle, mut events) = spawn(&adapter, &config()).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;

        handle.connect(addr("00:00:00:00:00:09"), None).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Connecting)
        );
        match next_event(&mut events).await {
            Event::Toast(text) => assert!(text.starts_with("Unable to connect device")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Disconnected)
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_while_connecting_rejected() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        adapter.set_dial_latency(Duration::from_secs(2));
        let (handle, mut events) = spawn(&adapter, &config()).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;

        handle.connect(addr("00:00:00:00:00:09"), None).unwrap();
        handle.connect(addr("00:00:00:00:00:09"), None).unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Connecting)
        );
        assert_eq!(
            next_event(&mut events).await,
            Event::Toast(BtError::ConnectInProgress.toast_text())
        );

        // Disconnect cancels the dial.
        handle.disconnect().unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn test_power_cycle() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        let (handle, mut events) = spawn(&adapter, &config()).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;

        adapter.set_powered(false);
        assert_eq!(
            next_event(&mut events).await,
            Event::Toast("Bluetooth turning off - disconnecting".into())
        );
        wait_for_state(&mut events, ConnectionState::Inactive).await;
        assert!(!adapter.is_listening());

        adapter.set_powered(true);
        assert_eq!(
            next_event(&mut events).await,
            Event::Toast("Bluetooth enabled".into())
        );
        wait_for_state(&mut events, ConnectionState::Disconnected).await;
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_acceptor_failure_restarts_listening() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        let (handle, mut events) = spawn(&adapter, &config()).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;

        adapter.fail_acceptor();
        assert_eq!(
            next_event(&mut events).await,
            Event::Toast("Bluetooth error: acceptor closed".into())
        );
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
        assert!(adapter.is_listening());

        // The new acceptor takes inbound links.
        let peer = radio.adapter(addr("00:00:00:00:00:02"), "B");
        let mut link = peer
            .connect(adapter.address(), config().service(), true)
            .await
            .unwrap();
        let hello = Hello::new(peer.address().clone(), "B");
        link.write_all(&hello.to_frame(config().session.max_frame_len).unwrap())
            .await
            .unwrap();
        wait_for_state(&mut events, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_scan_error_reported() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        adapter.set_scan_error(Some(BtError::scan("radio busy")));
        let (handle, mut events) = spawn(&adapter, &config()).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;

        handle.scan_start().unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Pairing)
        );
        assert_eq!(
            next_event(&mut events).await,
            Event::Toast("Could not search for devices: radio busy".into())
        );
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Disconnected)
        );
        assert!(!adapter.is_discovering());
        assert!(adapter.is_listening());
    }

    #[tokio::test]
    async fn test_scan_stop_returns_to_disconnected() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        adapter.set_scan_duration(Duration::from_secs(30));
        let (handle, mut events) = spawn(&adapter, &config()).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;

        handle.scan_start().unwrap();
        wait_for_state(&mut events, ConnectionState::Pairing).await;
        assert!(adapter.is_discovering());

        handle.scan_stop().unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Disconnected)
        );
        assert!(!adapter.is_discovering());

        // Stopping again changes nothing.
        handle.scan_stop().unwrap();
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_while_pairing_stops_scan() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "A");
        adapter.set_scan_duration(Duration::from_secs(30));
        let (handle, mut events) = spawn(&adapter, &config()).await;
        wait_for_state(&mut events, ConnectionState::Disconnected).await;

        handle.scan_start().unwrap();
        wait_for_state(&mut events, ConnectionState::Pairing).await;

        handle.disconnect().unwrap();
        assert_eq!(
            next_event(&mut events).await,
            Event::StateChanged(ConnectionState::Disconnected)
        );
        assert_eq!(handle.state().await.unwrap(), ConnectionState::Disconnected);
        assert!(!adapter.is_discovering());
        assert!(adapter.is_listening());
        assert!(events.try_recv().is_err());
    }
}
