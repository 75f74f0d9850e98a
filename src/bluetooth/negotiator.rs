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

//! Connection negotiation: one listening acceptor and at most one outbound
//! dial, racing to produce a single handshaken link.
//!
//! The accepting side of a link is its arbiter. A dialer adopts its link when
//! the reply HELLO arrives; an acceptor adopts an inbound link at once unless
//! it is dialing the same peer, in which case the link dialed by the greater
//! address wins and the other one is parked until the race settles.
//!
//! A parked link is only adopted over our own dial while that dial has not
//! yet sent its HELLO. Once the HELLO may have reached the peer, the peer can
//! adopt the dialed link at any moment, so the dial's own outcome decides.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::device::{DeviceAddress, DeviceDescriptor};
use super::frame::FrameDecoder;
use super::platform::{Acceptor, BluetoothAdapter, BoxLink, ServiceId};
use super::protocol::{client_handshake, server_handshake, Hello};
use super::session::{ConnectionRole, ReadyLink};
use crate::error::{BtError, Result};

/// Negotiation parameters.
#[derive(Debug, Clone)]
pub struct NegotiatorConfig {
    pub service: ServiceId,
    pub secure_listen: bool,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// How long a parked link or an absorbed dial failure waits for the
    /// other path.
    pub race_settle: Duration,
    pub max_frame_len: usize,
}

/// Progress reported by the acceptor and dial tasks.
#[derive(Debug)]
pub enum NegotiationSignal {
    LinkReady(ReadyLink),
    ConnectFailed { attempt: u64, error: BtError },
    AcceptFailed(BtError),
}

/// Outcome of feeding a signal to the negotiator.
#[derive(Debug)]
pub enum Resolution {
    /// Bind this link.
    Adopt(ReadyLink),
    /// Nothing to do yet.
    Pending,
    /// Both paths are exhausted.
    Failed(BtError),
}

/// How far an outbound dial has got.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DialPhase {
    Connecting,
    /// Transport up; our HELLO is being or has been written.
    Greeting,
    /// Given up in favour of a parked link. The dial must not greet.
    Abandoned,
}

struct Outbound {
    target: DeviceAddress,
    attempt: u64,
    task: JoinHandle<()>,
    phase: Arc<Mutex<DialPhase>>,
}

impl Outbound {
    /// Abandon the dial unless its HELLO is already out.
    fn try_abandon(&self) -> bool {
        let mut phase = self.phase.lock();
        if *phase == DialPhase::Greeting {
            return false;
        }
        *phase = DialPhase::Abandoned;
        true
    }
}

pub struct Negotiator {
    adapter: Arc<dyn BluetoothAdapter>,
    config: NegotiatorConfig,
    local: Hello,
    signals: mpsc::UnboundedSender<NegotiationSignal>,
    acceptor: Option<JoinHandle<()>>,
    outbound: Option<Outbound>,
    /// Peer of the negotiation in progress.
    awaiting: Option<DeviceAddress>,
    parked: Option<ReadyLink>,
    deadline: Option<Instant>,
    last_error: Option<BtError>,
    next_attempt: u64,
}

impl Negotiator {
    pub fn new(
        adapter: Arc<dyn BluetoothAdapter>,
        config: NegotiatorConfig,
        local: Hello,
        signals: mpsc::UnboundedSender<NegotiationSignal>,
    ) -> Self {
        Self {
            adapter,
            config,
            local,
            signals,
            acceptor: None,
            outbound: None,
            awaiting: None,
            parked: None,
            deadline: None,
            last_error: None,
            next_attempt: 0,
        }
    }

    /// Our HELLO, written by whoever binds a link we accepted.
    pub fn greeting(&self) -> Result<Vec<u8>> {
        self.local.to_frame(self.config.max_frame_len)
    }

    /// Start accepting inbound links. No-op if already listening.
    pub async fn listen(&mut self) -> Result<()> {
        if self.is_listening() {
            return Ok(());
        }

        let acceptor = self
            .adapter
            .listen(self.config.service, self.config.secure_listen)
            .await?;
        info!(
            "Listening on RFCOMM channel {} (secure: {})",
            self.config.service.channel, self.config.secure_listen
        );

        self.acceptor = Some(tokio::spawn(accept_loop(
            acceptor,
            self.config.max_frame_len,
            self.config.handshake_timeout,
            self.signals.clone(),
        )));
        Ok(())
    }

    /// Close the acceptor and any inbound link still handshaking.
    pub async fn stop_listening(&mut self) {
        if let Some(task) = self.acceptor.take() {
            task.abort();
            let _ = task.await;
            info!("Stopped listening");
        }
    }

    pub fn is_listening(&self) -> bool {
        self.acceptor.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Whether a negotiation is in progress.
    pub fn is_negotiating(&self) -> bool {
        self.awaiting.is_some()
    }

    /// When `on_deadline` must next be called.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Dial `target`, replacing any negotiation in progress.
    pub async fn connect(&mut self, target: DeviceDescriptor, secure: bool) -> u64 {
        self.cancel().await;

        self.next_attempt += 1;
        let attempt = self.next_attempt;
        info!(
            "Dialing {} ({}), attempt {}, secure: {}",
            target.name, target.address, attempt, secure
        );

        let phase = Arc::new(Mutex::new(DialPhase::Connecting));
        let task = tokio::spawn(dial(
            self.adapter.clone(),
            target.clone(),
            secure,
            self.config.clone(),
            self.local.clone(),
            attempt,
            phase.clone(),
            self.signals.clone(),
        ));

        self.awaiting = Some(target.address.clone());
        self.outbound = Some(Outbound {
            target: target.address,
            attempt,
            task,
            phase,
        });
        attempt
    }

    /// A link finished its handshake.
    pub async fn on_link(&mut self, ready: ReadyLink) -> Resolution {
        match ready.role {
            ConnectionRole::Client => {
                let current = self.outbound.as_ref().map(|o| o.attempt);
                if ready.attempt.is_none() || ready.attempt != current {
                    debug!("Dropping stale dialed link to {}", ready.peer.address);
                    return Resolution::Pending;
                }
                // The dial task has finished; nothing to abort.
                self.outbound = None;
                if self.parked.is_some() {
                    info!("Our dial to {} won; closing parked link", ready.peer.address);
                }
                self.clear();
                Resolution::Adopt(ready)
            }
            ConnectionRole::Server => {
                let from = ready.peer.address.clone();
                let racing = self.outbound.is_some() && self.awaiting.as_ref() == Some(&from);

                if racing && from < self.local.address {
                    info!("Parking inbound link from {} while our dial settles", from);
                    self.parked = Some(ready);
                    self.deadline
                        .get_or_insert_with(|| Instant::now() + self.config.race_settle);
                    return Resolution::Pending;
                }

                if self.outbound.is_some() {
                    info!("Inbound link from {} won; cancelling our dial", from);
                }
                self.abort_outbound().await;
                self.clear();
                Resolution::Adopt(ready)
            }
        }
    }

    /// Our dial failed.
    pub async fn on_connect_failed(&mut self, attempt: u64, error: BtError) -> Resolution {
        if self.outbound.as_ref().map(|o| o.attempt) != Some(attempt) {
            debug!("Ignoring failure of stale attempt {}", attempt);
            return Resolution::Pending;
        }
        self.outbound = None;
        warn!("Dial attempt {} failed: {}", attempt, error);
        self.last_error = Some(error);

        if let Some(parked) = self.parked.take() {
            info!("Adopting parked link from {}", parked.peer.address);
            self.clear();
            return Resolution::Adopt(parked);
        }

        if self.is_listening() {
            // The peer may still dial in.
            self.deadline
                .get_or_insert_with(|| Instant::now() + self.config.race_settle);
            return Resolution::Pending;
        }

        self.fail()
    }

    /// The acceptor stopped.
    pub fn on_accept_failed(&mut self, error: BtError) -> Resolution {
        error!("Acceptor failed: {}", error);
        self.acceptor = None;

        if self.is_negotiating() && self.outbound.is_none() && self.parked.is_none() {
            if self.last_error.is_none() {
                self.last_error = Some(error);
            }
            return self.fail();
        }
        Resolution::Pending
    }

    /// The race-settle deadline passed.
    ///
    /// A parked link is adopted only if our dial can still be abandoned.
    /// Otherwise the dial's result or failure resolves the race.
    pub async fn on_deadline(&mut self) -> Resolution {
        self.deadline = None;

        if self.parked.is_some() && self.outbound.as_ref().is_some_and(|o| !o.try_abandon()) {
            debug!("HELLO already sent; waiting for our dial to finish");
            return Resolution::Pending;
        }

        if let Some(parked) = self.parked.take() {
            info!(
                "Dial did not settle; adopting parked link from {}",
                parked.peer.address
            );
            self.abort_outbound().await;
            self.clear();
            return Resolution::Adopt(parked);
        }

        if self.is_negotiating() && self.outbound.is_none() {
            return self.fail();
        }
        Resolution::Pending
    }

    /// Abandon the negotiation in progress, releasing every link it holds.
    pub async fn cancel(&mut self) {
        self.abort_outbound().await;
        if let Some(parked) = self.parked.take() {
            debug!("Closing parked link from {}", parked.peer.address);
        }
        self.clear();
    }

    fn fail(&mut self) -> Resolution {
        let error = match self.last_error.take() {
            Some(BtError::ConnectFailed(e)) => BtError::ConnectFailed(e),
            Some(e) => BtError::connect(e.to_string()),
            None => BtError::connect("no connection"),
        };
        self.clear();
        Resolution::Failed(error)
    }

    fn clear(&mut self) {
        self.awaiting = None;
        self.parked = None;
        self.deadline = None;
        self.last_error = None;
    }

    async fn abort_outbound(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            outbound.task.abort();
            let _ = outbound.task.await;
            debug!(
                "Dial attempt {} to {} cancelled",
                outbound.attempt, outbound.target
            );
        }
    }
}

impl Drop for Negotiator {
    fn drop(&mut self) {
        if let Some(task) = self.acceptor.take() {
            task.abort();
        }
        if let Some(outbound) = self.outbound.take() {
            outbound.task.abort();
        }
    }
}

type HandshakeResult = (DeviceAddress, Result<(BoxLink, Hello, FrameDecoder)>);

async fn accept_loop(
    mut acceptor: Box<dyn Acceptor>,
    max_frame_len: usize,
    handshake_timeout: Duration,
    signals: mpsc::UnboundedSender<NegotiationSignal>,
) {
    let mut handshakes: JoinSet<HandshakeResult> = JoinSet::new();

    loop {
        tokio::select! {
            accepted = acceptor.accept() => match accepted {
                Ok((link, address)) => {
                    info!("Accepted link from {}", address);
                    handshakes.spawn(async move {
                        let result = server_handshake(link, max_frame_len, handshake_timeout).await;
                        (address, result)
                    });
                }
                Err(e) => {
                    let _ = signals.send(NegotiationSignal::AcceptFailed(e));
                    return;
                }
            },
            Some(done) = handshakes.join_next(), if !handshakes.is_empty() => match done {
                Ok((address, Ok((link, hello, decoder)))) => {
                    if hello.address != address {
                        debug!("Peer {} introduced itself as {}", address, hello.address);
                    }
                    let ready = ReadyLink {
                        link,
                        decoder,
                        peer: DeviceDescriptor::new(address, hello.name, false),
                        role: ConnectionRole::Server,
                        attempt: None,
                    };
                    if signals.send(NegotiationSignal::LinkReady(ready)).is_err() {
                        return;
                    }
                }
                Ok((address, Err(e))) => warn!("Inbound handshake from {} failed: {}", address, e),
                Err(e) => warn!("Inbound handshake task failed: {}", e),
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dial(
    adapter: Arc<dyn BluetoothAdapter>,
    target: DeviceDescriptor,
    secure: bool,
    config: NegotiatorConfig,
    local: Hello,
    attempt: u64,
    phase: Arc<Mutex<DialPhase>>,
    signals: mpsc::UnboundedSender<NegotiationSignal>,
) {
    let result = async {
        let link = tokio::time::timeout(
            config.connect_timeout,
            adapter.connect(&target.address, config.service, secure),
        )
        .await
        .map_err(|_| BtError::connect("timed out"))??;
        if !enter_greeting(&phase) {
            debug!("Dial to {} abandoned before HELLO", target.address);
            return Err(BtError::connect("abandoned"));
        }
        debug!("Link to {} up, sending HELLO", target.address);
        client_handshake(link, &local, config.max_frame_len, config.handshake_timeout).await
    }
    .await;

    let signal = match result {
        Ok((link, hello, decoder)) => NegotiationSignal::LinkReady(ReadyLink {
            link,
            decoder,
            peer: DeviceDescriptor::new(target.address, hello.name, target.bonded),
            role: ConnectionRole::Client,
            attempt: Some(attempt),
        }),
        Err(error) => NegotiationSignal::ConnectFailed { attempt, error },
    };
    let _ = signals.send(signal);
}

fn enter_greeting(phase: &Mutex<DialPhase>) -> bool {
    let mut phase = phase.lock();
    if *phase == DialPhase::Abandoned {
        return false;
    }
    *phase = DialPhase::Greeting;
    true
}
