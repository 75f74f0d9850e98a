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

//! An established, framed connection to one peer.
//!
//! The link is split into a reader task and a writer task. Sends are queued
//! and never block the caller. The first I/O failure on either side ends the
//! session and is reported exactly once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::device::DeviceDescriptor;
use super::frame::{encode_frame, FrameDecoder, FrameKind};
use super::platform::BoxLink;
use super::protocol::READ_BUFFER_LEN;
use crate::error::{BtError, Result};
use crate::events::{Event, EventBus, InboundMessage, OutboundMessage, SessionEndCause};

/// Which side established the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    /// We accepted it.
    Server,
    /// We dialed it.
    Client,
}

/// A handshaken link waiting to be bound to a session.
pub struct ReadyLink {
    pub link: BoxLink,
    /// Holds any bytes read past the peer's HELLO.
    pub decoder: FrameDecoder,
    pub peer: DeviceDescriptor,
    pub role: ConnectionRole,
    /// Dial attempt that produced the link (client side only).
    pub attempt: Option<u64>,
}

impl std::fmt::Debug for ReadyLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadyLink")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// Terminal notice from a session's tasks to its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    pub session: u64,
    pub cause: SessionEndCause,
}

/// Reports the end of a session at most once.
#[derive(Clone)]
struct EndNotifier {
    session: u64,
    ended: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<SessionEnd>,
}

impl EndNotifier {
    fn fire(&self, cause: SessionEndCause) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Session {} ended: {}", self.session, cause);
        let _ = self.tx.send(SessionEnd {
            session: self.session,
            cause,
        });
    }
}

/// A live session.
pub struct Session {
    id: u64,
    peer: DeviceDescriptor,
    role: ConnectionRole,
    max_frame_len: usize,
    queue: mpsc::UnboundedSender<Vec<u8>>,
    ended: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl Session {
    /// Bind a handshaken link and start its reader and writer.
    ///
    /// `greeting` is written before any queued message and is not echoed.
    pub fn start(
        id: u64,
        ready: ReadyLink,
        greeting: Option<Vec<u8>>,
        max_frame_len: usize,
        bus: EventBus,
        end_tx: mpsc::UnboundedSender<SessionEnd>,
    ) -> Self {
        let ReadyLink {
            link,
            decoder,
            peer,
            role,
            ..
        } = ready;

        let ended = Arc::new(AtomicBool::new(false));
        let notifier = EndNotifier {
            session: id,
            ended: ended.clone(),
            tx: end_tx,
        };

        let (read_half, write_half) = tokio::io::split(link);
        let (queue, queue_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(read_loop(
            read_half,
            decoder,
            peer.clone(),
            bus.clone(),
            notifier.clone(),
        ));
        let writer = tokio::spawn(write_loop(
            write_half,
            queue_rx,
            greeting,
            max_frame_len,
            bus,
            notifier,
        ));

        info!(
            "Session {} started with {} ({}) as {:?}",
            id, peer.name, peer.address, role
        );

        Self {
            id,
            peer,
            role,
            max_frame_len,
            queue,
            ended,
            reader: Some(reader),
            writer: Some(writer),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> &DeviceDescriptor {
        &self.peer
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    pub fn is_closed(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Queue a message. Returns immediately; write failures end the session.
    pub fn send(&self, bytes: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(BtError::NotConnected);
        }
        if bytes.len() > self.max_frame_len {
            return Err(BtError::Frame(format!(
                "message of {} bytes exceeds limit of {}",
                bytes.len(),
                self.max_frame_len
            )));
        }
        self.queue.send(bytes).map_err(|_| BtError::NotConnected)
    }

    /// Release the link. Idempotent; no end notice is sent for a close.
    pub async fn close(&mut self) {
        self.ended.store(true, Ordering::SeqCst);

        let handles = [self.reader.take(), self.writer.take()];
        if handles.iter().all(Option::is_none) {
            return;
        }

        for handle in handles.into_iter().flatten() {
            handle.abort();
            let _ = handle.await;
        }
        debug!("Session {} closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in [self.reader.take(), self.writer.take()].into_iter().flatten() {
            handle.abort();
        }
    }
}

async fn read_loop(
    mut reader: ReadHalf<BoxLink>,
    mut decoder: FrameDecoder,
    peer: DeviceDescriptor,
    bus: EventBus,
    notifier: EndNotifier,
) {
    let mut buf = [0u8; READ_BUFFER_LEN];

    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => match frame.kind {
                    FrameKind::Data => {
                        debug!("Received {} bytes from {}", frame.payload.len(), peer.address);
                        bus.publish(Event::MessageReceived {
                            message: InboundMessage::new(frame.payload),
                            from: peer.address.clone(),
                            name: peer.name.clone(),
                        });
                    }
                    FrameKind::Hello => warn!("Ignoring HELLO from {} mid-session", peer.address),
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Framing error from {}: {}", peer.address, e);
                    notifier.fire(SessionEndCause::ReadFailed(e.to_string()));
                    return;
                }
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("Connection closed by remote");
                notifier.fire(SessionEndCause::PeerClosed);
                return;
            }
            Ok(n) => decoder.push(&buf[..n]),
            Err(e) => {
                error!("Read error: {}", e);
                notifier.fire(SessionEndCause::ReadFailed(e.to_string()));
                return;
            }
        }
    }
}

async fn write_loop(
    mut writer: WriteHalf<BoxLink>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    greeting: Option<Vec<u8>>,
    max_frame_len: usize,
    bus: EventBus,
    notifier: EndNotifier,
) {
    if let Some(greeting) = greeting {
        if let Err(e) = write_frame(&mut writer, &greeting).await {
            error!("Write error: {}", e);
            notifier.fire(SessionEndCause::WriteFailed(e.to_string()));
            return;
        }
    }

    while let Some(bytes) = queue.recv().await {
        let frame = match encode_frame(FrameKind::Data, &bytes, max_frame_len) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping message: {}", e);
                continue;
            }
        };

        match write_frame(&mut writer, &frame).await {
            Ok(()) => {
                debug!("Sent {} bytes", bytes.len());
                bus.publish(Event::MessageSent(OutboundMessage::new(bytes)));
            }
            Err(e) => {
                error!("Write error: {}", e);
                notifier.fire(SessionEndCause::WriteFailed(e.to_string()));
                return;
            }
        }
    }
}

async fn write_frame(writer: &mut WriteHalf<BoxLink>, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await
}
