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

//! Length-prefixed framing over the RFCOMM byte stream.
//!
//! Frame layout: `[kind: u8][len: u32 BE][payload: len bytes]`.

use tracing::{debug, warn};

use crate::error::{BtError, Result};

/// Size of the frame header.
pub const HEADER_LEN: usize = 5;

/// Default upper bound on a frame payload.
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024;

/// Frame kinds on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Hello = 0x01,
    Data = 0x02,
}

impl TryFrom<u8> for FrameKind {
    type Error = BtError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Data),
            other => Err(BtError::Frame(format!("unknown frame kind 0x{:02x}", other))),
        }
    }
}

/// A complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

/// Encode one frame.
pub fn encode_frame(kind: FrameKind, payload: &[u8], max_len: usize) -> Result<Vec<u8>> {
    if payload.len() > max_len {
        return Err(BtError::Frame(format!(
            "message of {} bytes exceeds limit of {}",
            payload.len(),
            max_len
        )));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Reassembles frames from arbitrarily split or merged reads.
pub struct FrameDecoder {
    buffer: Vec<u8>,
    max_len: usize,
}

impl FrameDecoder {
    /// Create a new decoder.
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(1024),
            max_len,
        }
    }

    /// Append bytes from one read call.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete frame, if one is buffered.
    ///
    /// A header announcing more than `max_len` bytes, or an unknown kind, is
    /// an error; the stream cannot be resynchronized after that.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = FrameKind::try_from(self.buffer[0])?;
        let len = u32::from_be_bytes([
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
            self.buffer[4],
        ]) as usize;

        if len > self.max_len {
            warn!("Frame too large: {} bytes (limit {})", len, self.max_len);
            return Err(BtError::Frame(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_len
            )));
        }

        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let payload = self.buffer[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buffer.drain(..HEADER_LEN + len);
        debug!("Frame complete: {:?}, {} bytes", kind, len);
        Ok(Some(Frame { kind, payload }))
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}
