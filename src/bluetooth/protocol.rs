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

//! HELLO handshake exchanged before a session is bound.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::device::DeviceAddress;
use super::frame::{encode_frame, FrameDecoder, FrameKind};
use super::platform::BoxLink;
use crate::error::{BtError, Result};

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Read buffer size for link reads.
pub const READ_BUFFER_LEN: usize = 1024;

/// HELLO payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Protocol version
    #[serde(rename = "v")]
    pub version: u8,

    /// Sender's adapter address
    #[serde(rename = "addr")]
    pub address: DeviceAddress,

    /// Sender's display name
    #[serde(rename = "name")]
    pub name: String,
}

impl Hello {
    pub fn new(address: DeviceAddress, name: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            address,
            name: name.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| BtError::handshake(e.to_string()))
    }

    pub fn from_json(json: &[u8]) -> Result<Self> {
        let hello: Self =
            serde_json::from_slice(json).map_err(|e| BtError::handshake(e.to_string()))?;
        if hello.version != PROTOCOL_VERSION {
            return Err(BtError::handshake(format!(
                "unsupported protocol version {}",
                hello.version
            )));
        }
        Ok(hello)
    }

    /// Encode as a HELLO frame.
    pub fn to_frame(&self, max_len: usize) -> Result<Vec<u8>> {
        encode_frame(FrameKind::Hello, self.to_json()?.as_bytes(), max_len)
    }
}

/// Dialer side: send our HELLO, then wait for the acceptor's reply.
///
/// The reply only arrives once the acceptor has bound the link.
pub async fn client_handshake(
    mut link: BoxLink,
    local: &Hello,
    max_len: usize,
    timeout: Duration,
) -> Result<(BoxLink, Hello, FrameDecoder)> {
    let frame = local.to_frame(max_len)?;
    let exchange = async {
        write_all(&mut link, &frame).await?;
        read_hello(&mut link, max_len).await
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(Ok((hello, decoder))) => Ok((link, hello, decoder)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BtError::handshake("timed out waiting for reply")),
    }
}

/// Acceptor side: wait for the dialer's HELLO. The reply is sent later, by
/// whoever binds the link.
pub async fn server_handshake(
    mut link: BoxLink,
    max_len: usize,
    timeout: Duration,
) -> Result<(BoxLink, Hello, FrameDecoder)> {
    match tokio::time::timeout(timeout, read_hello(&mut link, max_len)).await {
        Ok(Ok((hello, decoder))) => Ok((link, hello, decoder)),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(BtError::handshake("timed out waiting for hello")),
    }
}

async fn write_all(link: &mut BoxLink, bytes: &[u8]) -> Result<()> {
    link.write_all(bytes)
        .await
        .map_err(|e| BtError::handshake(e.to_string()))?;
    link.flush()
        .await
        .map_err(|e| BtError::handshake(e.to_string()))
}

async fn read_hello(link: &mut BoxLink, max_len: usize) -> Result<(Hello, FrameDecoder)> {
    let mut decoder = FrameDecoder::new(max_len);
    let mut buf = [0u8; READ_BUFFER_LEN];

    loop {
        if let Some(frame) = decoder
            .next_frame()
            .map_err(|e| BtError::handshake(e.to_string()))?
        {
            return match frame.kind {
                FrameKind::Hello => {
                    let hello = Hello::from_json(&frame.payload)?;
                    debug!("HELLO from {} ({})", hello.name, hello.address);
                    Ok((hello, decoder))
                }
                FrameKind::Data => Err(BtError::handshake("data before hello")),
            };
        }

        let n = link
            .read(&mut buf)
            .await
            .map_err(|e| BtError::handshake(e.to_string()))?;
        if n == 0 {
            return Err(BtError::handshake("link closed"));
        }
        decoder.push(&buf[..n]);
    }
}
