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

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use gethostname::gethostname;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

use crate::bluetooth::{NegotiatorConfig, ServiceId};

/// Service UUID shared by every chat endpoint.
pub const DEFAULT_SERVICE_UUID: Uuid = Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66);

/// Get a sanitized hostname suitable for Bluetooth device name.
/// Bluetooth names should only contain alphanumeric chars, spaces, and hyphens.
fn get_sanitized_hostname() -> String {
    let hostname = gethostname().to_string_lossy().to_string();
    sanitize_name(&hostname)
}

fn sanitize_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == ' ' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let trimmed = sanitized.trim_matches('-');
    if trimmed.is_empty() {
        "PairIt".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Bluetooth settings.
    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    /// Session timing and limits.
    #[serde(default)]
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Name sent to peers in the HELLO.
    /// This is always computed at runtime from the system hostname.
    #[serde(skip)]
    pub device_name: String,

    /// Service identifier the chat service is keyed by.
    pub service_uuid: Uuid,

    /// RFCOMM channel to listen and dial on.
    pub rfcomm_channel: u8,

    /// Require an authenticated, encrypted link for inbound connections.
    pub secure_listen: bool,

    /// Start a scan whenever the adapter becomes usable.
    pub auto_scan: bool,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            device_name: get_sanitized_hostname(),
            service_uuid: DEFAULT_SERVICE_UUID,
            rfcomm_channel: 1,
            secure_listen: true,
            auto_scan: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub connect_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    /// Grace period for the losing side of a simultaneous connect.
    pub race_settle_ms: u64,
    pub scan_timeout_secs: u64,
    pub max_frame_len: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 12,
            handshake_timeout_secs: 5,
            race_settle_ms: 1500,
            scan_timeout_secs: 12,
            max_frame_len: 64 * 1024,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pairit")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let path = Self::path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        if path.exists() {
            Self::load_from(&path)
        } else {
            let config = Self::default();
            config.save_to(&path)?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        config.bluetooth.device_name = get_sanitized_hostname();
        config.validate();
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Clamp values the negotiation cannot work with.
    fn validate(&mut self) {
        let session = &mut self.session;

        if session.handshake_timeout_secs == 0 {
            warn!("handshake_timeout_secs must be positive; using 1");
            session.handshake_timeout_secs = 1;
        }

        // The settle window has to end while the peer still awaits our reply.
        let ceiling = session.handshake_timeout_secs * 1000 / 2;
        if session.race_settle_ms >= session.handshake_timeout_secs * 1000 {
            warn!(
                "race_settle_ms {} exceeds the handshake timeout; using {}",
                session.race_settle_ms, ceiling
            );
            session.race_settle_ms = ceiling;
        }

        if session.max_frame_len == 0 {
            warn!("max_frame_len must be positive; using 65536");
            session.max_frame_len = 64 * 1024;
        }
    }

    /// Override the advertised name.
    pub fn with_device_name(mut self, name: &str) -> Self {
        self.bluetooth.device_name = sanitize_name(name);
        self
    }

    pub fn service(&self) -> ServiceId {
        ServiceId {
            uuid: self.bluetooth.service_uuid,
            channel: self.bluetooth.rfcomm_channel,
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.session.scan_timeout_secs)
    }

    /// Parameters for the connection negotiator.
    pub fn negotiator(&self) -> NegotiatorConfig {
        NegotiatorConfig {
            service: self.service(),
            secure_listen: self.bluetooth.secure_listen,
            connect_timeout: Duration::from_secs(self.session.connect_timeout_secs),
            handshake_timeout: Duration::from_secs(self.session.handshake_timeout_secs),
            race_settle: Duration::from_millis(self.session.race_settle_ms),
            max_frame_len: self.session.max_frame_len,
        }
    }
}
