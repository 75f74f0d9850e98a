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

//! Device descriptors and the device registry.
//!
//! The registry merges the bonded-device cache and live discovery into one
//! deduplicated set keyed by address.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::platform::{BluetoothAdapter, DiscoveryStream};
use crate::error::{BtError, Result};

/// Opaque hardware identifier of a device, normalized to upper case.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().trim().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = String;

    /// Parse a colon-separated `AA:BB:CC:DD:EE:FF` address.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let octets: Vec<&str> = s.split(':').collect();
        let valid = octets.len() == 6
            && octets
                .iter()
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if valid {
            Ok(Self::new(s))
        } else {
            Err(format!("invalid device address: {}", s))
        }
    }
}

/// Immutable snapshot of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub address: DeviceAddress,
    pub name: String,
    pub bonded: bool,
}

impl DeviceDescriptor {
    pub fn new(address: DeviceAddress, name: impl Into<String>, bonded: bool) -> Self {
        Self {
            address,
            name: name.into(),
            bonded,
        }
    }

    /// Descriptor for an address nothing is known about.
    pub fn unknown(address: DeviceAddress) -> Self {
        let name = address.to_string();
        Self {
            address,
            name,
            bonded: false,
        }
    }
}

/// Progress of a running scan, tagged with the scan it belongs to.
#[derive(Debug)]
pub enum ScanUpdate {
    Found { scan: u64, device: DeviceDescriptor },
    Finished { scan: u64, error: Option<BtError> },
}

struct ScanTask {
    id: u64,
    task: JoinHandle<()>,
}

/// Deduplicated view of bonded and discovered devices.
pub struct DeviceRegistry {
    adapter: Arc<dyn BluetoothAdapter>,
    scan_timeout: Duration,
    devices: BTreeMap<DeviceAddress, DeviceDescriptor>,
    scan: Option<ScanTask>,
    next_scan: u64,
}

impl DeviceRegistry {
    pub fn new(adapter: Arc<dyn BluetoothAdapter>, scan_timeout: Duration) -> Self {
        Self {
            adapter,
            scan_timeout,
            devices: BTreeMap::new(),
            scan: None,
            next_scan: 0,
        }
    }

    /// Bonded devices from the platform cache. Each is recorded.
    pub async fn list_bonded(&mut self) -> Result<Vec<DeviceDescriptor>> {
        if !self.adapter.is_enabled().await? {
            return Err(BtError::AdapterUnavailable);
        }

        let bonded = self.adapter.bonded_devices().await?;
        for device in &bonded {
            self.record(device.clone());
        }
        Ok(bonded)
    }

    /// Lazy, finite discovery sequence.
    ///
    /// Ends when the platform reports completion or `scan_timeout` elapses.
    /// Fails with `AdapterUnavailable` without emitting anything if the
    /// adapter is off.
    pub async fn scan(&self) -> Result<DiscoveryStream> {
        if !self.adapter.is_enabled().await? {
            return Err(BtError::AdapterUnavailable);
        }

        let stream = self.adapter.discover().await?;
        Ok(stream
            .take_until(tokio::time::sleep(self.scan_timeout))
            .boxed())
    }

    /// Run a scan in the background, forwarding results to `sink`.
    ///
    /// Restarts any scan already running. Returns the scan id used to tag
    /// updates.
    pub async fn start_scan(&mut self, sink: mpsc::UnboundedSender<ScanUpdate>) -> Result<u64> {
        self.stop_scan().await;

        let mut stream = self.scan().await?;
        self.next_scan += 1;
        let id = self.next_scan;

        let task = tokio::spawn(async move {
            let mut error = None;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(device) => {
                        if sink.send(ScanUpdate::Found { scan: id, device }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Discovery aborted: {}", e);
                        error = Some(e);
                        break;
                    }
                }
            }
            // Dropping the stream here releases the platform scan.
            drop(stream);
            let _ = sink.send(ScanUpdate::Finished { scan: id, error });
        });

        info!("Scan {} started", id);
        self.scan = Some(ScanTask { id, task });
        Ok(id)
    }

    /// Stop the running scan, if any. Idempotent.
    ///
    /// Returns once the scan task is gone and the platform scan released.
    pub async fn stop_scan(&mut self) -> bool {
        match self.scan.take() {
            Some(scan) => {
                scan.task.abort();
                let _ = scan.task.await;
                info!("Scan {} stopped", scan.id);
                true
            }
            None => false,
        }
    }

    /// Forget the handle of a scan that finished by itself.
    pub fn scan_finished(&mut self, id: u64) -> bool {
        if self.scan.as_ref().map(|s| s.id) == Some(id) {
            self.scan = None;
            true
        } else {
            false
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.scan.is_some()
    }

    /// Whether `id` is the scan currently running.
    pub fn is_current_scan(&self, id: u64) -> bool {
        self.scan.as_ref().map(|s| s.id) == Some(id)
    }

    /// Record a descriptor, replacing any older one for the same address.
    ///
    /// Returns true if the set changed.
    pub fn record(&mut self, device: DeviceDescriptor) -> bool {
        match self.devices.get(&device.address) {
            Some(existing) if *existing == device => false,
            _ => {
                debug!("Device recorded: {} ({})", device.name, device.address);
                self.devices.insert(device.address.clone(), device);
                true
            }
        }
    }

    pub fn get(&self, address: &DeviceAddress) -> Option<&DeviceDescriptor> {
        self.devices.get(address)
    }

    /// Snapshot of all known devices, ordered by address.
    pub fn devices(&self) -> Vec<DeviceDescriptor> {
        self.devices.values().cloned().collect()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        if let Some(scan) = self.scan.take() {
            scan.task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::sim::SimRadio;

    fn addr(s: &str) -> DeviceAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_address_parsing() {
        let a: DeviceAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(a.as_str(), "AA:BB:CC:DD:EE:FF");
        assert!("AA:BB:CC".parse::<DeviceAddress>().is_err());
        assert!("GG:BB:CC:DD:EE:FF".parse::<DeviceAddress>().is_err());
    }

    #[test]
    fn test_address_ordering() {
        assert!(addr("00:00:00:00:00:02") > addr("00:00:00:00:00:01"));
    }

    #[tokio::test]
    async fn test_dedup_keeps_latest_name() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "local");
        let mut registry = DeviceRegistry::new(adapter, Duration::from_secs(1));

        let a = addr("00:00:00:00:00:0A");
        assert!(registry.record(DeviceDescriptor::new(a.clone(), "unknown", false)));
        assert!(registry.record(DeviceDescriptor::new(a.clone(), "Phone", false)));
        assert!(!registry.record(DeviceDescriptor::new(a.clone(), "Phone", false)));

        let devices = registry.devices();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].name, "Phone");
    }

    #[tokio::test]
    async fn test_scan_fails_when_adapter_off() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "local");
        adapter.set_powered(false);
        let mut registry = DeviceRegistry::new(adapter, Duration::from_secs(1));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = registry.start_scan(tx).await;
        assert_eq!(result.err(), Some(BtError::AdapterUnavailable));
        assert!(!registry.is_scanning());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_scan_runs_to_completion() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "local");
        adapter.set_scan_results(vec![
            DeviceDescriptor::new(addr("00:00:00:00:00:0B"), "B", false),
            DeviceDescriptor::new(addr("00:00:00:00:00:0C"), "C", false),
        ]);
        let mut registry = DeviceRegistry::new(adapter, Duration::from_secs(5));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = registry.start_scan(tx).await.unwrap();

        let mut found = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                ScanUpdate::Found { scan, device } => {
                    assert_eq!(scan, id);
                    found.push(device.name);
                }
                ScanUpdate::Finished { scan, error } => {
                    assert_eq!(scan, id);
                    assert!(error.is_none());
                    break;
                }
            }
        }
        assert_eq!(found, vec!["B".to_string(), "C".to_string()]);
        assert!(registry.scan_finished(id));
        assert!(!registry.is_scanning());
    }

    #[tokio::test]
    async fn test_stop_scan_is_idempotent() {
        let radio = SimRadio::new();
        let adapter = radio.adapter(addr("00:00:00:00:00:01"), "local");
        adapter.set_scan_duration(Duration::from_secs(30));
        let mut registry = DeviceRegistry::new(adapter.clone(), Duration::from_secs(30));

        let (tx, _rx) = mpsc::unbounded_channel();
        registry.start_scan(tx).await.unwrap();
        assert!(adapter.is_discovering());

        assert!(registry.stop_scan().await);
        assert!(!registry.stop_scan().await);
        assert!(!adapter.is_discovering());
    }
}
