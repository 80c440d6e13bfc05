// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;
use wgsync_core::DeviceRecord;
use wgsync_core::ReconcilePolicy;
use wgsync_core::device::DEFAULT_RESERVED_ADDRESSES;
use wgsync_types::WgKey;

pub const DEFAULT_STATE_FILE: &str = "/var/lib/wgsync/peers.json";

#[derive(Debug, Serialize, Deserialize)]
pub struct DaemonToml {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

fn default_state_file() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_FILE)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileSection {
    pub abort_on_invalid_peer: bool,
    /// Addresses subtracted from each block when computing capacity.
    pub reserved_addresses: u32,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            abort_on_invalid_peer: false,
            reserved_addresses: DEFAULT_RESERVED_ADDRESSES,
        }
    }
}

/// One WireGuard interface this daemon owns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub id: Uuid,
    pub name: String,
    pub private_key: WgKey,
    pub listen_port: u16,
    #[serde(default)]
    pub firewall_mark: u32,
    pub address: String,
    pub endpoint: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub table: String,
    /// Seconds.
    #[serde(default)]
    pub persistent_keepalive: u64,
    #[serde(default)]
    pub pre_up: String,
    #[serde(default)]
    pub post_up: String,
    #[serde(default)]
    pub pre_down: String,
    #[serde(default)]
    pub post_down: String,
}

impl DeviceEntry {
    pub fn to_record(&self) -> DeviceRecord {
        let mut device = DeviceRecord::new(
            self.name.clone(),
            self.private_key,
            self.listen_port,
            self.endpoint.clone(),
            self.address.clone(),
        );
        device.id = self.id;
        device.firewall_mark = self.firewall_mark;
        device.description = self.description.clone();
        device.dns = self.dns.clone();
        device.mtu = self.mtu;
        device.table = self.table.clone();
        device.persistent_keepalive = Duration::from_secs(self.persistent_keepalive);
        device.pre_up = self.pre_up.clone();
        device.post_up = self.post_up.clone();
        device.pre_down = self.pre_down.clone();
        device.post_down = self.post_down.clone();
        device
    }
}

impl DaemonToml {
    pub fn policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            abort_on_invalid_peer: self.reconcile.abort_on_invalid_peer,
            reserved_addresses: self.reconcile.reserved_addresses,
        }
    }

    pub fn device_records(&self) -> Vec<DeviceRecord> {
        self.devices.iter().map(DeviceEntry::to_record).collect()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("duplicate device name: {0}")]
    DuplicateName(String),

    #[error("duplicate device id: {0}")]
    DuplicateId(Uuid),
}

/// Read and validate the config. A missing file is an error: there is no
/// way to infer which devices to manage.
pub async fn load(path: &Path) -> Result<DaemonToml, ConfigError> {
    debug!(path = %path.display(), "loading config");

    let contents = tokio::fs::read_to_string(path).await?;
    let config: DaemonToml = toml::from_str(&contents)?;
    validate(&config)?;

    info!(
        path = %path.display(),
        device_count = config.devices.len(),
        state_file = %config.state_file.display(),
        "loaded config"
    );
    for entry in &config.devices {
        debug!(device = %entry.name, id = %entry.id, address = %entry.address, "registered device");
    }
    Ok(config)
}

pub fn validate(config: &DaemonToml) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    let mut ids = HashSet::new();
    for entry in &config.devices {
        if !names.insert(entry.name.as_str()) {
            warn!(device = %entry.name, "device name configured twice");
            return Err(ConfigError::DuplicateName(entry.name.clone()));
        }
        if !ids.insert(entry.id) {
            warn!(id = %entry.id, "device id configured twice");
            return Err(ConfigError::DuplicateId(entry.id));
        }
    }
    Ok(())
}
