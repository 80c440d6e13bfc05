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

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use wgsync_types::{KernelPeer, KeyError, PeerConfig, WgKey};

use crate::validate::{self, ValidationError, Violations};

/// A peer counts as active while its last handshake is younger than this.
pub const ACTIVE_HANDSHAKE_WINDOW: TimeDelta = TimeDelta::minutes(2);

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("allowed ip {0:?} is not a valid CIDR")]
    InvalidAllowedIp(String),

    #[error("invalid peer id {0:?}")]
    InvalidId(String),

    #[error("invalid {field}: {source}")]
    InvalidKey {
        field: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("peer {0} is flagged with a preshared key but none is stored")]
    MissingPresharedKey(Uuid),
}

/// One WireGuard peer.
///
/// Identity and config fields are persisted and authoritative from the
/// store. `endpoint`, `last_handshake`, the byte counters,
/// `protocol_version` and `is_active` are kernel-derived and only valid
/// after [`populate_dynamic_fields`](Self::populate_dynamic_fields).
#[derive(Debug, Clone, PartialEq)]
pub struct PeerRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub private_key: WgKey,
    pub public_key: WgKey,
    pub preshared_key: Option<WgKey>,
    pub allowed_ips: Vec<String>,
    pub dns: String,
    pub mtu: u32,
    pub persistent_keepalive: Duration,
    pub name: String,
    pub email: String,
    pub description: String,
    pub tags: Vec<String>,
    pub is_enabled: bool,

    pub endpoint: Option<SocketAddr>,
    pub last_handshake: Option<DateTime<Utc>>,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub protocol_version: u32,
    pub is_active: bool,
}

impl PeerRecord {
    /// A new enabled peer with a freshly generated keypair.
    pub fn generate(device_id: Uuid, name: impl Into<String>) -> Self {
        let private_key = WgKey::generate_private();
        Self {
            id: Uuid::new_v4(),
            device_id,
            private_key,
            public_key: private_key.public_key(),
            preshared_key: None,
            allowed_ips: Vec::new(),
            dns: String::new(),
            mtu: 0,
            persistent_keepalive: Duration::ZERO,
            name: name.into(),
            email: String::new(),
            description: String::new(),
            tags: Vec::new(),
            is_enabled: true,
            endpoint: None,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            protocol_version: 0,
            is_active: false,
        }
    }

    pub fn has_preshared_key(&self) -> bool {
        self.preshared_key.is_some()
    }

    pub fn is_valid(&self) -> Result<(), ValidationError> {
        let mut v = Violations::new();

        let name_len = self.name.chars().count();
        if !(1..=20).contains(&name_len) {
            v.push("name", "name should be between 1 and 20 characters");
        }

        if !self.email.is_empty() && !validate::is_valid_email(&self.email) {
            v.push("email", format!("email {} is invalid", self.email));
        }

        validate::check_dns(&mut v, &self.dns);
        validate::check_max_len(&mut v, "description", &self.description, 40);

        for tag in &self.tags {
            if tag.chars().count() > 20 {
                v.push("tags", format!("tag {tag:?} should be 20 characters max"));
            }
        }

        v.into_result(format!("peer {}", self.id))
    }

    /// Parsed allowed IPs; fails on the first entry that is not a CIDR.
    pub fn allowed_networks(&self) -> Result<Vec<IpNetwork>, PeerError> {
        self.allowed_ips
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpNetwork>()
                    .map_err(|_| PeerError::InvalidAllowedIp(s.clone()))
            })
            .collect()
    }

    /// Host addresses this peer holds in its device's pool.
    pub fn reserved_ips(&self) -> Result<Vec<IpAddr>, PeerError> {
        Ok(self.allowed_networks()?.into_iter().map(|n| n.ip()).collect())
    }

    pub fn populate_dynamic_fields(self, peer: &KernelPeer) -> Self {
        self.populate_dynamic_fields_at(peer, Utc::now())
    }

    /// Copy the kernel's view of this peer, judging activity against `now`.
    pub fn populate_dynamic_fields_at(mut self, peer: &KernelPeer, now: DateTime<Utc>) -> Self {
        self.endpoint = peer.endpoint;
        self.last_handshake = peer.last_handshake;
        self.rx_bytes = peer.rx_bytes;
        self.tx_bytes = peer.tx_bytes;
        self.protocol_version = peer.protocol_version;
        self.is_active = peer
            .last_handshake
            .is_some_and(|t| now.signed_duration_since(t) < ACTIVE_HANDSHAKE_WINDOW);
        self
    }

    /// The kernel change that installs this peer.
    pub fn to_peer_config(&self) -> Result<PeerConfig, PeerError> {
        Ok(PeerConfig {
            public_key: self.public_key,
            preshared_key: self.preshared_key,
            endpoint: None,
            persistent_keepalive: Some(self.persistent_keepalive),
            replace_allowed_ips: true,
            allowed_ips: self.allowed_networks()?,
            update_only: false,
            remove: false,
        })
    }

    pub fn to_persisted_peer(&self) -> PersistedPeer {
        PersistedPeer {
            id: self.id.to_string(),
            device_id: self.device_id.to_string(),
            private_key: self.private_key.to_string(),
            public_key: self.public_key.to_string(),
            has_preshared_key: self.has_preshared_key(),
            preshared_key: self.preshared_key.map(|k| k.to_string()),
            allowed_ips: self.allowed_ips.clone(),
            dns: self.dns.clone(),
            mtu: self.mtu,
            persistent_keepalive_secs: self.persistent_keepalive.as_secs(),
            name: self.name.clone(),
            email: self.email.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            is_enabled: self.is_enabled,
        }
    }
}

/// Storage projection of [`PeerRecord`] with keys and ids as strings and the
/// keepalive as whole seconds. Kernel-derived fields are not persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPeer {
    pub id: String,
    pub device_id: String,
    pub private_key: String,
    pub public_key: String,
    pub has_preshared_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<String>,
    pub allowed_ips: Vec<String>,
    #[serde(default)]
    pub dns: String,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub persistent_keepalive_secs: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub is_enabled: bool,
}

impl PersistedPeer {
    pub fn to_peer(&self) -> Result<PeerRecord, PeerError> {
        let id = parse_uuid(&self.id)?;
        let device_id = parse_uuid(&self.device_id)?;

        // The key is only read when flagged; a stray value without the flag
        // is ignored rather than mistaken for a real key.
        let preshared_key = if self.has_preshared_key {
            let raw = self
                .preshared_key
                .as_deref()
                .ok_or(PeerError::MissingPresharedKey(id))?;
            Some(parse_key("preshared_key", raw)?)
        } else {
            None
        };

        Ok(PeerRecord {
            id,
            device_id,
            private_key: parse_key("private_key", &self.private_key)?,
            public_key: parse_key("public_key", &self.public_key)?,
            preshared_key,
            allowed_ips: self.allowed_ips.clone(),
            dns: self.dns.clone(),
            mtu: self.mtu,
            persistent_keepalive: Duration::from_secs(self.persistent_keepalive_secs),
            name: self.name.clone(),
            email: self.email.clone(),
            description: self.description.clone(),
            tags: self.tags.clone(),
            is_enabled: self.is_enabled,
            endpoint: None,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            protocol_version: 0,
            is_active: false,
        })
    }
}

fn parse_uuid(s: &str) -> Result<Uuid, PeerError> {
    s.parse().map_err(|_| PeerError::InvalidId(s.to_string()))
}

fn parse_key(field: &'static str, s: &str) -> Result<WgKey, PeerError> {
    s.parse()
        .map_err(|source| PeerError::InvalidKey { field, source })
}
