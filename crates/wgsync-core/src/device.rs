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
use std::sync::Arc;
use std::time::Duration;

use ipnetwork::IpNetwork;
use tracing::debug;
use uuid::Uuid;
use wgsync_types::{DeviceSnapshot, DeviceType, InterfaceConfig, WgKey};

use crate::pool::{AddressPool, Holder, PoolError, broadcast};
use crate::validate::{self, ValidationError, Violations};

/// Addresses subtracted from a block's size when computing capacity:
/// network, broadcast and the device's own address.
pub const DEFAULT_RESERVED_ADDRESSES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("address {0:?} is not a valid CIDR")]
    InvalidAddress(String),

    #[error("address pool of device {0} is not initialised")]
    PoolNotInitialised(String),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// One WireGuard interface.
///
/// Static fields come from the device store and are the source of truth for
/// configuration. `device_type`, `kernel_firewall_mark` and
/// `current_peers_count` are overlaid from a live snapshot by
/// [`populate_dynamic_fields`](Self::populate_dynamic_fields);
/// `max_peers_count` is derived from `address`.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub private_key: WgKey,
    pub public_key: WgKey,
    pub listen_port: u16,
    pub firewall_mark: u32,
    pub endpoint: String,
    pub address: String,
    pub mtu: u32,
    pub dns: String,
    pub table: String,
    pub persistent_keepalive: Duration,
    pub pre_up: String,
    pub post_up: String,
    pub pre_down: String,
    pub post_down: String,

    pub device_type: DeviceType,
    /// The mark the kernel reports, which lags `firewall_mark` until the
    /// interface is provisioned.
    pub kernel_firewall_mark: u32,
    pub max_peers_count: u64,
    pub current_peers_count: usize,

    pool: Option<Arc<AddressPool>>,
}

impl DeviceRecord {
    pub fn new(
        name: impl Into<String>,
        private_key: WgKey,
        listen_port: u16,
        endpoint: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: String::new(),
            private_key,
            public_key: private_key.public_key(),
            listen_port,
            firewall_mark: 0,
            endpoint: endpoint.into(),
            address: address.into(),
            mtu: 0,
            dns: String::new(),
            table: String::new(),
            persistent_keepalive: Duration::ZERO,
            pre_up: String::new(),
            post_up: String::new(),
            pre_down: String::new(),
            post_down: String::new(),
            device_type: DeviceType::Unknown,
            kernel_firewall_mark: 0,
            max_peers_count: 0,
            current_peers_count: 0,
            pool: None,
        }
    }

    /// Parse `address`. A bare address without a prefix length is rejected
    /// rather than read as a single-host network.
    pub fn network(&self) -> Result<IpNetwork, DeviceError> {
        parse_cidr(&self.address)
    }

    /// The device's own address inside its block.
    pub fn own_ip(&self) -> Result<IpAddr, DeviceError> {
        Ok(self.network()?.ip())
    }

    /// Check every static field, reporting all problems at once.
    pub fn is_valid(&self) -> Result<(), ValidationError> {
        let mut v = Violations::new();

        if self.endpoint.is_empty() {
            v.push("endpoint", "endpoint should not be empty");
        } else if !is_valid_endpoint(&self.endpoint) {
            v.push("endpoint", "endpoint is not a valid host or IP address with port");
        }

        if self.address.is_empty() {
            v.push("address", "address should not be empty");
        } else if parse_cidr(&self.address).is_err() {
            v.push("address", "address is not a valid CIDR IP address");
        }

        validate::check_dns(&mut v, &self.dns);
        validate::check_max_len(&mut v, "description", &self.description, 40);

        v.into_result(format!("device {}", self.name))
    }

    /// Derive capacity from the block size, less `reserved` addresses.
    pub fn compute_max_peers_count(&mut self, reserved: u32) -> Result<u64, DeviceError> {
        self.max_peers_count = max_peers(self.network()?, reserved);
        Ok(self.max_peers_count)
    }

    /// Start a fresh pool for the device's block and reserve the device's
    /// own address and the broadcast address in it.
    pub fn compute_initial_reserved_ips(&mut self) -> Result<Arc<AddressPool>, DeviceError> {
        let network = self.network()?;
        let pool = Arc::new(AddressPool::new(network));
        pool.reserve(network.ip());
        pool.reserve(broadcast(network));
        debug!(
            device = %self.name,
            address = %network,
            "initialised address pool"
        );
        self.pool = Some(Arc::clone(&pool));
        Ok(pool)
    }

    pub fn pool(&self) -> Result<&Arc<AddressPool>, DeviceError> {
        self.pool
            .as_ref()
            .ok_or_else(|| DeviceError::PoolNotInitialised(self.name.clone()))
    }

    /// Allocate the next free host address from the device's block.
    pub fn get_available_ip(&self) -> Result<IpNetwork, DeviceError> {
        let network = self.network()?;
        Ok(self.pool()?.get_available(network)?)
    }

    /// Allocate the next free host address and record `peer` as its holder.
    pub fn get_available_ip_for(&self, peer: Uuid) -> Result<IpNetwork, DeviceError> {
        let network = self.network()?;
        Ok(self.pool()?.get_available_for(network, Holder::Peer(peer))?)
    }

    /// Overlay kernel-reported state onto the static record. The configured
    /// `firewall_mark` is left alone.
    pub fn populate_dynamic_fields(mut self, snapshot: &DeviceSnapshot) -> Self {
        self.device_type = snapshot.device_type;
        self.kernel_firewall_mark = snapshot.firewall_mark;
        self.current_peers_count = snapshot.peers.len();
        self
    }

    pub fn interface_config(&self) -> Result<InterfaceConfig, DeviceError> {
        Ok(InterfaceConfig {
            private_key: self.private_key,
            listen_port: self.listen_port,
            firewall_mark: self.firewall_mark,
            address: self.network()?,
        })
    }
}

pub fn parse_cidr(s: &str) -> Result<IpNetwork, DeviceError> {
    if !s.contains('/') {
        return Err(DeviceError::InvalidAddress(s.to_string()));
    }
    s.trim()
        .parse()
        .map_err(|_| DeviceError::InvalidAddress(s.to_string()))
}

/// `2^(bits - prefix) - reserved`, saturating at zero.
pub fn max_peers(network: IpNetwork, reserved: u32) -> u64 {
    let bits: u32 = if network.is_ipv4() { 32 } else { 128 };
    let host_bits = bits - u32::from(network.prefix());
    let size = if host_bits >= 128 {
        u128::MAX
    } else {
        1u128 << host_bits
    };
    u64::try_from(size.saturating_sub(u128::from(reserved))).unwrap_or(u64::MAX)
}

/// `ip:port`, `[v6]:port` or `hostname:port`.
fn is_valid_endpoint(s: &str) -> bool {
    if s.parse::<SocketAddr>().is_ok() {
        return true;
    }
    let Some((host, port)) = s.rsplit_once(':') else {
        return false;
    };
    if port.parse::<u16>().is_err() || host.is_empty() || host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
