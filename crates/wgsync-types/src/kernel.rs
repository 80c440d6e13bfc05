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

//! Snapshot and configuration types exchanged with the kernel WireGuard
//! device. They mirror what the generic netlink interface reports and
//! accepts, without tying callers to a particular control library.

use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::key::WgKey;

/// Implementation backing a WireGuard device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    /// Not yet observed on a live device.
    #[default]
    Unknown,
    /// The in-kernel Linux implementation.
    LinuxKernel,
    /// A userspace implementation (wireguard-go, boringtun, ...).
    Userspace,
}

/// Live state of one WireGuard interface as reported by the kernel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Interface name, e.g. `wg0`.
    pub name: String,
    /// Backing implementation.
    pub device_type: DeviceType,
    /// Interface private key, if one is set.
    pub private_key: Option<WgKey>,
    /// Interface public key, if a private key is set.
    pub public_key: Option<WgKey>,
    /// UDP listen port.
    pub listen_port: u16,
    /// Firewall mark applied to outgoing packets, zero when unset.
    pub firewall_mark: u32,
    /// Peers currently configured on the interface.
    pub peers: Vec<KernelPeer>,
}

impl DeviceSnapshot {
    /// Find a configured peer by public key.
    pub fn peer(&self, public_key: &WgKey) -> Option<&KernelPeer> {
        self.peers.iter().find(|p| &p.public_key == public_key)
    }
}

/// Live state of one peer on a kernel device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelPeer {
    /// Peer public key; the identity the kernel keys peers by.
    pub public_key: WgKey,
    /// Preshared key, `None` when unset (all zero on the wire).
    pub preshared_key: Option<WgKey>,
    /// Last observed endpoint of the peer.
    pub endpoint: Option<SocketAddr>,
    /// Persistent keepalive interval, zero when disabled.
    pub persistent_keepalive: Duration,
    /// Time of the most recent handshake, `None` if there never was one.
    pub last_handshake: Option<DateTime<Utc>>,
    /// Bytes received from the peer.
    pub rx_bytes: u64,
    /// Bytes sent to the peer.
    pub tx_bytes: u64,
    /// Networks routed to the peer.
    pub allowed_ips: Vec<IpNetwork>,
    /// WireGuard protocol version negotiated with the peer.
    pub protocol_version: u32,
}

impl KernelPeer {
    /// A peer with no traffic and no handshake yet.
    pub fn new(public_key: WgKey, allowed_ips: Vec<IpNetwork>) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: Duration::ZERO,
            last_handshake: None,
            rx_bytes: 0,
            tx_bytes: 0,
            allowed_ips,
            protocol_version: 1,
        }
    }
}

/// A change to one peer, applied with a device configure call.
///
/// `update_only` and `remove` map onto the kernel's peer flags: an
/// update-only change is ignored for peers the device does not know, and a
/// removal ignores every field except the public key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer to add, change or remove.
    pub public_key: WgKey,
    /// Preshared key to set; `None` leaves the current one untouched and
    /// [`WgKey::zero`] clears it.
    pub preshared_key: Option<WgKey>,
    /// Endpoint to set, if any.
    pub endpoint: Option<SocketAddr>,
    /// Keepalive interval to set; `None` leaves the current one untouched.
    pub persistent_keepalive: Option<Duration>,
    /// Replace the peer's allowed IPs instead of appending to them.
    pub replace_allowed_ips: bool,
    /// Allowed IPs to install.
    pub allowed_ips: Vec<IpNetwork>,
    /// Only modify a peer that already exists.
    pub update_only: bool,
    /// Remove the peer.
    pub remove: bool,
}

impl PeerConfig {
    /// A configure entry that removes the peer with `public_key`.
    pub fn removal(public_key: WgKey) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint: None,
            persistent_keepalive: None,
            replace_allowed_ips: false,
            allowed_ips: Vec::new(),
            update_only: false,
            remove: true,
        }
    }
}

/// Static interface settings pushed when provisioning a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Interface private key.
    pub private_key: WgKey,
    /// UDP listen port.
    pub listen_port: u16,
    /// Firewall mark, zero to leave unset.
    pub firewall_mark: u32,
    /// Address assigned to the interface, in CIDR form.
    pub address: IpNetwork,
}
