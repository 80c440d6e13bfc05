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

//! Kernel gateway backed by generic netlink (WireGuard) and rtnetlink
//! (links and addresses).

use wgsync_core::{KernelError, KernelGateway};
use wgsync_types::{DeviceSnapshot, InterfaceConfig, PeerConfig};

#[cfg(target_os = "linux")]
pub type CurrentGateway = linux::LinuxGateway;

#[cfg(not(target_os = "linux"))]
pub type CurrentGateway = StubGateway;

/// Seconds for the kernel's 16-bit keepalive field.
pub fn keepalive_secs(interval: std::time::Duration) -> u16 {
    u16::try_from(interval.as_secs()).unwrap_or(u16::MAX)
}

// -- Stub gateway for non-Linux --

#[derive(Debug, Default)]
pub struct StubGateway;

impl KernelGateway for StubGateway {
    async fn get_device(&self, _name: &str) -> Result<DeviceSnapshot, KernelError> {
        Err(KernelError::Unsupported)
    }

    async fn configure_device(&self, _name: &str, _peers: Vec<PeerConfig>) -> Result<(), KernelError> {
        Err(KernelError::Unsupported)
    }

    async fn provision_device(&self, _name: &str, _config: &InterfaceConfig) -> Result<(), KernelError> {
        Err(KernelError::Unsupported)
    }

    async fn remove_device(&self, _name: &str) -> Result<(), KernelError> {
        Err(KernelError::Unsupported)
    }
}

// -- Linux implementation --

#[cfg(target_os = "linux")]
pub mod linux {
    use std::net::IpAddr;
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use futures::TryStreamExt;
    use ipnetwork::IpNetwork;
    use tracing::{debug, info};
    use wireguard_uapi::{DeviceInterface, RouteSocket, WgSocket, get, set};

    use wgsync_core::{KernelError, KernelGateway};
    use wgsync_types::{DeviceSnapshot, DeviceType, InterfaceConfig, KernelPeer, PeerConfig, WgKey};

    use super::keepalive_secs;

    fn interface_err(e: impl std::fmt::Display) -> KernelError {
        KernelError::Interface(e.to_string())
    }

    #[derive(Debug, Default)]
    pub struct LinuxGateway;

    impl LinuxGateway {
        fn interface_exists(name: &str) -> Result<bool, KernelError> {
            let mut route = RouteSocket::connect().map_err(interface_err)?;
            let existing = route.list_device_names().map_err(interface_err)?;
            Ok(existing.iter().any(|n| n == name))
        }

        fn ensure_interface(name: &str) -> Result<(), KernelError> {
            if Self::interface_exists(name)? {
                debug!(interface = name, "interface already exists");
                return Ok(());
            }
            info!(interface = name, "creating wireguard interface");
            let mut route = RouteSocket::connect().map_err(interface_err)?;
            route.add_device(name).map_err(interface_err)?;
            Ok(())
        }
    }

    impl KernelGateway for LinuxGateway {
        async fn get_device(&self, name: &str) -> Result<DeviceSnapshot, KernelError> {
            if !Self::interface_exists(name)? {
                return Err(KernelError::DeviceNotFound(name.to_string()));
            }
            let mut wg = WgSocket::connect().map_err(interface_err)?;
            let device = wg
                .get_device(DeviceInterface::from_name(name))
                .map_err(interface_err)?;
            debug!(interface = name, peer_count = device.peers.len(), "read device");
            Ok(snapshot(device))
        }

        async fn configure_device(&self, name: &str, peers: Vec<PeerConfig>) -> Result<(), KernelError> {
            if !Self::interface_exists(name)? {
                return Err(KernelError::DeviceNotFound(name.to_string()));
            }

            let owned: Vec<PeerOwned> = peers.iter().map(PeerOwned::from).collect();
            let set_peers: Vec<set::Peer<'_>> = owned.iter().map(PeerOwned::as_set_peer).collect();

            let dev = set::Device::from_ifname(name).peers(set_peers);
            let mut wg = WgSocket::connect().map_err(interface_err)?;
            wg.set_device(dev).map_err(interface_err)?;

            debug!(interface = name, changes = peers.len(), "applied peer changes");
            Ok(())
        }

        async fn provision_device(&self, name: &str, config: &InterfaceConfig) -> Result<(), KernelError> {
            Self::ensure_interface(name)?;

            {
                let mut dev = set::Device::from_ifname(name)
                    .private_key(config.private_key.as_bytes())
                    .listen_port(config.listen_port);
                if config.firewall_mark != 0 {
                    dev = dev.fwmark(config.firewall_mark);
                }
                let mut wg = WgSocket::connect().map_err(interface_err)?;
                wg.set_device(dev).map_err(interface_err)?;
            }

            assign_address(name, config.address).await?;
            set_link_up(name).await?;
            info!(interface = name, listen_port = config.listen_port, "provisioned device");
            Ok(())
        }

        async fn remove_device(&self, name: &str) -> Result<(), KernelError> {
            if Self::interface_exists(name)? {
                info!(interface = name, "removing interface");
                let mut route = RouteSocket::connect().map_err(interface_err)?;
                route.del_device(name).map_err(interface_err)?;
            }
            Ok(())
        }
    }

    fn key(bytes: [u8; 32]) -> Option<WgKey> {
        let key = WgKey::from_bytes(bytes);
        (!key.is_zero()).then_some(key)
    }

    fn handshake_time(since_epoch: Duration) -> Option<DateTime<Utc>> {
        if since_epoch.is_zero() {
            return None;
        }
        let secs = i64::try_from(since_epoch.as_secs()).ok()?;
        DateTime::from_timestamp(secs, since_epoch.subsec_nanos())
    }

    fn snapshot(device: get::Device) -> DeviceSnapshot {
        let peers = device
            .peers
            .into_iter()
            .map(|p| KernelPeer {
                public_key: WgKey::from_bytes(p.public_key),
                preshared_key: key(p.preshared_key),
                endpoint: p.endpoint,
                persistent_keepalive: Duration::from_secs(p.persistent_keepalive_interval.into()),
                last_handshake: handshake_time(p.last_handshake_time),
                rx_bytes: p.rx_bytes,
                tx_bytes: p.tx_bytes,
                allowed_ips: p
                    .allowed_ips
                    .into_iter()
                    .filter_map(|a| IpNetwork::new(a.ipaddr, a.cidr_mask).ok())
                    .collect(),
                protocol_version: p.protocol_version,
            })
            .collect();

        DeviceSnapshot {
            name: device.ifname,
            device_type: DeviceType::LinuxKernel,
            private_key: device.private_key.and_then(key),
            public_key: device.public_key.and_then(key),
            listen_port: device.listen_port,
            firewall_mark: device.fwmark,
            peers,
        }
    }

    /// Owned copy of a change so the borrowed netlink builders can point
    /// into it.
    struct PeerOwned {
        public_key: [u8; 32],
        preshared_key: Option<[u8; 32]>,
        endpoint: Option<std::net::SocketAddr>,
        persistent_keepalive: Option<u16>,
        allowed_ips: Vec<(IpAddr, u8)>,
        remove: bool,
        update_only: bool,
        replace_allowed_ips: bool,
    }

    impl From<&PeerConfig> for PeerOwned {
        fn from(c: &PeerConfig) -> Self {
            Self {
                public_key: *c.public_key.as_bytes(),
                preshared_key: c.preshared_key.map(|k| *k.as_bytes()),
                endpoint: c.endpoint,
                persistent_keepalive: c.persistent_keepalive.map(keepalive_secs),
                allowed_ips: c.allowed_ips.iter().map(|n| (n.ip(), n.prefix())).collect(),
                remove: c.remove,
                update_only: c.update_only,
                replace_allowed_ips: c.replace_allowed_ips,
            }
        }
    }

    impl PeerOwned {
        fn as_set_peer(&self) -> set::Peer<'_> {
            let mut flags = Vec::new();
            if self.remove {
                flags.push(set::WgPeerF::RemoveMe);
            }
            if self.update_only {
                flags.push(set::WgPeerF::UpdateOnly);
            }
            if self.replace_allowed_ips {
                flags.push(set::WgPeerF::ReplaceAllowedIps);
            }

            let mut peer = set::Peer::from_public_key(&self.public_key).flags(flags);
            if let Some(ref psk) = self.preshared_key {
                peer = peer.preshared_key(psk);
            }
            if let Some(ref ep) = self.endpoint {
                peer = peer.endpoint(ep);
            }
            if let Some(keepalive) = self.persistent_keepalive {
                peer = peer.persistent_keepalive_interval(keepalive);
            }
            let allowed: Vec<set::AllowedIp<'_>> = self
                .allowed_ips
                .iter()
                .map(|(addr, cidr)| {
                    let mut aip = set::AllowedIp::from_ipaddr(addr);
                    aip.cidr_mask = Some(*cidr);
                    aip
                })
                .collect();
            peer.allowed_ips(allowed)
        }
    }

    /// Resolve interface name to its index via rtnetlink.
    async fn get_link_index(handle: &rtnetlink::Handle, name: &str) -> Result<u32, KernelError> {
        let mut links = handle.link().get().match_name(name.to_string()).execute();
        let link = links
            .try_next()
            .await
            .map_err(interface_err)?
            .ok_or_else(|| KernelError::DeviceNotFound(name.to_string()))?;
        Ok(link.header.index)
    }

    async fn assign_address(name: &str, address: IpNetwork) -> Result<(), KernelError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let existing: Vec<_> = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(interface_err)?;

        for addr_msg in existing {
            handle
                .address()
                .del(addr_msg)
                .execute()
                .await
                .map_err(interface_err)?;
        }
        debug!(interface = name, "flushed existing addresses");

        handle
            .address()
            .add(index, address.ip(), address.prefix())
            .execute()
            .await
            .map_err(interface_err)?;

        info!(interface = name, %address, "assigned address via netlink");
        Ok(())
    }

    async fn set_link_up(name: &str) -> Result<(), KernelError> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(conn);

        let index = get_link_index(&handle, name).await?;

        let msg = rtnetlink::LinkUnspec::new_with_index(index).up().build();
        handle
            .link()
            .set(msg)
            .execute()
            .await
            .map_err(interface_err)?;

        info!(interface = name, "set link up via netlink");
        Ok(())
    }

}
