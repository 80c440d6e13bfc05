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

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ipnetwork::IpNetwork;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("run out of addresses in {cidr}")]
    RunOutOfAddresses { cidr: IpNetwork },

    #[error("ip {0} not found among reserved ips")]
    IpNotFound(IpAddr),

    #[error("ip {ip} is held by {holder}")]
    HeldByOther { ip: IpAddr, holder: Holder },
}

/// Who a reserved address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Holder {
    /// Network, broadcast and the device's own address.
    Device,
    /// Routed by the kernel to a peer with no stored record.
    Kernel,
    Peer(Uuid),
}

impl fmt::Display for Holder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device => f.write_str("the device"),
            Self::Kernel => f.write_str("an unrecorded kernel peer"),
            Self::Peer(id) => write!(f, "peer {id}"),
        }
    }
}

/// Reserved host addresses inside a CIDR block, each tagged with its
/// [`Holder`].
///
/// Reads (`contains`, `holder`) share the lock; every mutation takes it
/// exclusively, so a scan and the reservation of its result happen
/// atomically.
#[derive(Debug)]
pub struct AddressPool {
    cidr: IpNetwork,
    reserved: RwLock<BTreeMap<IpAddr, Holder>>,
}

impl AddressPool {
    /// Create a pool for `cidr` with its network and broadcast addresses
    /// already reserved.
    pub fn new(cidr: IpNetwork) -> Self {
        let mut reserved = BTreeMap::new();
        reserved.insert(cidr.network(), Holder::Device);
        reserved.insert(broadcast(cidr), Holder::Device);
        Self {
            cidr,
            reserved: RwLock::new(reserved),
        }
    }

    pub fn cidr(&self) -> IpNetwork {
        self.cidr
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<IpAddr, Holder>> {
        self.reserved.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<IpAddr, Holder>> {
        self.reserved.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark `ip` reserved for the device. Returns `false` if it already was;
    /// callers that must treat a duplicate as a conflict check
    /// [`contains`](Self::contains) first.
    pub fn reserve(&self, ip: IpAddr) -> bool {
        self.reserve_for(ip, Holder::Device)
    }

    /// Mark `ip` reserved for `holder`. An existing reservation is kept
    /// as is and `false` returned.
    pub fn reserve_for(&self, ip: IpAddr, holder: Holder) -> bool {
        let mut reserved = self.write();
        if let Some(current) = reserved.get(&ip) {
            debug!(%ip, %current, "address already reserved");
            return false;
        }
        reserved.insert(ip, holder);
        true
    }

    /// Reserve every address in `ips` for `peer`, or none of them if any is
    /// held by someone else. Addresses the peer already holds count as
    /// claimed. Returns the addresses that were newly reserved.
    pub fn claim(&self, ips: &[IpAddr], peer: Uuid) -> Result<Vec<IpAddr>, PoolError> {
        let mut reserved = self.write();
        for ip in ips {
            match reserved.get(ip) {
                Some(Holder::Peer(id)) if *id == peer => {}
                Some(holder) => {
                    return Err(PoolError::HeldByOther { ip: *ip, holder: *holder });
                }
                None => {}
            }
        }
        let mut newly = Vec::new();
        for ip in ips {
            if reserved.insert(*ip, Holder::Peer(peer)).is_none() {
                newly.push(*ip);
            }
        }
        Ok(newly)
    }

    /// Drop the reservation of `ip`, whoever holds it.
    pub fn release(&self, ip: IpAddr) -> Result<(), PoolError> {
        if self.write().remove(&ip).is_some() {
            debug!(%ip, "released address");
            Ok(())
        } else {
            Err(PoolError::IpNotFound(ip))
        }
    }

    /// Drop the reservation of `ip` only if `peer` holds it.
    pub fn release_for(&self, ip: IpAddr, peer: Uuid) -> Result<(), PoolError> {
        let mut reserved = self.write();
        match reserved.get(&ip) {
            None => Err(PoolError::IpNotFound(ip)),
            Some(Holder::Peer(id)) if *id == peer => {
                reserved.remove(&ip);
                debug!(%ip, %peer, "released address");
                Ok(())
            }
            Some(holder) => Err(PoolError::HeldByOther { ip, holder: *holder }),
        }
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        self.read().contains_key(&ip)
    }

    pub fn holder(&self, ip: IpAddr) -> Option<Holder> {
        self.read().get(&ip).copied()
    }

    pub fn reserved_count(&self) -> usize {
        self.read().len()
    }

    /// Find the lowest free host address of `cidr`, reserve it for the
    /// device, and return it as a single-host network (`/32` or `/128`).
    pub fn get_available(&self, cidr: IpNetwork) -> Result<IpNetwork, PoolError> {
        self.get_available_for(cidr, Holder::Device)
    }

    /// [`get_available`](Self::get_available), reserving for `holder`.
    ///
    /// The scan starts at the network address and walks upwards; network
    /// and broadcast addresses are skipped even if they were released.
    pub fn get_available_for(&self, cidr: IpNetwork, holder: Holder) -> Result<IpNetwork, PoolError> {
        let network = cidr.network();
        let broadcast = broadcast(cidr);

        let mut reserved = self.write();
        let mut candidate = Some(network);
        while let Some(ip) = candidate {
            if !cidr.contains(ip) {
                break;
            }
            if ip != network && ip != broadcast && !reserved.contains_key(&ip) {
                reserved.insert(ip, holder);
                debug!(%ip, %cidr, %holder, "allocated address");
                return Ok(host_network(ip));
            }
            candidate = next_addr(ip);
        }

        warn!(%cidr, "address pool exhausted");
        Err(PoolError::RunOutOfAddresses { cidr })
    }

    /// [`get_available`](Self::get_available) over the pool's own block.
    pub fn allocate(&self) -> Result<IpNetwork, PoolError> {
        self.get_available(self.cidr)
    }
}

/// The single-host network for `ip`.
pub fn host_network(ip: IpAddr) -> IpNetwork {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    // A /32 or /128 is always a valid prefix for its family.
    IpNetwork::new(ip, prefix).unwrap_or_else(|_| IpNetwork::from(ip))
}

/// Broadcast address of `cidr`: every host bit set, computed byte by byte
/// as `network[i] | !mask[i]`.
pub fn broadcast(cidr: IpNetwork) -> IpAddr {
    match (cidr.network(), cidr.mask()) {
        (IpAddr::V4(net), IpAddr::V4(mask)) => {
            let mut out = net.octets();
            for (b, m) in out.iter_mut().zip(mask.octets()) {
                *b |= !m;
            }
            IpAddr::V4(Ipv4Addr::from(out))
        }
        (IpAddr::V6(net), IpAddr::V6(mask)) => {
            let mut out = net.octets();
            for (b, m) in out.iter_mut().zip(mask.octets()) {
                *b |= !m;
            }
            IpAddr::V6(Ipv6Addr::from(out))
        }
        // ipnetwork always pairs an address with a mask of the same family.
        (net, _) => net,
    }
}

/// The address after `ip`, carrying from the least significant byte.
/// `None` once the address space wraps around.
pub fn next_addr(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => {
            let mut octets = v4.octets();
            increment(&mut octets).then(|| IpAddr::V4(Ipv4Addr::from(octets)))
        }
        IpAddr::V6(v6) => {
            let mut octets = v6.octets();
            increment(&mut octets).then(|| IpAddr::V6(Ipv6Addr::from(octets)))
        }
    }
}

fn increment(bytes: &mut [u8]) -> bool {
    for b in bytes.iter_mut().rev() {
        let (next, carry) = b.overflowing_add(1);
        *b = next;
        if !carry {
            return true;
        }
    }
    false
}
