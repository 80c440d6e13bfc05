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

//! Brings kernel devices in line with persisted peers.
//!
//! A pass over one device:
//! 1. read the live snapshot, validate the stored device and rebuild its
//!    address pool and capacity;
//! 2. reserve every allowed IP the kernel already routes, on behalf of the
//!    stored peer with that key when there is one;
//! 3. walk the stored peers, pushing enabled peers the kernel lacks and
//!    pulling disabled peers it still carries.
//!
//! Kernel-absent peers whose addresses are already held are conflicts and
//! are skipped. A pass against a device that already agrees with storage
//! makes no kernel calls.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wgsync_types::{DeviceSnapshot, PeerConfig, WgKey};

use crate::device::{DEFAULT_RESERVED_ADDRESSES, DeviceError, DeviceRecord};
use crate::kernel::{KernelError, KernelGateway};
use crate::pool::{AddressPool, Holder};
use crate::store::{DeviceQuery, DeviceStore, PeerQuery, PeerStore, StoreError};
use crate::validate::ValidationError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("reconcile: {0}")]
    Store(#[from] StoreError),

    #[error("reconcile: {0}")]
    Kernel(#[from] KernelError),

    #[error("reconcile: {0}")]
    InvalidDevice(#[from] ValidationError),

    #[error("reconcile: {0}")]
    Device(#[from] DeviceError),

    #[error("reconcile: invalid peer {peer}: {reason}")]
    InvalidPeer { peer: Uuid, reason: String },
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilePolicy {
    /// Fail a device's pass on the first invalid stored peer instead of
    /// reporting it and carrying on.
    pub abort_on_invalid_peer: bool,
    /// Addresses subtracted from a block when computing capacity.
    pub reserved_addresses: u32,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self {
            abort_on_invalid_peer: false,
            reserved_addresses: DEFAULT_RESERVED_ADDRESSES,
        }
    }
}

/// Devices that completed a pass, keyed by id. Each record carries the
/// address pool that requests against the device allocate from.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: DashMap<Uuid, DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: Uuid) -> Option<DeviceRecord> {
        self.devices.get(&id).map(|d| d.value().clone())
    }

    pub fn insert(&self, device: DeviceRecord) {
        self.devices.insert(device.id, device);
    }

    pub fn remove(&self, id: Uuid) -> Option<DeviceRecord> {
        self.devices.remove(&id).map(|(_, d)| d)
    }

    pub fn state(&self, id: Uuid) -> SyncState {
        if self.devices.contains_key(&id) {
            SyncState::Synced
        } else {
            SyncState::Unsynced
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// What one or more passes did.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced: Vec<String>,
    pub failed: Vec<(String, ReconcileError)>,
    /// Peers pushed to the kernel.
    pub pushed: Vec<Uuid>,
    /// Disabled peers pulled out of the kernel.
    pub removed: Vec<Uuid>,
    /// Stored peers that failed validation, with the reason.
    pub invalid: Vec<(Uuid, String)>,
    /// Peers skipped because an address they declare is already held.
    pub conflicting: Vec<Uuid>,
}

impl SyncReport {
    fn merge(&mut self, other: SyncReport) {
        self.synced.extend(other.synced);
        self.failed.extend(other.failed);
        self.pushed.extend(other.pushed);
        self.removed.extend(other.removed);
        self.invalid.extend(other.invalid);
        self.conflicting.extend(other.conflicting);
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.invalid.is_empty() && self.conflicting.is_empty()
    }
}

pub struct Reconciler<G, P, D> {
    gateway: Arc<G>,
    peers: Arc<P>,
    devices: Arc<D>,
    registry: DeviceRegistry,
    policy: ReconcilePolicy,
    // Held for a whole pass so two passes never build competing pools.
    sync_lock: Mutex<()>,
}

impl<G, P, D> Reconciler<G, P, D>
where
    G: KernelGateway,
    P: PeerStore,
    D: DeviceStore,
{
    pub fn new(gateway: Arc<G>, peers: Arc<P>, devices: Arc<D>, policy: ReconcilePolicy) -> Self {
        Self {
            gateway,
            peers,
            devices,
            registry: DeviceRegistry::new(),
            policy,
            sync_lock: Mutex::new(()),
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn peer_store(&self) -> &P {
        &self.peers
    }

    pub fn device_store(&self) -> &D {
        &self.devices
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// The synced record for `id`, running a pass first if the device has
    /// not been synced yet.
    pub async fn device(&self, id: Uuid) -> Result<DeviceRecord, ReconcileError> {
        if let Some(device) = self.registry.get(id) {
            return Ok(device);
        }
        let _guard = self.sync_lock.lock().await;
        if let Some(device) = self.registry.get(id) {
            return Ok(device);
        }
        self.sync_locked(id).await?;
        self.registry
            .get(id)
            .ok_or(ReconcileError::Store(StoreError::DeviceNotFound(id)))
    }

    /// Run a pass over every stored device. Device failures are collected
    /// in the report; only failing to list devices is an error.
    #[tracing::instrument(skip_all)]
    pub async fn sync_devices(&self) -> Result<SyncReport, ReconcileError> {
        let devices = self.devices.get_all(&DeviceQuery::default()).await?;
        info!(device_count = devices.total, "starting reconciliation");

        let mut report = SyncReport::default();
        for device in devices.items {
            match self.sync_device(device.id).await {
                Ok(one) => report.merge(one),
                Err(e) => {
                    error!(device = %device.name, error = %e, "device sync failed, left unsynced");
                    report.failed.push((device.name, e));
                }
            }
        }

        info!(
            synced = report.synced.len(),
            failed = report.failed.len(),
            pushed = report.pushed.len(),
            "reconciliation complete"
        );
        Ok(report)
    }

    /// One pass over one device. On error the device is dropped from the
    /// registry.
    #[tracing::instrument(skip(self))]
    pub async fn sync_device(&self, device_id: Uuid) -> Result<SyncReport, ReconcileError> {
        let _guard = self.sync_lock.lock().await;
        self.sync_locked(device_id).await
    }

    async fn sync_locked(&self, device_id: Uuid) -> Result<SyncReport, ReconcileError> {
        let result = self.try_sync_device(device_id).await;
        if result.is_err() {
            self.registry.remove(device_id);
        }
        result
    }

    async fn try_sync_device(&self, device_id: Uuid) -> Result<SyncReport, ReconcileError> {
        let device = self.devices.get(device_id).await?;
        let snapshot = self.gateway.get_device(&device.name).await?;
        device.is_valid()?;

        let mut device = device.populate_dynamic_fields(&snapshot);
        device.compute_max_peers_count(self.policy.reserved_addresses)?;
        let pool = device.compute_initial_reserved_ips()?;

        let stored = self.peers.get_all(&PeerQuery::device(device_id)).await?;
        let owners: HashMap<WgKey, Uuid> =
            stored.items.iter().map(|p| (p.public_key, p.id)).collect();

        let held = reserve_kernel_peers(&pool, &snapshot, &owners);
        debug!(
            device = %device.name,
            kernel_peers = snapshot.peers.len(),
            reserved = held,
            "reserved addresses routed by the kernel"
        );

        let mut report = SyncReport::default();
        let mut changes: Vec<PeerConfig> = Vec::new();

        for peer in stored.items {
            let checked = peer
                .is_valid()
                .map_err(|e| e.to_string())
                .and_then(|()| peer.reserved_ips().map_err(|e| e.to_string()));
            let ips = match checked {
                Ok(ips) => ips,
                Err(reason) => {
                    warn!(device = %device.name, peer = %peer.id, %reason, "invalid stored peer");
                    if self.policy.abort_on_invalid_peer {
                        return Err(ReconcileError::InvalidPeer { peer: peer.id, reason });
                    }
                    report.invalid.push((peer.id, reason));
                    continue;
                }
            };

            let in_kernel = snapshot.peer(&peer.public_key).is_some();

            if !peer.is_enabled {
                let newly = match pool.claim(&ips, peer.id) {
                    Ok(newly) => newly.len(),
                    Err(e) => {
                        debug!(
                            device = %device.name,
                            peer = %peer.id,
                            error = %e,
                            "disabled peer's address held elsewhere"
                        );
                        0
                    }
                };
                if in_kernel {
                    debug!(device = %device.name, peer = %peer.id, "pulling disabled peer");
                    changes.push(PeerConfig::removal(peer.public_key));
                    report.removed.push(peer.id);
                } else {
                    debug!(device = %device.name, peer = %peer.id, newly, "disabled peer, addresses held");
                }
                continue;
            }

            if in_kernel {
                debug!(device = %device.name, peer = %peer.id, "peer present");
                continue;
            }

            // Built before reserving so a bad record holds nothing.
            let config = match peer.to_peer_config() {
                Ok(c) => c,
                Err(e) => {
                    report.invalid.push((peer.id, e.to_string()));
                    continue;
                }
            };
            if let Err(e) = pool.claim(&ips, peer.id) {
                warn!(
                    device = %device.name,
                    peer = %peer.id,
                    error = %e,
                    "address already held, skipping conflicting peer"
                );
                report.conflicting.push(peer.id);
                continue;
            }
            debug!(device = %device.name, peer = %peer.id, "pushing missing peer");
            changes.push(config);
            report.pushed.push(peer.id);
        }

        if !changes.is_empty() {
            info!(device = %device.name, changes = changes.len(), "repairing drift");
            self.gateway.configure_device(&device.name, changes).await?;
        }

        info!(
            device = %device.name,
            max_peers = device.max_peers_count,
            current_peers = device.current_peers_count,
            "device synced"
        );
        report.synced.push(device.name.clone());
        self.registry.insert(device);
        Ok(report)
    }
}

/// Reserve each kernel peer's allowed IPs that are not yet held, for the
/// stored peer with the same key or else as [`Holder::Kernel`]. Returns how
/// many were newly reserved.
fn reserve_kernel_peers(
    pool: &AddressPool,
    snapshot: &DeviceSnapshot,
    owners: &HashMap<WgKey, Uuid>,
) -> usize {
    snapshot
        .peers
        .iter()
        .map(|p| {
            let holder = owners
                .get(&p.public_key)
                .map_or(Holder::Kernel, |id| Holder::Peer(*id));
            p.allowed_ips
                .iter()
                .filter(|n| pool.reserve_for(n.ip(), holder))
                .count()
        })
        .sum()
}
