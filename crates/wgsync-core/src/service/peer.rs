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

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;
use wgsync_types::{DeviceSnapshot, PeerConfig, WgKey};

use super::{Component, DownloadFile, ServiceError, ServiceErrorKind, page_limit};
use crate::device::DeviceRecord;
use crate::kernel::KernelGateway;
use crate::peer::PeerRecord;
use crate::pool::{AddressPool, Holder};
use crate::reconcile::Reconciler;
use crate::render::{self, ClientConfig};
use crate::store::{DeviceStore, Page, PeerQuery, PeerStore};

type Result<T> = std::result::Result<T, ServiceError>;

fn fail(kind: impl Into<ServiceErrorKind>) -> ServiceError {
    ServiceError {
        component: Component::PeerService,
        kind: kind.into(),
    }
}

/// Settings applied to peers that do not choose their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerDefaults {
    pub dns: String,
    pub mtu: u32,
    /// Routes written into client configs.
    pub client_allowed_ips: Vec<String>,
}

impl Default for PeerDefaults {
    fn default() -> Self {
        Self {
            dns: "9.9.9.9, 149.112.112.112".into(),
            mtu: 1384,
            client_allowed_ips: vec!["0.0.0.0/0".into()],
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AddPeer {
    pub device_id: Uuid,
    pub name: String,
    pub email: String,
    pub description: String,
    pub tags: Vec<String>,
    pub dns: String,
    pub mtu: u32,
    pub persistent_keepalive: Duration,
    pub add_preshared_key: bool,
}

/// A partial update. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct UpdatePeer {
    pub name: Option<String>,
    pub email: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub dns: Option<String>,
    pub mtu: Option<u32>,
    pub persistent_keepalive: Option<Duration>,
    pub add_preshared_key: bool,
    pub remove_preshared_key: bool,
}

pub struct PeerService<G, P, D> {
    reconciler: Arc<Reconciler<G, P, D>>,
    defaults: PeerDefaults,
}

impl<G, P, D> PeerService<G, P, D>
where
    G: KernelGateway,
    P: PeerStore,
    D: DeviceStore,
{
    pub fn new(reconciler: Arc<Reconciler<G, P, D>>, defaults: PeerDefaults) -> Self {
        Self { reconciler, defaults }
    }

    fn apply_defaults(&self, peer: &mut PeerRecord) {
        if peer.dns.trim().is_empty() {
            peer.dns = self.defaults.dns.clone();
        }
        if peer.mtu == 0 {
            peer.mtu = self.defaults.mtu;
        }
    }

    #[tracing::instrument(skip(self, req), fields(device = %req.device_id, name = %req.name))]
    pub async fn add(&self, req: AddPeer) -> Result<PeerRecord> {
        let device = self.reconciler.device(req.device_id).await.map_err(fail)?;

        let mut peer = PeerRecord::generate(device.id, req.name);
        peer.email = req.email;
        peer.description = req.description;
        peer.tags = req.tags;
        peer.dns = req.dns;
        peer.mtu = req.mtu;
        peer.persistent_keepalive = req.persistent_keepalive;
        if req.add_preshared_key {
            peer.preshared_key = Some(WgKey::generate());
        }
        self.apply_defaults(&mut peer);
        peer.is_valid().map_err(fail)?;

        let address = device.get_available_ip_for(peer.id).map_err(fail)?;
        let pool = device.pool().map_err(fail)?;
        peer.allowed_ips = vec![address.to_string()];

        let config = match peer.to_peer_config() {
            Ok(c) => c,
            Err(e) => {
                release_after_failure(pool, address.ip());
                return Err(fail(e));
            }
        };

        if let Err(e) = self.reconciler.peer_store().add(&peer).await {
            release_after_failure(pool, address.ip());
            return Err(fail(e));
        }

        self.reconciler
            .gateway()
            .configure_device(&device.name, vec![config])
            .await
            .map_err(|e| fail(ServiceErrorKind::KernelApplyFailed(e)))?;

        info!(peer = %peer.id, device = %device.name, %address, "peer added");
        Ok(self.overlay(&device, peer).await)
    }

    #[tracing::instrument(skip(self, req))]
    pub async fn update(&self, id: Uuid, req: UpdatePeer) -> Result<PeerRecord> {
        let store = self.reconciler.peer_store();
        let mut peer = store.get(id).await.map_err(fail)?;
        let device = self.reconciler.device(peer.device_id).await.map_err(fail)?;

        if let Some(name) = req.name {
            peer.name = name;
        }
        if let Some(email) = req.email {
            peer.email = email;
        }
        if let Some(description) = req.description {
            peer.description = description;
        }
        if let Some(tags) = req.tags {
            peer.tags = tags;
        }
        if let Some(dns) = req.dns {
            peer.dns = dns;
        }
        if let Some(mtu) = req.mtu {
            peer.mtu = mtu;
        }
        if let Some(keepalive) = req.persistent_keepalive {
            peer.persistent_keepalive = keepalive;
        }
        self.apply_defaults(&mut peer);

        let mut clear_preshared_key = false;
        if req.remove_preshared_key && peer.has_preshared_key() {
            peer.preshared_key = None;
            clear_preshared_key = true;
        }
        if req.add_preshared_key && !peer.has_preshared_key() {
            peer.preshared_key = Some(WgKey::generate());
            clear_preshared_key = false;
        }

        peer.is_valid().map_err(fail)?;
        let mut config = peer.to_peer_config().map_err(fail)?;
        config.update_only = true;
        if clear_preshared_key {
            // An all-zero key is how the kernel is told to drop it.
            config.preshared_key = Some(WgKey::zero());
        }

        store.update(&peer).await.map_err(fail)?;

        if peer.is_enabled {
            self.reconciler
                .gateway()
                .configure_device(&device.name, vec![config])
                .await
                .map_err(|e| fail(ServiceErrorKind::KernelApplyFailed(e)))?;
        }

        info!(peer = %peer.id, device = %device.name, "peer updated");
        Ok(self.overlay(&device, peer).await)
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let store = self.reconciler.peer_store();
        let peer = store.get(id).await.map_err(fail)?;
        let device = self.reconciler.device(peer.device_id).await.map_err(fail)?;
        let pool = device.pool().map_err(fail)?;

        // Addresses held by the device or another peer stay reserved.
        let mut released: Vec<IpAddr> = Vec::new();
        for ip in peer.reserved_ips().map_err(fail)? {
            match pool.release_for(ip, peer.id) {
                Ok(()) => released.push(ip),
                Err(e) => warn!(peer = %peer.id, error = %e, "address left reserved"),
            }
        }

        if let Err(e) = store.remove(id).await {
            for ip in released {
                pool.reserve_for(ip, Holder::Peer(peer.id));
            }
            return Err(fail(e));
        }

        if peer.is_enabled {
            self.reconciler
                .gateway()
                .configure_device(&device.name, vec![PeerConfig::removal(peer.public_key)])
                .await
                .map_err(|e| fail(ServiceErrorKind::KernelApplyFailed(e)))?;
        }

        info!(peer = %peer.id, device = %device.name, "peer removed");
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn enable(&self, id: Uuid) -> Result<()> {
        self.set_enabled(id, true).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn disable(&self, id: Uuid) -> Result<()> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: Uuid, enabled: bool) -> Result<()> {
        let store = self.reconciler.peer_store();
        let mut peer = store.get(id).await.map_err(fail)?;
        if peer.is_enabled == enabled {
            debug!(peer = %peer.id, enabled, "already in requested state");
            return Ok(());
        }
        let device = self.reconciler.device(peer.device_id).await.map_err(fail)?;
        let pool = device.pool().map_err(fail)?;

        let mut claimed: Vec<IpAddr> = Vec::new();
        let change = if enabled {
            let config = peer.to_peer_config().map_err(fail)?;
            let ips = peer.reserved_ips().map_err(fail)?;
            claimed = pool.claim(&ips, peer.id).map_err(fail)?;
            config
        } else {
            PeerConfig::removal(peer.public_key)
        };

        peer.is_enabled = enabled;
        if let Err(e) = store.update(&peer).await {
            for ip in claimed {
                release_after_failure(pool, ip);
            }
            return Err(fail(e));
        }

        self.reconciler
            .gateway()
            .configure_device(&device.name, vec![change])
            .await
            .map_err(|e| fail(ServiceErrorKind::KernelApplyFailed(e)))?;

        info!(peer = %peer.id, device = %device.name, enabled, "peer state changed");
        Ok(())
    }

    /// The stored peer, overlaid with kernel state when it is enabled.
    pub async fn get(&self, id: Uuid) -> Result<PeerRecord> {
        let peer = self.reconciler.peer_store().get(id).await.map_err(fail)?;
        if !peer.is_enabled {
            return Ok(peer);
        }
        let device = self.reconciler.device(peer.device_id).await.map_err(fail)?;
        Ok(self.overlay(&device, peer).await)
    }

    /// One page of peers. The kernel is read once per device on the page.
    pub async fn get_all(&self, mut query: PeerQuery) -> Result<Page<PeerRecord>> {
        query.limit = page_limit(query.limit).map_err(fail)?;
        let page = self
            .reconciler
            .peer_store()
            .get_all(&query)
            .await
            .map_err(fail)?;

        let mut snapshots: HashMap<Uuid, Option<DeviceSnapshot>> = HashMap::new();
        for peer in page.items.iter().filter(|p| p.is_enabled) {
            if snapshots.contains_key(&peer.device_id) {
                continue;
            }
            let snapshot = match self.reconciler.device(peer.device_id).await {
                Ok(device) => self.snapshot(&device).await,
                Err(e) => {
                    warn!(device = %peer.device_id, error = %e, "device unavailable for listing");
                    None
                }
            };
            snapshots.insert(peer.device_id, snapshot);
        }

        Ok(page.map(|peer| {
            let kernel_peer = snapshots
                .get(&peer.device_id)
                .and_then(Option::as_ref)
                .filter(|_| peer.is_enabled)
                .and_then(|s| s.peer(&peer.public_key));
            match kernel_peer {
                Some(kp) => peer.populate_dynamic_fields(kp),
                None => peer,
            }
        }))
    }

    pub async fn download_config(&self, id: Uuid) -> Result<DownloadFile> {
        let document = self.client_document(id).await?;
        Ok(DownloadFile {
            name: format!("{id}.conf"),
            content: document.into_bytes(),
        })
    }

    pub async fn download_qr_code(&self, id: Uuid) -> Result<DownloadFile> {
        let document = self.client_document(id).await?;
        let svg = render::qr_svg(&document).map_err(fail)?;
        Ok(DownloadFile {
            name: format!("{id}.svg"),
            content: svg.into_bytes(),
        })
    }

    async fn client_document(&self, id: Uuid) -> Result<String> {
        let peer = self.reconciler.peer_store().get(id).await.map_err(fail)?;
        let device = self.reconciler.device(peer.device_id).await.map_err(fail)?;
        render::to_document(&ClientConfig {
            peer: &peer,
            device: &device,
            allowed_ips: &self.defaults.client_allowed_ips,
        })
        .map_err(fail)
    }

    async fn snapshot(&self, device: &DeviceRecord) -> Option<DeviceSnapshot> {
        match self.reconciler.gateway().get_device(&device.name).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(device = %device.name, error = %e, "reading kernel state failed");
                None
            }
        }
    }

    /// Overlay kernel state. The mutation has already happened by the time
    /// this runs, so a failed read leaves the record as stored.
    async fn overlay(&self, device: &DeviceRecord, peer: PeerRecord) -> PeerRecord {
        let Some(snapshot) = self.snapshot(device).await else {
            return peer;
        };
        match snapshot.peer(&peer.public_key) {
            Some(kp) => peer.populate_dynamic_fields(kp),
            None => {
                debug!(peer = %peer.id, "peer not present in kernel");
                peer
            }
        }
    }
}

fn release_after_failure(pool: &AddressPool, ip: IpAddr) {
    if let Err(e) = pool.release(ip) {
        warn!(%ip, error = %e, "releasing address after failed write");
    }
}
