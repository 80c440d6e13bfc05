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

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use uuid::Uuid;

use super::{Component, DownloadFile, ServiceError, ServiceErrorKind, page_limit};
use crate::device::DeviceRecord;
use crate::kernel::KernelGateway;
use crate::reconcile::Reconciler;
use crate::render::{self, ServerConfig};
use crate::store::{DeviceQuery, DeviceStore, Page, PeerQuery, PeerStore};

type Result<T> = std::result::Result<T, ServiceError>;

fn fail(kind: impl Into<ServiceErrorKind>) -> ServiceError {
    ServiceError {
        component: Component::DeviceService,
        kind: kind.into(),
    }
}

/// A partial device update. The interface name and keys are fixed.
#[derive(Debug, Clone, Default)]
pub struct UpdateDevice {
    pub description: Option<String>,
    pub endpoint: Option<String>,
    pub address: Option<String>,
    pub listen_port: Option<u16>,
    pub firewall_mark: Option<u32>,
    pub mtu: Option<u32>,
    pub dns: Option<String>,
    pub table: Option<String>,
    pub persistent_keepalive: Option<Duration>,
    pub pre_up: Option<String>,
    pub post_up: Option<String>,
    pub pre_down: Option<String>,
    pub post_down: Option<String>,
}

pub struct DeviceService<G, P, D> {
    reconciler: Arc<Reconciler<G, P, D>>,
}

impl<G, P, D> DeviceService<G, P, D>
where
    G: KernelGateway,
    P: PeerStore,
    D: DeviceStore,
{
    pub fn new(reconciler: Arc<Reconciler<G, P, D>>) -> Self {
        Self { reconciler }
    }

    /// Persist a new device, bring its interface up and sync it.
    #[tracing::instrument(skip(self, device), fields(device = %device.name))]
    pub async fn add(&self, device: DeviceRecord) -> Result<DeviceRecord> {
        device.is_valid().map_err(fail)?;
        self.reconciler
            .device_store()
            .add(&device)
            .await
            .map_err(fail)?;
        info!(id = %device.id, "device stored");
        self.provision_and_sync(&device).await
    }

    #[tracing::instrument(skip(self, req))]
    pub async fn update(&self, id: Uuid, req: UpdateDevice) -> Result<DeviceRecord> {
        let store = self.reconciler.device_store();
        let mut device = store.get(id).await.map_err(fail)?;

        if let Some(v) = req.description {
            device.description = v;
        }
        if let Some(v) = req.endpoint {
            device.endpoint = v;
        }
        if let Some(v) = req.address {
            device.address = v;
        }
        if let Some(v) = req.listen_port {
            device.listen_port = v;
        }
        if let Some(v) = req.firewall_mark {
            device.firewall_mark = v;
        }
        if let Some(v) = req.mtu {
            device.mtu = v;
        }
        if let Some(v) = req.dns {
            device.dns = v;
        }
        if let Some(v) = req.table {
            device.table = v;
        }
        if let Some(v) = req.persistent_keepalive {
            device.persistent_keepalive = v;
        }
        if let Some(v) = req.pre_up {
            device.pre_up = v;
        }
        if let Some(v) = req.post_up {
            device.post_up = v;
        }
        if let Some(v) = req.pre_down {
            device.pre_down = v;
        }
        if let Some(v) = req.post_down {
            device.post_down = v;
        }

        device.is_valid().map_err(fail)?;
        store.update(&device).await.map_err(fail)?;
        info!(device = %device.name, "device updated");
        self.provision_and_sync(&device).await
    }

    /// Delete the device row and tear down its interface. Peer rows are
    /// left to the store.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let store = self.reconciler.device_store();
        let device = store.get(id).await.map_err(fail)?;
        store.remove(id).await.map_err(fail)?;
        self.reconciler.registry().remove(id);

        self.reconciler
            .gateway()
            .remove_device(&device.name)
            .await
            .map_err(|e| fail(ServiceErrorKind::KernelApplyFailed(e)))?;

        info!(device = %device.name, "device removed");
        Ok(())
    }

    /// The synced device with fresh kernel-derived fields.
    pub async fn get(&self, id: Uuid) -> Result<DeviceRecord> {
        let device = self.reconciler.device(id).await.map_err(fail)?;
        let snapshot = self
            .reconciler
            .gateway()
            .get_device(&device.name)
            .await
            .map_err(fail)?;
        Ok(device.populate_dynamic_fields(&snapshot))
    }

    /// One page of stored devices; synced ones carry their computed capacity.
    pub async fn get_all(&self, mut query: DeviceQuery) -> Result<Page<DeviceRecord>> {
        query.limit = page_limit(query.limit).map_err(fail)?;
        let page = self
            .reconciler
            .device_store()
            .get_all(&query)
            .await
            .map_err(fail)?;
        let registry = self.reconciler.registry();
        Ok(page.map(|d| registry.get(d.id).unwrap_or(d)))
    }

    /// The device's own `wg-quick` file, `<name>.conf`, listing every
    /// enabled peer.
    pub async fn download_config(&self, id: Uuid) -> Result<DownloadFile> {
        let device = self.reconciler.device_store().get(id).await.map_err(fail)?;
        let peers = self
            .reconciler
            .peer_store()
            .get_all(&PeerQuery::device(id))
            .await
            .map_err(fail)?;
        let document = render::to_document(&ServerConfig {
            device: &device,
            peers: &peers.items,
        })
        .map_err(fail)?;
        Ok(DownloadFile {
            name: format!("{}.conf", device.name),
            content: document.into_bytes(),
        })
    }

    async fn provision_and_sync(&self, device: &DeviceRecord) -> Result<DeviceRecord> {
        let interface = device.interface_config().map_err(fail)?;
        self.reconciler
            .gateway()
            .provision_device(&device.name, &interface)
            .await
            .map_err(|e| fail(ServiceErrorKind::KernelApplyFailed(e)))?;

        let report = self
            .reconciler
            .sync_device(device.id)
            .await
            .map_err(fail)?;
        if !report.is_clean() {
            warn!(
                device = %device.name,
                invalid = report.invalid.len(),
                conflicting = report.conflicting.len(),
                "device synced with skipped peers"
            );
        }

        self.reconciler
            .registry()
            .get(device.id)
            .ok_or_else(|| fail(ServiceErrorKind::DeviceNotFound(device.id)))
    }
}
