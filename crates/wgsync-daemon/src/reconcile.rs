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

use tracing::{debug, error, info, warn};
use wgsync_core::{
    DeviceQuery, DeviceStore, KernelGateway, MemoryStore, Reconciler, StoreError, SyncReport,
};

use crate::config::DaemonToml;
use crate::store::JsonFileStore;

pub type DaemonReconciler<G> = Reconciler<G, JsonFileStore, MemoryStore>;

/// Wire the configured devices and the peer state file to `gateway`.
pub async fn build<G: KernelGateway>(
    config: &DaemonToml,
    gateway: G,
) -> Result<Arc<DaemonReconciler<G>>, StoreError> {
    let peers = JsonFileStore::open(&config.state_file).await?;
    let devices = MemoryStore::with_devices(config.device_records());
    Ok(Arc::new(Reconciler::new(
        Arc::new(gateway),
        Arc::new(peers),
        Arc::new(devices),
        config.policy(),
    )))
}

/// Create each configured interface if missing and apply its key, port,
/// mark and address. Returns how many devices were provisioned; failures
/// are logged and left for the sync to report.
pub async fn provision_all<G: KernelGateway>(reconciler: &DaemonReconciler<G>) -> usize {
    let devices = match reconciler.device_store().get_all(&DeviceQuery::default()).await {
        Ok(page) => page.items,
        Err(e) => {
            error!(error = %e, "listing configured devices failed");
            return 0;
        }
    };

    let mut provisioned = 0;
    for device in devices {
        let interface = match device.interface_config() {
            Ok(i) => i,
            Err(e) => {
                error!(device = %device.name, error = %e, "bad device config");
                continue;
            }
        };
        match reconciler.gateway().provision_device(&device.name, &interface).await {
            Ok(()) => provisioned += 1,
            Err(e) => error!(device = %device.name, error = %e, "failed to provision interface"),
        }
    }
    provisioned
}

/// Provision every configured device, then run one reconciliation cycle
/// over them and log the outcome. Returns `None` if the devices could not
/// be listed at all.
#[tracing::instrument(skip_all)]
pub async fn reconcile_all<G: KernelGateway>(reconciler: &DaemonReconciler<G>) -> Option<SyncReport> {
    let provisioned = provision_all(reconciler).await;
    debug!(provisioned, "interfaces provisioned");

    let report = match reconciler.sync_devices().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "reconciliation failed, will retry next cycle");
            return None;
        }
    };

    for (name, e) in &report.failed {
        error!(device = %name, error = %e, "device left unsynced");
    }
    for (peer, reason) in &report.invalid {
        warn!(%peer, %reason, "stored peer skipped");
    }
    for peer in &report.conflicting {
        warn!(%peer, "stored peer conflicts with a held address");
    }

    info!(
        synced = report.synced.len(),
        failed = report.failed.len(),
        pushed = report.pushed.len(),
        removed = report.removed.len(),
        "reconciliation cycle complete"
    );
    Some(report)
}
