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

//! Peer and device operations: allocation, persistence and kernel apply.
//!
//! Within one call the order is reserve, then persist, then apply. A kernel
//! failure is reported as [`ServiceErrorKind::KernelApplyFailed`] and does
//! not undo the persisted write; the next reconciliation pass repairs it.

use std::fmt;

use uuid::Uuid;

use crate::device::DeviceError;
use crate::kernel::KernelError;
use crate::peer::PeerError;
use crate::pool::PoolError;
use crate::reconcile::ReconcileError;
use crate::render::QrError;
use crate::store::StoreError;
use crate::validate::{ValidationError, Violations};

mod device;
mod peer;

pub use device::{DeviceService, UpdateDevice};
pub use peer::{AddPeer, PeerDefaults, PeerService, UpdatePeer};

/// Page size used when a listing asks for `limit == 0`.
pub const DEFAULT_LIMIT: usize = 20;
/// Largest page a listing may ask for.
pub const MAX_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    PeerService,
    DeviceService,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PeerService => "peer service",
            Self::DeviceService => "device service",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceErrorKind {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("peer {0} not found")]
    PeerNotFound(Uuid),

    #[error("device {0} not found")]
    DeviceNotFound(Uuid),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Device(DeviceError),

    #[error(transparent)]
    Peer(#[from] PeerError),

    #[error(transparent)]
    Store(StoreError),

    #[error(transparent)]
    Reconcile(ReconcileError),

    #[error("reading kernel state failed: {0}")]
    Kernel(#[from] KernelError),

    #[error("kernel apply failed: {0}")]
    KernelApplyFailed(KernelError),

    #[error(transparent)]
    Qr(#[from] QrError),

    #[error("rendering config failed")]
    Render(#[from] fmt::Error),
}

impl From<StoreError> for ServiceErrorKind {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::PeerNotFound(id) => Self::PeerNotFound(id),
            StoreError::DeviceNotFound(id) => Self::DeviceNotFound(id),
            e => Self::Store(e),
        }
    }
}

impl From<ReconcileError> for ServiceErrorKind {
    fn from(e: ReconcileError) -> Self {
        match e {
            ReconcileError::Store(e) => e.into(),
            e => Self::Reconcile(e),
        }
    }
}

impl From<DeviceError> for ServiceErrorKind {
    fn from(e: DeviceError) -> Self {
        match e {
            DeviceError::Pool(e) => Self::Pool(e),
            e => Self::Device(e),
        }
    }
}

/// A service failure, prefixed with the service it came from.
#[derive(Debug, thiserror::Error)]
#[error("{component}: {kind}")]
pub struct ServiceError {
    pub component: Component,
    pub kind: ServiceErrorKind,
}

impl ServiceError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ServiceErrorKind::PeerNotFound(_) | ServiceErrorKind::DeviceNotFound(_)
        )
    }

    /// Field violations, when the request was rejected as invalid.
    pub fn validation(&self) -> Option<&ValidationError> {
        match &self.kind {
            ServiceErrorKind::Validation(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_kernel_apply_failure(&self) -> bool {
        matches!(self.kind, ServiceErrorKind::KernelApplyFailed(_))
    }
}

/// A rendered file handed back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadFile {
    pub name: String,
    pub content: Vec<u8>,
}

/// Validate a requested page size and apply the default.
fn page_limit(limit: usize) -> Result<usize, ValidationError> {
    let mut v = Violations::new();
    if limit > MAX_LIMIT {
        v.push("limit", format!("limit should be {MAX_LIMIT} max"));
    }
    v.into_result("pagination")?;
    Ok(if limit == 0 { DEFAULT_LIMIT } else { limit })
}
