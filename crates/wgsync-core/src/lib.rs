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

//! wgsync-core: address allocation and device/peer reconciliation.
//!
//! [`AddressPool`] hands out host addresses from a device's block,
//! [`Reconciler`] keeps kernel devices in line with the [`PeerStore`], and
//! the services in [`service`] run peer and device mutations in
//! reserve, persist, apply order.

pub mod device;
pub mod kernel;
pub mod peer;
pub mod pool;
pub mod reconcile;
pub mod render;
pub mod service;
pub mod store;
pub mod validate;

pub use device::{DeviceError, DeviceRecord};
pub use kernel::{KernelError, KernelGateway};
pub use peer::{PeerError, PeerRecord, PersistedPeer};
pub use pool::{AddressPool, Holder, PoolError};
pub use reconcile::{
    DeviceRegistry, ReconcileError, ReconcilePolicy, Reconciler, SyncReport, SyncState,
};
pub use service::{DeviceService, PeerService, ServiceError, ServiceErrorKind};
pub use store::{DeviceQuery, DeviceStore, MemoryStore, Page, PeerQuery, PeerStore, StoreError};
pub use validate::{FieldViolation, ValidationError};
