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

//! The seam between the control plane and the WireGuard kernel module.

use std::future::Future;

use thiserror::Error;
use wgsync_types::{DeviceSnapshot, InterfaceConfig, PeerConfig};

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("wireguard device {0} not found")]
    DeviceNotFound(String),

    #[error("not supported on this platform")]
    Unsupported,

    #[error("wireguard interface error: {0}")]
    Interface(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl KernelError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::DeviceNotFound(_))
    }
}

/// Reads and writes live WireGuard device state.
///
/// `configure_device` applies peer changes incrementally: peers not named in
/// `peers` are left alone.
pub trait KernelGateway: Send + Sync {
    fn get_device(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<DeviceSnapshot, KernelError>> + Send;

    fn configure_device(
        &self,
        name: &str,
        peers: Vec<PeerConfig>,
    ) -> impl Future<Output = Result<(), KernelError>> + Send;

    /// Create the interface if missing, then set its key, port, mark and
    /// address and bring it up. Existing peers are kept.
    fn provision_device(
        &self,
        name: &str,
        config: &InterfaceConfig,
    ) -> impl Future<Output = Result<(), KernelError>> + Send;

    fn remove_device(&self, name: &str) -> impl Future<Output = Result<(), KernelError>> + Send;
}
