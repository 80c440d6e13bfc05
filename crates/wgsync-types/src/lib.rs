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

//! wgsync-types: value types shared by the wgsync engine, its storage
//! backends and the kernel gateway.
//!
//! Two families live here: [`WgKey`], the 32-byte key type with its base64
//! text form, and the kernel data model in [`kernel`] that describes what a
//! live WireGuard device reports and accepts.

#![warn(missing_docs)]

pub mod kernel;
pub mod key;

pub use kernel::{DeviceSnapshot, DeviceType, InterfaceConfig, KernelPeer, PeerConfig};
pub use key::{KEY_LEN, KeyError, WgKey};
