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

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Length in bytes of every WireGuard key.
pub const KEY_LEN: usize = 32;

/// Errors produced while parsing a key from its text form.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    /// The input was not valid standard base64.
    #[error("failed to decode base64 key: {0}")]
    Decode(#[from] base64::DecodeError),

    /// The decoded input was not exactly 32 bytes.
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// A WireGuard key (private, public or preshared).
///
/// The text form is standard base64 with padding, the same encoding `wg(8)`
/// prints and accepts.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WgKey([u8; KEY_LEN]);

impl WgKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// The all-zero key. Pushing it as a preshared key clears the
    /// preshared key of a kernel peer.
    pub const fn zero() -> Self {
        Self([0u8; KEY_LEN])
    }

    /// Generate a fresh Curve25519 private key.
    pub fn generate_private() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        Self(secret.to_bytes())
    }

    /// Generate a random symmetric key, suitable as a preshared key.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive the public key, treating `self` as a private key.
    pub fn public_key(&self) -> Self {
        let secret = StaticSecret::from(self.0);
        Self(*PublicKey::from(&secret).as_bytes())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Whether every byte of the key is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&BASE64.encode(self.0))
    }
}

// Keys never show up in debug output in full.
impl fmt::Debug for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = BASE64.encode(self.0);
        write!(f, "WgKey({}…)", &encoded[..8])
    }
}

impl FromStr for WgKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = BASE64.decode(s.trim())?;
        let len = bytes.len();
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|_| KeyError::InvalidLength(len))?;
        Ok(Self(bytes))
    }
}

impl From<[u8; KEY_LEN]> for WgKey {
    fn from(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl Serialize for WgKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WgKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
