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

//! `wg-quick` documents for peers and devices.
//!
//! Optional settings are left out entirely rather than written empty.

use std::fmt::{self, Write};

use qrcode::QrCode;
use qrcode::render::svg;

use crate::device::DeviceRecord;
use crate::peer::PeerRecord;
use crate::validate::dns_entries;

/// The configuration a peer imports to reach its device.
pub struct ClientConfig<'a> {
    pub peer: &'a PeerRecord,
    pub device: &'a DeviceRecord,
    /// Routes the client sends through the tunnel.
    pub allowed_ips: &'a [String],
}

impl fmt::Display for ClientConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let peer = self.peer;

        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", peer.private_key)?;
        writeln!(f, "Address = {}", peer.allowed_ips.join(", "))?;
        dns(f, &peer.dns)?;
        if peer.mtu != 0 {
            writeln!(f, "MTU = {}", peer.mtu)?;
        }

        writeln!(f)?;
        writeln!(f, "[Peer]")?;
        writeln!(f, "PublicKey = {}", self.device.public_key)?;
        if let Some(psk) = peer.preshared_key {
            writeln!(f, "PresharedKey = {psk}")?;
        }
        writeln!(f, "Endpoint = {}", self.device.endpoint)?;
        writeln!(f, "AllowedIPs = {}", self.allowed_ips.join(", "))?;
        let keepalive = peer.persistent_keepalive.as_secs();
        if keepalive != 0 {
            writeln!(f, "PersistentKeepalive = {keepalive}")?;
        }
        Ok(())
    }
}

/// The device's own `wg-quick` file, with a `[Peer]` section for each
/// enabled peer.
pub struct ServerConfig<'a> {
    pub device: &'a DeviceRecord,
    pub peers: &'a [PeerRecord],
}

impl fmt::Display for ServerConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.device;

        writeln!(f, "[Interface]")?;
        writeln!(f, "PrivateKey = {}", d.private_key)?;
        writeln!(f, "Address = {}", d.address)?;
        writeln!(f, "ListenPort = {}", d.listen_port)?;
        if d.mtu != 0 {
            writeln!(f, "MTU = {}", d.mtu)?;
        }
        dns(f, &d.dns)?;
        if d.firewall_mark != 0 {
            writeln!(f, "FwMark = {}", d.firewall_mark)?;
        }
        optional(f, "Table", &d.table)?;
        let keepalive = d.persistent_keepalive.as_secs();
        if keepalive != 0 {
            writeln!(f, "PersistentKeepalive = {keepalive}")?;
        }
        optional(f, "PreUp", &d.pre_up)?;
        optional(f, "PostUp", &d.post_up)?;
        optional(f, "PreDown", &d.pre_down)?;
        optional(f, "PostDown", &d.post_down)?;

        for peer in self.peers.iter().filter(|p| p.is_enabled) {
            writeln!(f)?;
            writeln!(f, "# {}", peer.name)?;
            writeln!(f, "[Peer]")?;
            writeln!(f, "PublicKey = {}", peer.public_key)?;
            if let Some(psk) = peer.preshared_key {
                writeln!(f, "PresharedKey = {psk}")?;
            }
            writeln!(f, "AllowedIPs = {}", peer.allowed_ips.join(", "))?;
        }
        Ok(())
    }
}

fn dns(f: &mut fmt::Formatter<'_>, value: &str) -> fmt::Result {
    let entries = dns_entries(value);
    if entries.is_empty() {
        return Ok(());
    }
    writeln!(f, "DNS = {}", entries.join(", "))
}

fn optional(f: &mut fmt::Formatter<'_>, key: &str, value: &str) -> fmt::Result {
    if value.is_empty() {
        return Ok(());
    }
    writeln!(f, "{key} = {value}")
}

#[derive(Debug, thiserror::Error)]
#[error("QR encoding failed: {0}")]
pub struct QrError(#[from] qrcode::types::QrError);

/// Render `document` as an SVG QR code.
pub fn qr_svg(document: &str) -> Result<String, QrError> {
    let code = QrCode::new(document.as_bytes())?;
    Ok(code
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .build())
}

/// Render a document into a fresh string.
pub fn to_document(config: &impl fmt::Display) -> Result<String, fmt::Error> {
    let mut out = String::new();
    write!(out, "{config}")?;
    Ok(out)
}
