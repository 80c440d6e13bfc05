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

//! Persistence collaborators and a `DashMap`-backed in-memory store.

use std::future::Future;

use dashmap::DashMap;
use uuid::Uuid;

use crate::device::DeviceRecord;
use crate::peer::{PeerError, PeerRecord, PersistedPeer};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("peer {0} not found")]
    PeerNotFound(Uuid),

    #[error("device {0} not found")]
    DeviceNotFound(Uuid),

    #[error("record {0} already exists")]
    DuplicateId(Uuid),

    #[error("device name {0} already taken")]
    DuplicateName(String),

    #[error("stored peer is unreadable: {0}")]
    Corrupt(#[from] PeerError),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::PeerNotFound(_) | Self::DeviceNotFound(_))
    }
}

type Result<T> = std::result::Result<T, StoreError>;

/// One page of a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub has_next: bool,
}

impl<T> Page<T> {
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            total: self.total,
            has_next: self.has_next,
        }
    }
}

/// `limit == 0` means no limit at the store level.
#[derive(Debug, Clone, Default)]
pub struct PeerQuery {
    pub skip: usize,
    pub limit: usize,
    pub search: Option<String>,
    pub device_id: Option<Uuid>,
}

impl PeerQuery {
    /// Every peer of one device.
    pub fn device(device_id: Uuid) -> Self {
        Self {
            device_id: Some(device_id),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceQuery {
    pub skip: usize,
    pub limit: usize,
    pub search: Option<String>,
}

pub trait PeerStore: Send + Sync {
    fn add(&self, peer: &PeerRecord) -> impl Future<Output = Result<()>> + Send;
    fn update(&self, peer: &PeerRecord) -> impl Future<Output = Result<()>> + Send;
    fn remove(&self, id: Uuid) -> impl Future<Output = Result<()>> + Send;
    fn get(&self, id: Uuid) -> impl Future<Output = Result<PeerRecord>> + Send;
    fn get_all(&self, query: &PeerQuery) -> impl Future<Output = Result<Page<PeerRecord>>> + Send;
    fn count(&self, device_id: Option<Uuid>) -> impl Future<Output = Result<usize>> + Send;
}

pub trait DeviceStore: Send + Sync {
    fn add(&self, device: &DeviceRecord) -> impl Future<Output = Result<()>> + Send;
    fn update(&self, device: &DeviceRecord) -> impl Future<Output = Result<()>> + Send;
    fn remove(&self, id: Uuid) -> impl Future<Output = Result<()>> + Send;
    fn get(&self, id: Uuid) -> impl Future<Output = Result<DeviceRecord>> + Send;
    fn get_all(
        &self,
        query: &DeviceQuery,
    ) -> impl Future<Output = Result<Page<DeviceRecord>>> + Send;
}

/// Case-insensitive substring match of `needle` against any of `haystacks`.
/// An empty or absent needle matches everything.
pub fn matches_search(needle: Option<&str>, haystacks: &[&str]) -> bool {
    let Some(needle) = needle.map(str::trim).filter(|n| !n.is_empty()) else {
        return true;
    };
    let needle = needle.to_lowercase();
    haystacks
        .iter()
        .any(|h| h.to_lowercase().contains(&needle))
}

/// Slice an already ordered listing.
pub fn paginate<T>(items: Vec<T>, skip: usize, limit: usize) -> Page<T> {
    let total = items.len();
    let items: Vec<T> = if limit == 0 {
        items.into_iter().skip(skip).collect()
    } else {
        items.into_iter().skip(skip).take(limit).collect()
    };
    let has_next = skip.saturating_add(items.len()) < total;
    Page { items, total, has_next }
}

pub fn peer_matches(peer: &PersistedPeer, query: &PeerQuery) -> bool {
    if let Some(device_id) = query.device_id
        && peer.device_id != device_id.to_string()
    {
        return false;
    }
    matches_search(
        query.search.as_deref(),
        &[&peer.name, &peer.description, &peer.email],
    )
}

/// Filter, order by name then id, and page persisted peer rows.
pub fn select_peers(
    rows: impl IntoIterator<Item = PersistedPeer>,
    query: &PeerQuery,
) -> Result<Page<PeerRecord>> {
    let mut rows: Vec<PersistedPeer> = rows
        .into_iter()
        .filter(|p| peer_matches(p, query))
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

    let page = paginate(rows, query.skip, query.limit);
    let items = page
        .items
        .iter()
        .map(PersistedPeer::to_peer)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Page {
        items,
        total: page.total,
        has_next: page.has_next,
    })
}

/// In-memory store for both peers and devices. Peers are held in their
/// persisted form so kernel-derived fields never leak into storage.
#[derive(Debug, Default)]
pub struct MemoryStore {
    peers: DashMap<Uuid, PersistedPeer>,
    devices: DashMap<Uuid, DeviceRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(devices: impl IntoIterator<Item = DeviceRecord>) -> Self {
        let store = Self::new();
        for device in devices {
            store.devices.insert(device.id, device);
        }
        store
    }

    pub fn with_peers(self, peers: impl IntoIterator<Item = PersistedPeer>) -> Result<Self> {
        for peer in peers {
            let id = peer.to_peer()?.id;
            self.peers.insert(id, peer);
        }
        Ok(self)
    }
}

impl PeerStore for MemoryStore {
    async fn add(&self, peer: &PeerRecord) -> Result<()> {
        if self.peers.contains_key(&peer.id) {
            return Err(StoreError::DuplicateId(peer.id));
        }
        self.peers.insert(peer.id, peer.to_persisted_peer());
        Ok(())
    }

    async fn update(&self, peer: &PeerRecord) -> Result<()> {
        let mut row = self
            .peers
            .get_mut(&peer.id)
            .ok_or(StoreError::PeerNotFound(peer.id))?;
        *row = peer.to_persisted_peer();
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.peers
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::PeerNotFound(id))
    }

    async fn get(&self, id: Uuid) -> Result<PeerRecord> {
        let row = self.peers.get(&id).ok_or(StoreError::PeerNotFound(id))?;
        Ok(row.to_peer()?)
    }

    async fn get_all(&self, query: &PeerQuery) -> Result<Page<PeerRecord>> {
        let rows: Vec<PersistedPeer> = self.peers.iter().map(|r| r.value().clone()).collect();
        select_peers(rows, query)
    }

    async fn count(&self, device_id: Option<Uuid>) -> Result<usize> {
        let Some(device_id) = device_id else {
            return Ok(self.peers.len());
        };
        let device_id = device_id.to_string();
        Ok(self
            .peers
            .iter()
            .filter(|r| r.device_id == device_id)
            .count())
    }
}

impl DeviceStore for MemoryStore {
    async fn add(&self, device: &DeviceRecord) -> Result<()> {
        if self.devices.contains_key(&device.id) {
            return Err(StoreError::DuplicateId(device.id));
        }
        if self.devices.iter().any(|d| d.name == device.name) {
            return Err(StoreError::DuplicateName(device.name.clone()));
        }
        self.devices.insert(device.id, device.clone());
        Ok(())
    }

    async fn update(&self, device: &DeviceRecord) -> Result<()> {
        if self
            .devices
            .iter()
            .any(|d| d.name == device.name && d.id != device.id)
        {
            return Err(StoreError::DuplicateName(device.name.clone()));
        }
        let mut row = self
            .devices
            .get_mut(&device.id)
            .ok_or(StoreError::DeviceNotFound(device.id))?;
        *row = device.clone();
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<()> {
        self.devices
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::DeviceNotFound(id))
    }

    async fn get(&self, id: Uuid) -> Result<DeviceRecord> {
        self.devices
            .get(&id)
            .map(|d| d.value().clone())
            .ok_or(StoreError::DeviceNotFound(id))
    }

    async fn get_all(&self, query: &DeviceQuery) -> Result<Page<DeviceRecord>> {
        let mut devices: Vec<DeviceRecord> = self
            .devices
            .iter()
            .filter(|d| matches_search(query.search.as_deref(), &[&d.name, &d.description]))
            .map(|d| d.value().clone())
            .collect();
        devices.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        Ok(paginate(devices, query.skip, query.limit))
    }
}
