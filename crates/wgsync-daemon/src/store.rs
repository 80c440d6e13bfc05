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

//! Peer rows in a JSON state file, rewritten whole on every mutation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;
use wgsync_core::store::select_peers;
use wgsync_core::{Page, PeerQuery, PeerRecord, PeerStore, PersistedPeer, StoreError};

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    peers: Vec<PersistedPeer>,
}

pub struct JsonFileStore {
    path: PathBuf,
    rows: Mutex<Vec<PersistedPeer>>,
}

fn backend(e: impl std::fmt::Display) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl JsonFileStore {
    /// Load `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str::<StateFile>(&contents).map_err(backend)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "state file not found, starting empty");
                StateFile::default()
            }
            Err(e) => return Err(backend(e)),
        };

        // Surface unreadable rows now rather than on first listing.
        for row in &state.peers {
            row.to_peer()?;
        }

        info!(path = %path.display(), peer_count = state.peers.len(), "loaded peer state");
        Ok(Self {
            path,
            rows: Mutex::new(state.peers),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `rows` next to the state file and rename it into place.
    async fn persist(&self, rows: &[PersistedPeer]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(backend)?;
        }
        let state = StateFile {
            peers: rows.to_vec(),
        };
        let contents = serde_json::to_string_pretty(&state).map_err(backend)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, contents).await.map_err(backend)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(backend)?;
        debug!(path = %self.path.display(), peer_count = rows.len(), "saved peer state");
        Ok(())
    }

    /// Apply `change` to a copy of the rows, persist it, and only then make
    /// it the in-memory state.
    async fn mutate(
        &self,
        change: impl FnOnce(&mut Vec<PersistedPeer>) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        let mut next = rows.clone();
        change(&mut next)?;
        self.persist(&next).await?;
        *rows = next;
        Ok(())
    }
}

fn position(rows: &[PersistedPeer], id: Uuid) -> Option<usize> {
    let id = id.to_string();
    rows.iter().position(|r| r.id == id)
}

impl PeerStore for JsonFileStore {
    async fn add(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        let row = peer.to_persisted_peer();
        self.mutate(|rows| {
            if position(rows, peer.id).is_some() {
                return Err(StoreError::DuplicateId(peer.id));
            }
            rows.push(row);
            Ok(())
        })
        .await
    }

    async fn update(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        let row = peer.to_persisted_peer();
        self.mutate(|rows| {
            let i = position(rows, peer.id).ok_or(StoreError::PeerNotFound(peer.id))?;
            rows[i] = row;
            Ok(())
        })
        .await
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        self.mutate(|rows| {
            let i = position(rows, id).ok_or(StoreError::PeerNotFound(id))?;
            rows.remove(i);
            Ok(())
        })
        .await
    }

    async fn get(&self, id: Uuid) -> Result<PeerRecord, StoreError> {
        let rows = self.rows.lock().await;
        let i = position(&rows, id).ok_or(StoreError::PeerNotFound(id))?;
        Ok(rows[i].to_peer()?)
    }

    async fn get_all(&self, query: &PeerQuery) -> Result<Page<PeerRecord>, StoreError> {
        let rows = self.rows.lock().await.clone();
        select_peers(rows, query)
    }

    async fn count(&self, device_id: Option<Uuid>) -> Result<usize, StoreError> {
        let rows = self.rows.lock().await;
        let Some(device_id) = device_id else {
            return Ok(rows.len());
        };
        let device_id = device_id.to_string();
        Ok(rows.iter().filter(|r| r.device_id == device_id).count())
    }
}
