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

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;
use wgsync_core::{
    DeviceRecord, KernelError, KernelGateway, MemoryStore, Page, PeerQuery, PeerRecord, PeerStore,
    ReconcilePolicy, Reconciler, StoreError,
};
use wgsync_types::{DeviceSnapshot, DeviceType, InterfaceConfig, KernelPeer, PeerConfig, WgKey};

/// Kernel stand-in that records every mutation and applies it to an
/// in-memory device table, so later passes see the result.
#[derive(Default)]
pub struct MockGateway {
    devices: Mutex<HashMap<String, DeviceSnapshot>>,
    configured: Mutex<Vec<(String, Vec<PeerConfig>)>>,
    provisioned: Mutex<Vec<String>>,
    removed: Mutex<Vec<String>>,
    fail_configure: AtomicBool,
}

impl MockGateway {
    pub fn with_device(name: &str, peers: Vec<KernelPeer>) -> Self {
        let gateway = Self::default();
        gateway.devices.lock().unwrap().insert(
            name.to_string(),
            DeviceSnapshot {
                name: name.to_string(),
                device_type: DeviceType::LinuxKernel,
                peers,
                ..DeviceSnapshot::default()
            },
        );
        gateway
    }

    pub fn configured(&self) -> Vec<(String, Vec<PeerConfig>)> {
        self.configured.lock().unwrap().clone()
    }

    pub fn configure_count(&self) -> usize {
        self.configured.lock().unwrap().len()
    }

    pub fn last_change(&self) -> PeerConfig {
        let calls = self.configured.lock().unwrap();
        let (_, changes) = calls.last().expect("no configure call");
        changes.last().expect("empty configure call").clone()
    }

    pub fn clear_calls(&self) {
        self.configured.lock().unwrap().clear();
    }

    pub fn provisioned(&self) -> Vec<String> {
        self.provisioned.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.removed.lock().unwrap().clone()
    }

    pub fn kernel_peer(&self, device: &str, key: &WgKey) -> Option<KernelPeer> {
        self.devices
            .lock()
            .unwrap()
            .get(device)
            .and_then(|d| d.peer(key).cloned())
    }

    pub fn kernel_peer_count(&self, device: &str) -> usize {
        self.devices
            .lock()
            .unwrap()
            .get(device)
            .map_or(0, |d| d.peers.len())
    }

    pub fn fail_configure(&self, fail: bool) {
        self.fail_configure.store(fail, Ordering::SeqCst);
    }
}

impl KernelGateway for MockGateway {
    async fn get_device(&self, name: &str) -> Result<DeviceSnapshot, KernelError> {
        self.devices
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| KernelError::DeviceNotFound(name.to_string()))
    }

    async fn configure_device(&self, name: &str, peers: Vec<PeerConfig>) -> Result<(), KernelError> {
        if self.fail_configure.load(Ordering::SeqCst) {
            return Err(KernelError::Interface("netlink: operation not permitted".into()));
        }
        let mut devices = self.devices.lock().unwrap();
        let device = devices
            .get_mut(name)
            .ok_or_else(|| KernelError::DeviceNotFound(name.to_string()))?;

        for change in &peers {
            let existing = device.peers.iter().position(|p| p.public_key == change.public_key);
            match (existing, change.remove, change.update_only) {
                (Some(i), true, _) => {
                    device.peers.remove(i);
                }
                (None, true, _) | (None, false, true) => {}
                (Some(i), false, _) => apply(&mut device.peers[i], change),
                (None, false, false) => {
                    let mut peer = KernelPeer::new(change.public_key, Vec::new());
                    apply(&mut peer, change);
                    device.peers.push(peer);
                }
            }
        }

        self.configured.lock().unwrap().push((name.to_string(), peers));
        Ok(())
    }

    async fn provision_device(&self, name: &str, config: &InterfaceConfig) -> Result<(), KernelError> {
        let mut devices = self.devices.lock().unwrap();
        let device = devices.entry(name.to_string()).or_insert_with(|| DeviceSnapshot {
            name: name.to_string(),
            device_type: DeviceType::LinuxKernel,
            ..DeviceSnapshot::default()
        });
        device.private_key = Some(config.private_key);
        device.public_key = Some(config.private_key.public_key());
        device.listen_port = config.listen_port;
        device.firewall_mark = config.firewall_mark;
        self.provisioned.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn remove_device(&self, name: &str) -> Result<(), KernelError> {
        self.devices.lock().unwrap().remove(name);
        self.removed.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

fn apply(peer: &mut KernelPeer, change: &PeerConfig) {
    if let Some(psk) = change.preshared_key {
        peer.preshared_key = (!psk.is_zero()).then_some(psk);
    }
    if let Some(keepalive) = change.persistent_keepalive {
        peer.persistent_keepalive = keepalive;
    }
    if change.replace_allowed_ips {
        peer.allowed_ips = change.allowed_ips.clone();
    } else {
        peer.allowed_ips.extend(change.allowed_ips.iter().copied());
    }
}

pub type TestReconciler = Reconciler<MockGateway, MemoryStore, MemoryStore>;

pub struct Fixture {
    pub gateway: Arc<MockGateway>,
    pub store: Arc<MemoryStore>,
    pub reconciler: Arc<TestReconciler>,
    pub device: DeviceRecord,
}

pub fn device(name: &str, address: &str) -> DeviceRecord {
    DeviceRecord::new(
        name,
        WgKey::generate_private(),
        51820,
        "vpn.example.com:51820",
        address,
    )
}

/// A stored device `wg0` on `address`, plus the given kernel peers.
pub fn fixture(address: &str, kernel_peers: Vec<KernelPeer>) -> Fixture {
    fixture_with_policy(address, kernel_peers, ReconcilePolicy::default())
}

pub fn fixture_with_policy(
    address: &str,
    kernel_peers: Vec<KernelPeer>,
    policy: ReconcilePolicy,
) -> Fixture {
    let device = device("wg0", address);
    let gateway = Arc::new(MockGateway::with_device("wg0", kernel_peers));
    let store = Arc::new(MemoryStore::with_devices([device.clone()]));
    let reconciler = Arc::new(Reconciler::new(
        gateway.clone(),
        store.clone(),
        store.clone(),
        policy,
    ));
    Fixture {
        gateway,
        store,
        reconciler,
        device,
    }
}

/// A stored, enabled peer holding `address`.
pub fn stored_peer(device_id: Uuid, name: &str, address: &str) -> PeerRecord {
    let mut peer = PeerRecord::generate(device_id, name);
    peer.allowed_ips = vec![address.to_string()];
    peer
}

pub fn kernel_peer_for(peer: &PeerRecord) -> KernelPeer {
    KernelPeer::new(
        peer.public_key,
        peer.allowed_ips.iter().map(|ip| ip.parse().unwrap()).collect(),
    )
}

/// Peer store whose writes can be switched to fail, reads pass through.
#[derive(Default)]
pub struct FlakyPeerStore {
    inner: MemoryStore,
    fail_writes: AtomicBool,
}

impl FlakyPeerStore {
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".into()));
        }
        Ok(())
    }
}

impl PeerStore for FlakyPeerStore {
    async fn add(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        self.check()?;
        PeerStore::add(&self.inner, peer).await
    }

    async fn update(&self, peer: &PeerRecord) -> Result<(), StoreError> {
        self.check()?;
        PeerStore::update(&self.inner, peer).await
    }

    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        self.check()?;
        PeerStore::remove(&self.inner, id).await
    }

    async fn get(&self, id: Uuid) -> Result<PeerRecord, StoreError> {
        PeerStore::get(&self.inner, id).await
    }

    async fn get_all(&self, query: &PeerQuery) -> Result<Page<PeerRecord>, StoreError> {
        PeerStore::get_all(&self.inner, query).await
    }

    async fn count(&self, device_id: Option<Uuid>) -> Result<usize, StoreError> {
        self.inner.count(device_id).await
    }
}

pub type FlakyReconciler = Reconciler<MockGateway, FlakyPeerStore, MemoryStore>;

/// Device `wg0` on `address` with its peers kept in a [`FlakyPeerStore`].
pub fn flaky_fixture(
    address: &str,
) -> (Arc<MockGateway>, Arc<FlakyPeerStore>, Arc<FlakyReconciler>, DeviceRecord) {
    let device = device("wg0", address);
    let gateway = Arc::new(MockGateway::with_device("wg0", Vec::new()));
    let peers = Arc::new(FlakyPeerStore::default());
    let devices = Arc::new(MemoryStore::with_devices([device.clone()]));
    let reconciler = Arc::new(Reconciler::new(
        gateway.clone(),
        peers.clone(),
        devices,
        ReconcilePolicy::default(),
    ));
    (gateway, peers, reconciler, device)
}
