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

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use uuid::Uuid;
use wgsync_core::pool::{Holder, PoolError};
use wgsync_core::service::{AddPeer, PeerDefaults, UpdateDevice, UpdatePeer};
use wgsync_core::{
    DeviceService, DeviceStore, PeerQuery, PeerService, PeerStore, ServiceErrorKind,
};
use wgsync_types::WgKey;

type TestPeerService = PeerService<MockGateway, wgsync_core::MemoryStore, wgsync_core::MemoryStore>;

fn peer_service(f: &Fixture) -> TestPeerService {
    PeerService::new(f.reconciler.clone(), PeerDefaults::default())
}

fn add_request(f: &Fixture, name: &str) -> AddPeer {
    AddPeer {
        device_id: f.device.id,
        name: name.into(),
        ..AddPeer::default()
    }
}

#[tokio::test]
async fn add_allocates_persists_and_applies() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);

    let first = svc.add(add_request(&f, "laptop")).await.unwrap();
    let second = svc.add(add_request(&f, "phone")).await.unwrap();

    assert_eq!(first.allowed_ips, ["10.0.0.2/32"]);
    assert_eq!(second.allowed_ips, ["10.0.0.3/32"]);
    assert_eq!(first.dns, "9.9.9.9, 149.112.112.112");
    assert_eq!(first.mtu, 1384);
    assert!(!first.has_preshared_key());
    assert_eq!(first.protocol_version, 1);

    let stored = PeerStore::get(f.store.as_ref(), first.id).await.unwrap();
    assert_eq!(stored.public_key, first.public_key);
    assert_eq!(f.gateway.configure_count(), 2);
    assert!(f.gateway.kernel_peer("wg0", &second.public_key).is_some());
}

#[tokio::test]
async fn add_with_preshared_key() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let mut req = add_request(&f, "laptop");
    req.add_preshared_key = true;

    let peer = svc.add(req).await.unwrap();

    let psk = peer.preshared_key.unwrap();
    assert!(!psk.is_zero());
    assert_eq!(f.gateway.last_change().preshared_key, Some(psk));
}

#[tokio::test]
async fn invalid_add_reports_every_violation_and_holds_nothing() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let mut req = add_request(&f, "laptop");
    req.email = "invalid.email".into();
    req.description = "d".repeat(41);
    req.dns = "1.1.1.1, nope".into();

    let err = svc.add(req).await.unwrap_err();
    let violations = err.validation().unwrap();
    assert_eq!(violations.violations.len(), 3);
    assert!(err.to_string().starts_with("peer service: invalid peer"));

    let peer = svc.add(add_request(&f, "laptop")).await.unwrap();
    assert_eq!(peer.allowed_ips, ["10.0.0.2/32"]);
    assert_eq!(f.store.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn kernel_failure_keeps_the_stored_peer_for_the_next_pass() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    f.gateway.fail_configure(true);

    let err = svc.add(add_request(&f, "laptop")).await.unwrap_err();
    assert!(err.is_kernel_apply_failure());
    assert_eq!(f.store.count(None).await.unwrap(), 1);
    assert_eq!(f.gateway.kernel_peer_count("wg0"), 0);

    f.gateway.fail_configure(false);
    let report = f.reconciler.sync_device(f.device.id).await.unwrap();
    assert_eq!(report.pushed.len(), 1);
    assert_eq!(f.gateway.kernel_peer_count("wg0"), 1);
}

#[tokio::test]
async fn small_block_runs_out() {
    let f = fixture("10.9.0.1/30", Vec::new());
    let svc = peer_service(&f);

    let peer = svc.add(add_request(&f, "only")).await.unwrap();
    assert_eq!(peer.allowed_ips, ["10.9.0.2/32"]);

    let err = svc.add(add_request(&f, "extra")).await.unwrap_err();
    assert!(matches!(
        err.kind,
        ServiceErrorKind::Pool(PoolError::RunOutOfAddresses { .. })
    ));
    assert_eq!(f.store.count(None).await.unwrap(), 1);
}

#[tokio::test]
async fn remove_releases_the_address() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let peer = svc.add(add_request(&f, "laptop")).await.unwrap();

    svc.remove(peer.id).await.unwrap();

    let change = f.gateway.last_change();
    assert!(change.remove);
    assert_eq!(change.public_key, peer.public_key);
    assert!(svc.get(peer.id).await.unwrap_err().is_not_found());

    let again = svc.add(add_request(&f, "tablet")).await.unwrap();
    assert_eq!(again.allowed_ips, ["10.0.0.2/32"]);
}

#[tokio::test]
async fn removing_a_disabled_peer_skips_the_kernel() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let peer = svc.add(add_request(&f, "laptop")).await.unwrap();
    svc.disable(peer.id).await.unwrap();
    let calls = f.gateway.configure_count();

    svc.remove(peer.id).await.unwrap();
    assert_eq!(f.gateway.configure_count(), calls);
}

#[tokio::test]
async fn disable_and_enable_toggle_kernel_presence() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let peer = svc.add(add_request(&f, "laptop")).await.unwrap();

    svc.disable(peer.id).await.unwrap();
    assert!(f.gateway.kernel_peer("wg0", &peer.public_key).is_none());
    assert!(!svc.get(peer.id).await.unwrap().is_enabled);

    let calls = f.gateway.configure_count();
    svc.disable(peer.id).await.unwrap();
    assert_eq!(f.gateway.configure_count(), calls);

    svc.enable(peer.id).await.unwrap();
    let change = f.gateway.last_change();
    assert!(!change.update_only);
    assert_eq!(change.allowed_ips[0].to_string(), "10.0.0.2/32");
    assert!(f.gateway.kernel_peer("wg0", &peer.public_key).is_some());

    // Disabled peers keep their address.
    let other = svc.add(add_request(&f, "phone")).await.unwrap();
    assert_eq!(other.allowed_ips, ["10.0.0.3/32"]);
}

#[tokio::test]
async fn update_applies_only_given_fields() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let mut req = add_request(&f, "laptop");
    req.description = "work".into();
    let peer = svc.add(req).await.unwrap();

    let updated = svc
        .update(
            peer.id,
            UpdatePeer {
                name: Some("laptop-2".into()),
                persistent_keepalive: Some(Duration::from_secs(25)),
                dns: Some(String::new()),
                ..UpdatePeer::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(updated.name, "laptop-2");
    assert_eq!(updated.description, "work");
    assert_eq!(updated.dns, "9.9.9.9, 149.112.112.112");
    let change = f.gateway.last_change();
    assert!(change.update_only);
    assert_eq!(change.persistent_keepalive, Some(Duration::from_secs(25)));
    assert_eq!(PeerStore::get(f.store.as_ref(), peer.id).await.unwrap().name, "laptop-2");
}

#[tokio::test]
async fn removing_preshared_key_pushes_zero_key() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let mut req = add_request(&f, "laptop");
    req.add_preshared_key = true;
    let peer = svc.add(req).await.unwrap();
    assert!(f.gateway.kernel_peer("wg0", &peer.public_key).unwrap().preshared_key.is_some());

    let updated = svc
        .update(
            peer.id,
            UpdatePeer {
                remove_preshared_key: true,
                ..UpdatePeer::default()
            },
        )
        .await
        .unwrap();

    assert!(!updated.has_preshared_key());
    assert_eq!(f.gateway.last_change().preshared_key, Some(WgKey::zero()));
    assert!(f.gateway.kernel_peer("wg0", &peer.public_key).unwrap().preshared_key.is_none());
    let stored = PeerStore::get(f.store.as_ref(), peer.id).await.unwrap();
    assert!(stored.preshared_key.is_none());
}

#[tokio::test]
async fn invalid_update_is_not_persisted() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let peer = svc.add(add_request(&f, "laptop")).await.unwrap();
    let calls = f.gateway.configure_count();

    let err = svc
        .update(
            peer.id,
            UpdatePeer {
                tags: Some(vec!["x".repeat(21)]),
                ..UpdatePeer::default()
            },
        )
        .await
        .unwrap_err();

    assert_eq!(err.validation().unwrap().fields().collect::<Vec<_>>(), ["tags"]);
    assert_eq!(f.gateway.configure_count(), calls);
    assert!(PeerStore::get(f.store.as_ref(), peer.id).await.unwrap().tags.is_empty());
}

#[tokio::test]
async fn listing_pages_and_validates_limit() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    for i in 0..25 {
        svc.add(add_request(&f, &format!("peer-{i:02}"))).await.unwrap();
    }

    let page = svc.get_all(PeerQuery::default()).await.unwrap();
    assert_eq!(page.items.len(), 20);
    assert_eq!(page.total, 25);
    assert!(page.has_next);
    assert!(page.items.iter().all(|p| p.protocol_version == 1));
    assert_eq!(page.items[0].name, "peer-00");

    let last = svc
        .get_all(PeerQuery {
            skip: 20,
            ..PeerQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(last.items.len(), 5);
    assert!(!last.has_next);

    let err = svc
        .get_all(PeerQuery {
            limit: 101,
            ..PeerQuery::default()
        })
        .await
        .unwrap_err();
    assert!(err.validation().is_some());
}

#[tokio::test]
async fn downloads_are_named_by_peer_id() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let peer = svc.add(add_request(&f, "laptop")).await.unwrap();

    let conf = svc.download_config(peer.id).await.unwrap();
    assert_eq!(conf.name, format!("{}.conf", peer.id));
    let text = String::from_utf8(conf.content).unwrap();
    assert!(text.contains("Address = 10.0.0.2/32\n"));
    assert!(text.contains(&format!("PublicKey = {}\n", f.device.public_key)));
    assert!(text.contains("AllowedIPs = 0.0.0.0/0\n"));

    let qr = svc.download_qr_code(peer.id).await.unwrap();
    assert_eq!(qr.name, format!("{}.svg", peer.id));
    assert!(String::from_utf8(qr.content).unwrap().contains("<svg"));
}

#[tokio::test]
async fn unknown_ids_are_not_found() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let id = Uuid::new_v4();

    assert!(svc.get(id).await.unwrap_err().is_not_found());
    assert!(svc.enable(id).await.unwrap_err().is_not_found());
    assert!(svc.download_config(id).await.unwrap_err().is_not_found());

    let mut req = add_request(&f, "laptop");
    req.device_id = id;
    let err = svc.add(req).await.unwrap_err();
    assert!(matches!(err.kind, ServiceErrorKind::DeviceNotFound(d) if d == id));
}

#[tokio::test]
async fn device_lifecycle() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let devices = DeviceService::new(f.reconciler.clone());

    let added = devices.add(device("wg1", "10.1.0.1/24")).await.unwrap();
    assert_eq!(f.gateway.provisioned(), ["wg1"]);
    assert_eq!(added.max_peers_count, 253);
    assert_eq!(added.get_available_ip().unwrap().to_string(), "10.1.0.2/32");

    let updated = devices
        .update(
            added.id,
            UpdateDevice {
                address: Some("10.1.0.1/28".into()),
                description: Some("branch".into()),
                ..UpdateDevice::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.max_peers_count, 13);
    assert_eq!(updated.description, "branch");
    assert_eq!(updated.get_available_ip().unwrap().to_string(), "10.1.0.2/32");

    let fetched = devices.get(added.id).await.unwrap();
    assert_eq!(fetched.device_type, wgsync_types::DeviceType::LinuxKernel);

    let listed = devices.get_all(Default::default()).await.unwrap();
    assert_eq!(listed.total, 2);

    devices.remove(added.id).await.unwrap();
    assert_eq!(f.gateway.removed(), ["wg1"]);
    assert!(devices.get(added.id).await.unwrap_err().is_not_found());
    assert!(f.reconciler.registry().get(added.id).is_none());
}

#[tokio::test]
async fn invalid_device_is_rejected_before_storage() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let devices = DeviceService::new(f.reconciler.clone());

    let err = devices.add(device("wg1", "10.1.0.1")).await.unwrap_err();
    assert!(err.to_string().starts_with("device service: invalid device"));
    assert_eq!(
        DeviceStore::get_all(f.store.as_ref(), &Default::default())
            .await
            .unwrap()
            .total,
        1
    );
    assert!(f.gateway.provisioned().is_empty());
}

#[tokio::test]
async fn services_share_one_pool() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = Arc::new(peer_service(&f));

    let mut handles = Vec::new();
    for i in 0..16 {
        let svc = svc.clone();
        let req = add_request(&f, &format!("peer-{i}"));
        handles.push(tokio::spawn(async move { svc.add(req).await }));
    }

    let mut addresses = Vec::new();
    for h in handles {
        addresses.push(h.await.unwrap().unwrap().allowed_ips[0].clone());
    }
    addresses.sort();
    addresses.dedup();
    assert_eq!(addresses.len(), 16);
}

#[tokio::test]
async fn removing_a_conflicting_peer_keeps_other_holders_addresses() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let first = stored_peer(f.device.id, "aaa", "10.0.0.2/32");
    let clash = stored_peer(f.device.id, "bbb", "10.0.0.2/32");
    let own = stored_peer(f.device.id, "ccc", "10.0.0.1/32");
    for p in [&first, &clash, &own] {
        PeerStore::add(f.store.as_ref(), p).await.unwrap();
    }
    let report = f.reconciler.sync_devices().await.unwrap();
    assert_eq!(report.conflicting, [clash.id, own.id]);

    let svc = peer_service(&f);
    svc.remove(clash.id).await.unwrap();
    svc.remove(own.id).await.unwrap();

    let pool = f.reconciler.device(f.device.id).await.unwrap().pool().unwrap().clone();
    assert_eq!(pool.holder("10.0.0.1".parse().unwrap()), Some(Holder::Device));
    assert_eq!(pool.holder("10.0.0.2".parse().unwrap()), Some(Holder::Peer(first.id)));

    let a = svc.add(add_request(&f, "new-1")).await.unwrap();
    let b = svc.add(add_request(&f, "new-2")).await.unwrap();
    assert_eq!(a.allowed_ips, ["10.0.0.3/32"]);
    assert_eq!(b.allowed_ips, ["10.0.0.4/32"]);
    assert!(f.gateway.kernel_peer("wg0", &first.public_key).is_some());
}

#[tokio::test]
async fn enabling_a_peer_whose_address_is_taken_fails() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let first = stored_peer(f.device.id, "aaa", "10.0.0.2/32");
    let mut parked = stored_peer(f.device.id, "bbb", "10.0.0.2/32");
    parked.is_enabled = false;
    PeerStore::add(f.store.as_ref(), &first).await.unwrap();
    PeerStore::add(f.store.as_ref(), &parked).await.unwrap();
    f.reconciler.sync_devices().await.unwrap();
    let calls = f.gateway.configure_count();

    let svc = peer_service(&f);
    let err = svc.enable(parked.id).await.unwrap_err();

    assert!(matches!(
        err.kind,
        ServiceErrorKind::Pool(PoolError::HeldByOther { holder: Holder::Peer(id), .. }) if id == first.id
    ));
    assert_eq!(f.gateway.configure_count(), calls);
    assert!(f.gateway.kernel_peer("wg0", &parked.public_key).is_none());
    assert!(!PeerStore::get(f.store.as_ref(), parked.id).await.unwrap().is_enabled);
}

#[tokio::test]
async fn failed_persist_releases_the_address() {
    let (gateway, peers, reconciler, device) = flaky_fixture("10.0.0.1/24");
    let svc = PeerService::new(reconciler.clone(), PeerDefaults::default());
    let req = AddPeer {
        device_id: device.id,
        name: "laptop".into(),
        ..AddPeer::default()
    };

    peers.fail_writes(true);
    let err = svc.add(req.clone()).await.unwrap_err();
    assert!(matches!(err.kind, ServiceErrorKind::Store(_)));

    let pool = reconciler.device(device.id).await.unwrap().pool().unwrap().clone();
    assert!(!pool.contains("10.0.0.2".parse().unwrap()));
    assert_eq!(gateway.configure_count(), 0);
    assert_eq!(peers.count(None).await.unwrap(), 0);

    peers.fail_writes(false);
    let peer = svc.add(req).await.unwrap();
    assert_eq!(peer.allowed_ips, ["10.0.0.2/32"]);
}

#[tokio::test]
async fn device_config_lists_enabled_peers() {
    let f = fixture("10.0.0.1/24", Vec::new());
    let svc = peer_service(&f);
    let laptop = svc.add(add_request(&f, "laptop")).await.unwrap();
    let phone = svc.add(add_request(&f, "phone")).await.unwrap();
    svc.disable(phone.id).await.unwrap();

    let devices = DeviceService::new(f.reconciler.clone());
    let file = devices.download_config(f.device.id).await.unwrap();

    assert_eq!(file.name, "wg0.conf");
    let text = String::from_utf8(file.content).unwrap();
    assert!(text.starts_with("[Interface]\n"));
    assert!(text.contains("Address = 10.0.0.1/24\n"));
    assert!(text.contains(&format!("# laptop\n[Peer]\nPublicKey = {}\n", laptop.public_key)));
    assert!(!text.contains(&phone.public_key.to_string()));

    let err = devices.download_config(Uuid::new_v4()).await.unwrap_err();
    assert!(err.is_not_found());
}
