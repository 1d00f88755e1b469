// Copyright 2025 The Shoal Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end membership scenarios on an in-memory cluster.

mod common;

use std::time::Duration;

use tokio::sync::broadcast;

use common::{
    build_node, drain_updates, fast_config, seed_addr, start_node, wait_for, Network,
};
use shoal_cluster::FdEvent;
use shoal_core::{Member, MemberStatus, MembershipConfig};

/// Waits for the next update concerning `id`, skipping other members.
async fn next_update_for(rx: &mut broadcast::Receiver<Member>, id: &str) -> Member {
    let deadline = Duration::from_secs(2);
    tokio::time::timeout(deadline, async {
        loop {
            match rx.recv().await {
                Ok(member) if member.id() == id => return member,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("update stream closed while waiting for {id}")
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no update for {id} within {deadline:?}"))
}

#[tokio::test]
async fn test_join_via_seed() {
    let net = Network::new();
    let a = start_node(&net, "a", 4801, &[], fast_config()).await;
    let mut a_updates = a.membership.listen_updates();

    let b = build_node(&net, "b", 4802, &[seed_addr(4801)], fast_config());
    let mut b_updates = b.membership.listen_updates();
    b.membership.start().await.unwrap();

    wait_for("both tables to hold both members", Duration::from_secs(2), || {
        a.member_status("b") == Some(MemberStatus::Trusted)
            && b.member_status("a") == Some(MemberStatus::Trusted)
            && a.membership.members().len() == 2
            && b.membership.members().len() == 2
    })
    .await;

    // Each observer stream carried the trusted delta for the peer.
    let joined = next_update_for(&mut a_updates, "b").await;
    assert_eq!(joined.status, MemberStatus::Trusted);

    let local = next_update_for(&mut b_updates, "b").await;
    assert_eq!(local.status, MemberStatus::Trusted);
    let peer = next_update_for(&mut b_updates, "a").await;
    assert_eq!(peer.status, MemberStatus::Trusted);

    a.membership.stop().await;
    b.membership.stop().await;
}

#[tokio::test]
async fn test_suspicion_then_recovery() {
    let net = Network::new();
    let a = start_node(&net, "a", 4803, &[], fast_config()).await;
    let b = start_node(&net, "b", 4804, &[seed_addr(4803)], fast_config()).await;

    wait_for("cluster to form", Duration::from_secs(2), || {
        a.member_status("b") == Some(MemberStatus::Trusted)
    })
    .await;

    let mut a_updates = a.membership.listen_updates();
    a.fd.emit(FdEvent::suspect(b.endpoint.clone()));

    let suspected = next_update_for(&mut a_updates, "b").await;
    assert_eq!(suspected.status, MemberStatus::Suspected);

    // The detector changes its mind well inside the suspect window.
    a.fd.emit(FdEvent::alive(b.endpoint.clone()));

    let recovered = next_update_for(&mut a_updates, "b").await;
    assert_eq!(recovered.status, MemberStatus::Trusted);

    // Past the suspect window: no removal ever happened.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(a.member_status("b"), Some(MemberStatus::Trusted));
    let late = drain_updates(&mut a_updates);
    assert!(late.iter().all(|m| m.id() != "b" || m.status == MemberStatus::Trusted));

    a.membership.stop().await;
    b.membership.stop().await;
}

#[tokio::test]
async fn test_crashed_member_is_expired() {
    let net = Network::new();
    let a = start_node(&net, "a", 4805, &[], fast_config()).await;
    let b = start_node(&net, "b", 4806, &[seed_addr(4805)], fast_config()).await;

    wait_for("cluster to form", Duration::from_secs(2), || {
        a.member_status("b") == Some(MemberStatus::Trusted)
    })
    .await;

    // Crash: the node vanishes without announcing anything and can no
    // longer refute the suspicion that follows.
    b.membership.stop().await;

    let mut a_updates = a.membership.listen_updates();
    a.fd.emit(FdEvent::suspect(b.endpoint.clone()));

    let suspected = next_update_for(&mut a_updates, "b").await;
    assert_eq!(suspected.status, MemberStatus::Suspected);

    wait_for("the suspect window to expire the member", Duration::from_secs(2), || {
        a.membership.member("b").is_none()
    })
    .await;

    // Removal itself is silent: suspected was the last event for the peer.
    let late = drain_updates(&mut a_updates);
    assert!(late.iter().all(|m| m.id() != "b"));

    a.membership.stop().await;
}

#[tokio::test]
async fn test_graceful_leave_is_expired_after_retention() {
    let net = Network::new();
    let a = start_node(&net, "a", 4807, &[], fast_config()).await;
    let b = start_node(&net, "b", 4808, &[seed_addr(4807)], fast_config()).await;

    wait_for("cluster to form", Duration::from_secs(2), || {
        a.member_status("b") == Some(MemberStatus::Trusted)
    })
    .await;

    let mut a_updates = a.membership.listen_updates();
    b.membership.leave().await;
    b.membership.stop().await;

    let departed = next_update_for(&mut a_updates, "b").await;
    assert_eq!(departed.status, MemberStatus::Shutdown);

    wait_for("the retention window to expire the member", Duration::from_secs(2), || {
        a.membership.member("b").is_none()
    })
    .await;

    let late = drain_updates(&mut a_updates);
    assert!(late.iter().all(|m| m.id() != "b"));

    a.membership.stop().await;
}

#[tokio::test]
async fn test_remote_claim_about_self_is_refuted() {
    let net = Network::new();
    let a = start_node(&net, "a", 4809, &[], fast_config()).await;
    let mut tap = net.spread_tap();

    // A third party gossips that `a` is suspected.
    let injector = net.gossip(shoal_core::Endpoint::new("injector", "127.0.0.1", 4999));
    let claim = shoal_cluster::Message::membership(shoal_core::MembershipPayload::new(
        vec![Member::new(a.endpoint.clone(), MemberStatus::Suspected, Default::default())],
        "default",
    ));
    shoal_cluster::GossipProtocol::spread(&*injector, claim).await;

    // The local table never wavers and a trusted record goes back out.
    let refutation = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (from, message) = tap.recv().await.expect("tap should stay open");
            if from != "a" {
                continue;
            }
            if let Some(payload) = message.membership_payload() {
                if let Some(member) = payload.members.iter().find(|m| m.id() == "a") {
                    return member.clone();
                }
            }
        }
    })
    .await
    .expect("a refutation should be gossiped");

    assert_eq!(refutation.status, MemberStatus::Trusted);
    assert_eq!(a.member_status("a"), Some(MemberStatus::Trusted));

    a.membership.stop().await;
}

#[tokio::test]
async fn test_foreign_sync_group_is_invisible() {
    let net = Network::new();
    let a = start_node(&net, "a", 4811, &[], fast_config()).await;

    let other_group = MembershipConfig { sync_group: "other".to_string(), ..fast_config() };
    let c = start_node(&net, "c", 4812, &[seed_addr(4811)], other_group).await;

    // Give periodic rounds a chance to run on both sides.
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(a.membership.member("c").is_none());
    assert!(c.membership.member("a").is_none());
    assert_eq!(a.membership.members().len(), 1);
    assert_eq!(c.membership.members().len(), 1);

    a.membership.stop().await;
    c.membership.stop().await;
}

#[tokio::test]
async fn test_three_nodes_converge_through_one_seed() {
    let net = Network::new();
    let a = start_node(&net, "a", 4813, &[], fast_config()).await;
    let b = start_node(&net, "b", 4814, &[seed_addr(4813)], fast_config()).await;
    let c = start_node(&net, "c", 4815, &[seed_addr(4813)], fast_config()).await;

    let all_trusted = |node: &common::TestNode| {
        ["a", "b", "c"]
            .iter()
            .all(|id| node.member_status(id) == Some(MemberStatus::Trusted))
    };

    wait_for("all nodes to converge on the same member set", Duration::from_secs(3), || {
        all_trusted(&a) && all_trusted(&b) && all_trusted(&c)
    })
    .await;

    a.membership.stop().await;
    b.membership.stop().await;
    c.membership.stop().await;
}

#[tokio::test]
async fn test_local_member_is_never_suspected() {
    let net = Network::new();
    let a = start_node(&net, "a", 4817, &[], fast_config()).await;

    a.fd.emit(FdEvent::suspect(a.endpoint.clone()));
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(a.member_status("a"), Some(MemberStatus::Trusted));

    // And no decay ever follows.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(a.member_status("a"), Some(MemberStatus::Trusted));

    a.membership.stop().await;
}
