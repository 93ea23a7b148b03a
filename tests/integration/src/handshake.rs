//! Cluster membership: meeting nodes, gossip discovery and forgetting.

use crate::helpers::{client_addr, SimCluster};

#[test]
fn meet_one_learn_all() {
    let sim = SimCluster::meshed(4);
    for i in 0..4 {
        let view = sim.view(i);
        for j in 0..4 {
            let node = view.node(&sim.id(j)).expect("every node knows every other");
            assert_eq!(node.addr, Some(client_addr(j)));
            assert!(!node.flags.handshake);
            assert!(!node.flags.noaddr);
        }
    }
    // only node 0 was told about anyone; the rest came from gossip
    assert!(sim.frames_delivered > 0);
}

#[test]
fn meeting_a_known_address_is_idempotent() {
    let mut sim = SimCluster::meshed(2);
    let now = sim.now;
    sim.view_mut(0).meet(client_addr(1), now).unwrap();
    sim.run_for(2_000);
    assert_eq!(sim.view(0).nodes().len(), 2);
    assert_eq!(sim.view(1).nodes().len(), 2);
}

#[test]
fn forgotten_node_stays_out_until_the_denylist_expires() {
    let mut sim = SimCluster::meshed(3);
    let gone = sim.id(2);
    let forgot_at = sim.now;
    sim.view_mut(0).forget(gone, forgot_at).unwrap();
    assert!(sim.view(0).node(&gone).is_none());
    assert!(sim.view(0).is_denylisted(&gone));

    // node 1 keeps gossiping about it, node 0 does not listen
    sim.run_for(30_000);
    assert!(sim.view(0).node(&gone).is_none());

    let relearned = sim.run_until(60_000, |sim| {
        sim.view(0)
            .node(&gone)
            .is_some_and(|n| !n.flags.handshake)
    });
    assert!(relearned);
    assert!(sim.now >= forgot_at + 60_000);
    assert!(!sim.view(0).is_denylisted(&gone));
}
