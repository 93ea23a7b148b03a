//! Conflicting slot claims settle on the claim with the highest epoch.

use cinder_cluster::{ClusterError, ClusterHealth};

use crate::helpers::SimCluster;

#[test]
fn higher_epoch_claim_wins() {
    let mut sim = SimCluster::meshed(2);
    let (a, b) = (sim.id(0), sim.id(1));

    sim.view_mut(0).assign_slot(42, a, 5).unwrap();
    sim.view_mut(1).assign_slot(42, b, 7).unwrap();

    let agreed = sim.run_until(10_000, |sim| {
        sim.alive().all(|i| sim.view(i).slot_owner(42) == Some(b))
    });
    assert!(agreed, "{}", sim.view(0).cluster_nodes());
    assert_eq!(sim.view(0).node(&b).unwrap().config_epoch, 7);
    assert!(sim.view(0).current_epoch() >= 7);
}

#[test]
fn claim_order_does_not_matter() {
    let mut sim = SimCluster::meshed(2);
    let (a, b) = (sim.id(0), sim.id(1));

    sim.view_mut(1).assign_slot(42, b, 5).unwrap();
    sim.settle();
    sim.view_mut(0).assign_slot(42, a, 7).unwrap();

    let agreed = sim.run_until(10_000, |sim| {
        sim.alive().all(|i| sim.view(i).slot_owner(42) == Some(a))
    });
    assert!(agreed, "{}", sim.view(1).cluster_nodes());
}

#[test]
fn stale_claims_are_refused_locally() {
    let mut sim = SimCluster::meshed(2);
    let (a, b) = (sim.id(0), sim.id(1));

    sim.view_mut(0).assign_slot(42, a, 5).unwrap();
    let err = sim.view_mut(0).assign_slot(42, b, 5).unwrap_err();
    assert!(matches!(
        err,
        ClusterError::StaleClaim {
            slot: 42,
            epoch: 5,
            current: 5
        }
    ));
    assert_eq!(sim.view(0).slot_owner(42), Some(a));
}

#[test]
fn every_node_learns_the_full_slot_map() {
    let sim = SimCluster::with_shards(4, 1);
    let reference = sim.view(0).slots().clone();
    for i in sim.alive() {
        let view = sim.view(i);
        assert_eq!(view.health(), ClusterHealth::Ok);
        assert_eq!(view.slots().assigned(), 16384);
        for slot in (0..16384).step_by(97) {
            assert_eq!(view.slot_owner(slot), reference.owner(slot), "slot {slot} on node {i}");
        }
        assert_eq!(view.size(), 4);
    }
}
