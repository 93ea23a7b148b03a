//! Failure detection and replica promotion across a simulated cluster.

use cinder_cluster::{ClusterEvent, ClusterHealth, ElectionPhase, ManualFailoverMode};

use crate::helpers::{shard_range, SimCluster};

#[test]
fn replica_takes_over_a_dead_primary() {
    // nodes 0..3 are primaries, node 3 + p replicates primary p
    let mut sim = SimCluster::with_shards(3, 1);
    let dead = 1;
    let heir = 4;
    let dead_id = sim.id(dead);
    let heir_id = sim.id(heir);
    let range = shard_range(dead, 3);
    let old_epoch = sim.view(0).node(&dead_id).unwrap().config_epoch;
    let highest_before = sim
        .alive()
        .flat_map(|i| {
            let view = sim.view(i);
            view.nodes()
                .into_iter()
                .map(|n| n.config_epoch)
                .collect::<Vec<_>>()
        })
        .max()
        .unwrap();
    assert_eq!(sim.view(heir).myself().primary, Some(dead_id));

    sim.kill(dead);

    let promoted = sim.run_until(30_000, |sim| {
        sim.view(heir).election_phase() == ElectionPhase::Elected
            && sim
                .alive()
                .all(|i| sim.view(i).slot_owner(range.start) == Some(heir_id)
                    && sim.view(i).slot_owner(range.end) == Some(heir_id))
    });
    assert!(promoted, "replica was never promoted:\n{}", sim.view(0).cluster_nodes());

    // every survivor agreed the old primary failed before votes were cast
    for i in [0, 2] {
        assert!(sim.view(i).node(&dead_id).unwrap().is_failed());
    }
    let heir_view = sim.view(heir);
    assert!(heir_view.myself().is_primary());
    assert!(heir_view.myself().config_epoch > old_epoch);
    assert!(heir_view.myself().config_epoch > highest_before);
    assert!(sim
        .events(heir)
        .iter()
        .any(|e| matches!(e, ClusterEvent::Promoted { replaced, .. } if *replaced == dead_id)));

    // the cluster serves every slot again
    let healthy = sim.run_until(10_000, |sim| {
        sim.alive().all(|i| sim.view(i).health() == ClusterHealth::Ok)
    });
    assert!(healthy);
}

#[test]
fn lone_failure_report_does_not_fail_a_node() {
    let mut sim = SimCluster::with_shards(3, 0);
    let target = sim.id(2);
    let now = sim.now;

    // one primary's opinion is not a majority
    sim.view_mut(0).mark_suspected(target);
    assert!(sim.view_mut(0).mark_failed(target, now).is_err());

    // and the suspicion is cleared as soon as the node answers
    let cleared = sim.run_until(5_000, |sim| {
        !sim.view(0).node(&target).unwrap().flags.pfail
    });
    assert!(cleared);
    assert!(!sim.view(1).node(&target).unwrap().is_failed());
}

#[test]
fn manual_failover_swaps_roles() {
    let mut sim = SimCluster::with_shards(2, 1);
    // node 2 replicates primary 0
    let old_primary = sim.id(0);
    let replica = sim.id(2);
    let range = shard_range(0, 2);

    let now = sim.now;
    sim.view_mut(2)
        .manual_failover(ManualFailoverMode::Default, now)
        .unwrap();

    let swapped = sim.run_until(15_000, |sim| {
        sim.alive().all(|i| sim.view(i).slot_owner(range.start) == Some(replica))
            && sim.view(0).myself().primary == Some(replica)
    });
    assert!(swapped, "manual failover never completed:\n{}", sim.view(1).cluster_nodes());
    assert!(sim.view(2).myself().is_primary());
    assert!(sim.view(0).myself().is_replica());
    assert!(sim
        .events(0)
        .iter()
        .any(|e| matches!(e, ClusterEvent::ReplicaOf(p) if *p == replica)));
    assert!(!sim.view(0).manual_failover_in_progress());
    assert_eq!(
        sim.view(1).node(&old_primary).unwrap().primary,
        Some(replica)
    );
}

#[test]
fn takeover_needs_no_votes() {
    let mut sim = SimCluster::with_shards(2, 1);
    let replica = sim.id(3);
    let range = shard_range(1, 2);

    // the rest of the cluster is unreachable
    sim.kill(0);
    sim.kill(1);
    let now = sim.now;
    sim.view_mut(3)
        .manual_failover(ManualFailoverMode::Takeover, now)
        .unwrap();
    sim.settle();

    let view = sim.view(3);
    assert!(view.myself().is_primary());
    assert_eq!(view.slot_owner(range.start), Some(replica));
    assert_eq!(view.election_phase(), ElectionPhase::Elected);
}
