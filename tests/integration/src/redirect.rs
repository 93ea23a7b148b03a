//! Client redirection while slots are split and while a slot migrates.

use bytes::Bytes;
use cinder_cluster::{ClusterError, QueryFlags, Redirect};

use crate::helpers::{client_addr, SimCluster};

// "{t10648}" hashes to slot 100, "{t18065}" to 200, "{t9919}" to 500
const IN_100: &str = "{t10648}a";
const IN_200: &str = "{t18065}b";
const PRESENT: &str = "{t9919}here";
const ABSENT: &str = "{t9919}k";

fn asking() -> QueryFlags {
    QueryFlags {
        asking: true,
        ..QueryFlags::default()
    }
}

#[test]
fn keys_in_different_slots_are_refused_everywhere() {
    let sim = SimCluster::with_shards(3, 0);
    for i in sim.alive() {
        let redirect = sim.view(i).route(&[IN_100, IN_200], QueryFlags::default());
        assert_eq!(redirect, Redirect::CrossSlot, "node {i}");
        assert_eq!(
            redirect.to_error().map(|e| e.to_string()),
            Some(ClusterError::CrossSlot.to_string())
        );
    }
}

#[test]
fn split_slots_redirect_to_their_owner() {
    let sim = SimCluster::with_shards(2, 0);
    // slot 100 lives on node 0
    assert_eq!(sim.view(0).route(&[IN_100], QueryFlags::default()), Redirect::None);
    assert_eq!(
        sim.view(1).route(&[IN_100], QueryFlags::default()),
        Redirect::Moved {
            slot: 100,
            addr: client_addr(0)
        }
    );
    let err = sim.view(1).route_slot(100, QueryFlags::default()).to_error().unwrap();
    assert_eq!(err.to_string(), "MOVED 100 127.0.0.1:7000");
}

#[test]
fn migrating_slot_asks_for_missing_keys() {
    let mut sim = SimCluster::with_shards(2, 0);
    let source = sim.id(0);
    let target = sim.id(1);

    sim.view_mut(0).start_migrating_to(500, target).unwrap();
    sim.view_mut(1).start_importing_from(500, source).unwrap();
    sim.view_mut(0).keys_mut().insert(Bytes::from(PRESENT));

    // the source serves what it still has and sends the rest over
    let source_view = sim.view(0);
    assert_eq!(source_view.route(&[PRESENT], QueryFlags::default()), Redirect::None);
    assert_eq!(
        source_view.route(&[ABSENT], QueryFlags::default()),
        Redirect::Ask {
            slot: 500,
            addr: client_addr(1)
        }
    );
    assert_eq!(
        source_view.route(&[PRESENT, ABSENT], QueryFlags::default()),
        Redirect::TryAgain
    );

    // the target only serves clients that asked
    let target_view = sim.view(1);
    assert_eq!(target_view.route(&[ABSENT], asking()), Redirect::None);
    assert_eq!(
        target_view.route(&[ABSENT], QueryFlags::default()),
        Redirect::Moved {
            slot: 500,
            addr: client_addr(0)
        }
    );
}

#[test]
fn finished_migration_propagates() {
    let mut sim = SimCluster::with_shards(2, 0);
    let source = sim.id(0);
    let target = sim.id(1);

    sim.view_mut(0).start_migrating_to(500, target).unwrap();
    sim.view_mut(1).start_importing_from(500, source).unwrap();
    sim.view_mut(0).keys_mut().insert(Bytes::from(PRESENT));

    // a slot with keys left in it cannot be handed over
    assert!(matches!(
        sim.view_mut(0).set_slot_node(500, target),
        Err(ClusterError::KeysInSlot { slot: 500, keys: 1 })
    ));

    // move the key, then close both sides
    sim.view_mut(0).keys_mut().remove(PRESENT.as_bytes());
    sim.view_mut(1).keys_mut().insert(Bytes::from(PRESENT));
    sim.view_mut(1).set_slot_node(500, target).unwrap();
    sim.view_mut(0).set_slot_node(500, target).unwrap();

    let moved = sim.run_until(10_000, |sim| {
        sim.alive().all(|i| sim.view(i).slot_owner(500) == Some(target))
    });
    assert!(moved);

    let source_view = sim.view(0);
    assert!(source_view.slots().migrating_to(500).is_none());
    assert!(sim.view(1).slots().importing_from(500).is_none());
    assert!(
        sim.view(1).myself().config_epoch > source_view.node(&source).unwrap().config_epoch
    );
    assert_eq!(
        source_view.route(&[PRESENT], QueryFlags::default()),
        Redirect::Moved {
            slot: 500,
            addr: client_addr(1)
        }
    );
    assert_eq!(sim.view(1).route(&[PRESENT], QueryFlags::default()), Redirect::None);
    // neighbours of slot 500 stayed put
    assert_eq!(sim.view(1).slot_owner(499), Some(source));
    assert_eq!(sim.view(1).slot_owner(501), Some(source));
}
