//! Slot ownership: assignment rules, administrative slot commands and the
//! reconciliation of ownership claims heard on the bus.
//!
//! A slot only ever moves to a claimant whose config epoch is strictly
//! greater than the current owner's. The administrative commands are the
//! exception: they state the operator's intent and bump the local config
//! epoch so the rest of the cluster accepts the result.

use tracing::{info, warn};

use crate::error::ClusterError;
use crate::node::NodeId;
use crate::slots::{check_slot, SlotBitmap, SLOT_COUNT};
use crate::view::{ClusterEvent, ClusterView};

impl ClusterView {
    /// Owner of `slot`, if any.
    pub fn slot_owner(&self, slot: u16) -> Option<NodeId> {
        self.slots.owner(slot)
    }

    /// Fraction of the slot space that has an owner.
    pub fn coverage(&self) -> f64 {
        self.slots.assigned() as f64 / f64::from(SLOT_COUNT)
    }

    /// Gives `slot` to `node` at `epoch`. Only primaries can own slots.
    ///
    /// Taking a slot from another node requires an epoch strictly greater
    /// than that node's config epoch. The node's config epoch is raised to
    /// `epoch` if lower.
    pub fn assign_slot(&mut self, slot: u16, node: NodeId, epoch: u64) -> Result<(), ClusterError> {
        check_slot(slot)?;
        let claimant = self.nodes.get(&node).ok_or(ClusterError::UnknownNode(node))?;
        if !claimant.is_primary() {
            return Err(ClusterError::WrongRole {
                role: if claimant.is_replica() { "replica" } else { "role-less" },
            });
        }
        let claimant_epoch = claimant.config_epoch;
        match self.slots.owner(slot) {
            Some(owner) if owner != node => {
                let current = self.nodes.get(&owner).map_or(0, |n| n.config_epoch);
                if epoch <= current {
                    return Err(ClusterError::StaleClaim {
                        slot,
                        epoch,
                        current,
                    });
                }
            }
            Some(_) if epoch < claimant_epoch => {
                return Err(ClusterError::StaleClaim {
                    slot,
                    epoch,
                    current: claimant_epoch,
                });
            }
            _ => {}
        }
        self.claim_slot(slot, node);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.config_epoch = n.config_epoch.max(epoch);
        }
        self.current_epoch = self.current_epoch.max(epoch);
        self.todo.state_changed();
        Ok(())
    }

    /// Moves `slot` to `node` unconditionally.
    pub(crate) fn claim_slot(&mut self, slot: u16, node: NodeId) {
        self.unclaim_slot(slot);
        if let Some(n) = self.nodes.get_mut(&node) {
            n.slots.set(slot);
            self.slots.set_owner(slot, Some(node));
        }
    }

    pub(crate) fn unclaim_slot(&mut self, slot: u16) {
        if let Some(owner) = self.slots.owner(slot) {
            if let Some(n) = self.nodes.get_mut(&owner) {
                n.slots.clear(slot);
            }
            self.slots.set_owner(slot, None);
        }
    }

    /// `CLUSTER ADDSLOTS`: all slots must be free. Bumps my config epoch so
    /// the claim wins everywhere.
    pub fn add_slots(&mut self, slots: &[u16]) -> Result<(), ClusterError> {
        for &slot in slots {
            check_slot(slot)?;
            if self.slots.owner(slot).is_some() {
                return Err(ClusterError::SlotBusy(slot));
            }
        }
        let me = self.myself;
        for &slot in slots {
            if self.slots.importing_from(slot).is_some() {
                self.slots.set_importing(slot, None);
            }
            self.claim_slot(slot, me);
        }
        self.bump_epoch_without_consensus();
        self.todo.state_changed();
        Ok(())
    }

    /// `CLUSTER DELSLOTS`: all slots must have an owner.
    pub fn del_slots(&mut self, slots: &[u16]) -> Result<(), ClusterError> {
        for &slot in slots {
            check_slot(slot)?;
            if self.slots.owner(slot).is_none() {
                return Err(ClusterError::SlotUnassigned(slot));
            }
        }
        for &slot in slots {
            self.unclaim_slot(slot);
        }
        self.todo.state_changed();
        Ok(())
    }

    /// `CLUSTER SETSLOT <slot> MIGRATING <node>`.
    pub fn start_migrating_to(&mut self, slot: u16, target: NodeId) -> Result<(), ClusterError> {
        check_slot(slot)?;
        if self.slots.owner(slot) != Some(self.myself) {
            return Err(ClusterError::NotOwner(slot));
        }
        self.check_peer(target, "migrate to")?;
        self.slots.set_migrating(slot, Some(target));
        self.todo.save();
        Ok(())
    }

    /// `CLUSTER SETSLOT <slot> IMPORTING <node>`.
    pub fn start_importing_from(&mut self, slot: u16, source: NodeId) -> Result<(), ClusterError> {
        check_slot(slot)?;
        if self.slots.owner(slot) == Some(self.myself) {
            return Err(ClusterError::AlreadyOwner(slot));
        }
        self.check_peer(source, "import from")?;
        self.slots.set_importing(slot, Some(source));
        self.todo.save();
        Ok(())
    }

    fn check_peer(&self, id: NodeId, action: &'static str) -> Result<(), ClusterError> {
        if id == self.myself {
            return Err(ClusterError::TargetIsMyself { action });
        }
        let node = self.nodes.get(&id).ok_or(ClusterError::UnknownNode(id))?;
        if node.is_replica() {
            return Err(ClusterError::WrongRole { role: "replica" });
        }
        Ok(())
    }

    /// `CLUSTER SETSLOT <slot> STABLE`.
    pub fn clear_migration_state(&mut self, slot: u16) -> Result<(), ClusterError> {
        check_slot(slot)?;
        self.slots.set_migrating(slot, None);
        self.slots.set_importing(slot, None);
        self.todo.save();
        Ok(())
    }

    /// `CLUSTER SETSLOT <slot> NODE <node>`: final step of a migration.
    ///
    /// The importing side takes the slot under a fresh config epoch so the
    /// new ownership propagates without an election.
    pub fn set_slot_node(&mut self, slot: u16, node: NodeId) -> Result<(), ClusterError> {
        check_slot(slot)?;
        if !self.nodes.contains_key(&node) {
            return Err(ClusterError::UnknownNode(node));
        }
        if self.nodes.get(&node).is_some_and(|n| n.is_replica()) {
            return Err(ClusterError::WrongRole { role: "replica" });
        }
        let me = self.myself;
        let keys = self.keys.count_in_slot(slot);
        if self.slots.owner(slot) == Some(me) && node != me && keys > 0 {
            return Err(ClusterError::KeysInSlot { slot, keys });
        }
        if keys == 0 && self.slots.migrating_to(slot).is_some() {
            self.slots.set_migrating(slot, None);
        }
        if node == me && self.slots.importing_from(slot).is_some() {
            if self.bump_epoch_without_consensus() {
                info!("configEpoch updated after importing slot {slot}");
            }
            self.slots.set_importing(slot, None);
        }
        self.claim_slot(slot, node);
        self.todo.state_changed();
        Ok(())
    }

    /// Applies an ownership claim heard from `sender` (a primary) at
    /// `epoch`.
    ///
    /// Every claimed slot that is unowned or owned at a lower epoch moves to
    /// the sender, except slots we are importing. Losing the last slot of
    /// our own shard to the sender makes us its replica. Keys left behind in
    /// slots taken from us are dropped.
    pub(crate) fn update_slots_from_claim(
        &mut self,
        sender: NodeId,
        epoch: u64,
        claimed: &SlotBitmap,
        now: u64,
    ) {
        let me = self.myself;
        if sender == me {
            return;
        }
        let shard = if self.myself().is_primary() {
            Some(me)
        } else {
            self.myself().primary
        };
        let mut new_primary = None;
        let mut dirty = Vec::new();

        for slot in claimed.iter() {
            let owner = self.slots.owner(slot);
            if owner == Some(sender) || self.slots.importing_from(slot).is_some() {
                continue;
            }
            let owner_epoch = owner.and_then(|o| self.nodes.get(&o)).map(|n| n.config_epoch);
            if owner_epoch.is_some_and(|e| e >= epoch) {
                continue;
            }
            if owner == Some(me) && self.keys.count_in_slot(slot) > 0 {
                dirty.push(slot);
            }
            if owner.is_some() && owner == shard {
                new_primary = Some(sender);
            }
            self.claim_slot(slot, sender);
            self.todo.state_changed();
            self.todo.fsync_config = true;
        }

        let shard_emptied = shard
            .and_then(|s| self.nodes.get(&s))
            .is_some_and(|n| n.slot_count() == 0);
        if let Some(primary) = new_primary.filter(|_| shard_emptied) {
            warn!(
                "configuration change detected: reconfiguring myself as a replica of {}",
                primary.short()
            );
            self.become_replica_of(primary, now);
        } else {
            for slot in dirty {
                let keys = self.keys.drain_slot(slot);
                warn!("dropping {} keys of slot {slot} now owned by {}", keys.len(), sender.short());
                self.emit(ClusterEvent::DeleteSlotKeys { slot, keys });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeFlags;
    use crate::slots::SlotRange;
    use crate::view::tests::{add_primary, addr, id, view_as, T0};
    use bytes::Bytes;

    #[test]
    fn assign_respects_epochs() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        add_primary(&mut view, 3);

        view.assign_slot(42, id(2), 5).unwrap();
        assert_eq!(
            view.assign_slot(42, id(3), 5),
            Err(ClusterError::StaleClaim {
                slot: 42,
                epoch: 5,
                current: 5
            })
        );
        view.assign_slot(42, id(3), 7).unwrap();
        assert_eq!(view.slot_owner(42), Some(id(3)));
        assert!(!view.node(&id(2)).unwrap().slots.test(42));
        assert_eq!(view.node(&id(3)).unwrap().config_epoch, 7);
        assert_eq!(view.current_epoch(), 7);

        assert!(matches!(
            view.assign_slot(42, id(2), 6),
            Err(ClusterError::StaleClaim { .. })
        ));
        assert_eq!(view.assign_slot(16384, id(2), 9), Err(ClusterError::SlotOutOfRange(16384)));
        assert_eq!(view.assign_slot(1, id(9), 9), Err(ClusterError::UnknownNode(id(9))));
    }

    #[test]
    fn only_primaries_own_slots() {
        let mut view = view_as(1);
        let replica = NodeFlags {
            replica: true,
            ..NodeFlags::default()
        };
        view.upsert(id(2), Some(addr(7002)), replica, T0);
        view.upsert(id(3), Some(addr(7003)), NodeFlags::default(), T0);

        assert_eq!(
            view.assign_slot(42, id(2), 5),
            Err(ClusterError::WrongRole { role: "replica" })
        );
        assert!(matches!(
            view.assign_slot(42, id(3), 5),
            Err(ClusterError::WrongRole { .. })
        ));
        assert_eq!(view.slot_owner(42), None);
        assert_eq!(view.node(&id(2)).unwrap().slot_count(), 0);
    }

    #[test]
    fn add_and_del_slots() {
        let mut view = view_as(1);
        view.add_slots(&[1, 2, 3]).unwrap();
        assert_eq!(view.myself().slot_count(), 3);
        assert_eq!(view.myself().config_epoch, 1);
        assert_eq!(view.add_slots(&[3, 4]), Err(ClusterError::SlotBusy(3)));
        assert_eq!(view.slot_owner(4), None);

        view.del_slots(&[1]).unwrap();
        assert_eq!(view.del_slots(&[1]), Err(ClusterError::SlotUnassigned(1)));
        assert_eq!(view.myself().slots.ranges(), vec![SlotRange { start: 2, end: 3 }]);
        assert!((view.coverage() - 2.0 / 16384.0).abs() < f64::EPSILON);
    }

    #[test]
    fn migration_overlays() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.add_slots(&[500]).unwrap();
        view.assign_slot(600, id(2), 1).unwrap();

        assert_eq!(view.start_migrating_to(600, id(2)), Err(ClusterError::NotOwner(600)));
        assert_eq!(
            view.start_migrating_to(500, id(1)),
            Err(ClusterError::TargetIsMyself { action: "migrate to" })
        );
        view.start_migrating_to(500, id(2)).unwrap();
        assert_eq!(view.slots().migrating_to(500), Some(id(2)));

        assert_eq!(view.start_importing_from(500, id(2)), Err(ClusterError::AlreadyOwner(500)));
        view.start_importing_from(600, id(2)).unwrap();
        assert_eq!(view.slots().importing_from(600), Some(id(2)));

        view.clear_migration_state(500).unwrap();
        assert_eq!(view.slots().migrating_to(500), None);
    }

    #[test]
    fn set_slot_node_refuses_while_keys_remain() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.add_slots(&[500]).unwrap();
        view.start_migrating_to(500, id(2)).unwrap();
        view.keys_mut().insert(Bytes::from_static(b"{t9919}k"));

        assert_eq!(
            view.set_slot_node(500, id(2)),
            Err(ClusterError::KeysInSlot { slot: 500, keys: 1 })
        );
        view.keys_mut().remove(b"{t9919}k");
        view.set_slot_node(500, id(2)).unwrap();
        assert_eq!(view.slot_owner(500), Some(id(2)));
        assert_eq!(view.slots().migrating_to(500), None);
    }

    #[test]
    fn finishing_an_import_bumps_my_epoch() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.assign_slot(500, id(2), 3).unwrap();
        view.start_importing_from(500, id(2)).unwrap();

        view.set_slot_node(500, id(1)).unwrap();
        assert_eq!(view.slot_owner(500), Some(id(1)));
        assert_eq!(view.slots().importing_from(500), None);
        assert_eq!(view.myself().config_epoch, 4);
        assert!(view.myself().config_epoch > view.node(&id(2)).unwrap().config_epoch);
    }

    #[test]
    fn claims_only_win_with_higher_epoch() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        add_primary(&mut view, 3);
        view.assign_slot(42, id(2), 7).unwrap();

        let claim = SlotBitmap::from_ranges(&[SlotRange::single(42)]);
        view.update_slots_from_claim(id(3), 5, &claim, T0);
        assert_eq!(view.slot_owner(42), Some(id(2)));

        view.update_slots_from_claim(id(3), 8, &claim, T0);
        assert_eq!(view.slot_owner(42), Some(id(3)));
    }

    #[test]
    fn importing_slots_ignore_claims() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        add_primary(&mut view, 3);
        view.assign_slot(42, id(2), 1).unwrap();
        view.start_importing_from(42, id(2)).unwrap();

        let claim = SlotBitmap::from_ranges(&[SlotRange::single(42)]);
        view.update_slots_from_claim(id(3), 9, &claim, T0);
        assert_eq!(view.slot_owner(42), Some(id(2)));
    }

    #[test]
    fn losing_some_slots_drops_their_keys() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.add_slots(&[500, 501]).unwrap();
        view.keys_mut().insert(Bytes::from_static(b"{t9919}k"));

        let claim = SlotBitmap::from_ranges(&[SlotRange::single(500)]);
        view.update_slots_from_claim(id(2), 10, &claim, T0);
        assert_eq!(view.slot_owner(500), Some(id(2)));
        assert!(view.keys().is_empty());
        assert!(view.myself().is_primary());
        assert!(view.drain_events().iter().any(|e| matches!(
            e,
            ClusterEvent::DeleteSlotKeys { slot: 500, keys } if keys.len() == 1
        )));
    }

    #[test]
    fn losing_every_slot_turns_me_into_a_replica() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.add_slots(&[500, 501]).unwrap();

        let claim = SlotBitmap::from_ranges(&[SlotRange { start: 500, end: 501 }]);
        view.update_slots_from_claim(id(2), 10, &claim, T0);
        assert!(view.myself().is_replica());
        assert_eq!(view.myself().primary, Some(id(2)));
        assert!(view.drain_events().contains(&ClusterEvent::ReplicaOf(id(2))));
    }
}
