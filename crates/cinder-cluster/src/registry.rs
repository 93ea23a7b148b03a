//! Node registry: membership, roles and failure detection state.

use std::net::SocketAddr;

use tracing::{debug, info, warn};

use crate::error::ClusterError;
use crate::message::Body;
use crate::node::{ClusterNode, NodeFlags, NodeId};
use crate::time::elapsed;
use crate::view::{ClusterEvent, ClusterView};

impl ClusterView {
    pub fn node(&self, id: &NodeId) -> Option<&ClusterNode> {
        self.nodes.get(id)
    }

    /// All known nodes, including myself and handshakes, in id order.
    pub fn nodes(&self) -> Vec<&ClusterNode> {
        let mut nodes: Vec<&ClusterNode> = self.nodes.values().collect();
        nodes.sort_by_key(|n| n.id);
        nodes
    }

    /// Adds a node or refreshes a known one. For a known node the address
    /// and the role bits of `flags` are merged in; liveness bits stay local.
    /// Returns true if the node was new.
    pub fn upsert(
        &mut self,
        id: NodeId,
        addr: Option<SocketAddr>,
        flags: NodeFlags,
        now: u64,
    ) -> bool {
        if let Some(node) = self.nodes.get_mut(&id) {
            let mut changed = false;
            if let Some(addr) = addr {
                changed |= node.addr != Some(addr) || node.flags.noaddr;
                node.addr = Some(addr);
                node.flags.noaddr = false;
            }
            let role_given = flags.primary || flags.replica;
            if role_given && !node.flags.myself {
                let before = (node.flags.primary, node.flags.replica, node.flags.migrate_to);
                node.flags.primary = flags.primary;
                node.flags.replica = flags.replica;
                node.flags.migrate_to = flags.migrate_to && flags.primary;
                changed |= before != (node.flags.primary, node.flags.replica, node.flags.migrate_to);
                if node.flags.primary {
                    if let Some(old) = node.primary.take() {
                        if let Some(old) = self.nodes.get_mut(&old) {
                            old.replicas.retain(|r| *r != id);
                        }
                        changed = true;
                    }
                }
            }
            if changed {
                self.todo.save();
            }
            return false;
        }
        let mut node = ClusterNode::new(id, flags, now);
        node.addr = addr;
        node.flags.noaddr = addr.is_none();
        node.flags.myself = false;
        self.nodes.insert(id, node);
        self.todo.save();
        true
    }

    /// `CLUSTER MEET`: starts a handshake with whatever node listens at
    /// `addr`.
    pub fn meet(&mut self, addr: SocketAddr, now: u64) -> Result<(), ClusterError> {
        if addr.port().checked_add(self.config.port_incr).is_none() {
            return Err(ClusterError::Configuration(format!(
                "invalid node address {addr}"
            )));
        }
        self.start_handshake(addr, true, now);
        Ok(())
    }

    /// Creates a placeholder node for `addr` that will be renamed once the
    /// peer answers, greeting it with MEET if `meet` is set. Returns false
    /// if a handshake with that address is already running.
    pub(crate) fn start_handshake(&mut self, addr: SocketAddr, meet: bool, now: u64) -> bool {
        let busy = self
            .nodes
            .values()
            .any(|n| n.in_handshake() && n.addr == Some(addr));
        if busy {
            return false;
        }
        let id = NodeId::random(&mut self.rng);
        let mut node = ClusterNode::new(
            id,
            NodeFlags {
                handshake: true,
                meet,
                ..NodeFlags::default()
            },
            now,
        );
        node.addr = Some(addr);
        self.nodes.insert(id, node);
        debug!("starting handshake with {addr}");
        true
    }

    /// Re-keys a node under its real identity.
    pub(crate) fn rename_node(&mut self, old: NodeId, new: NodeId) {
        let Some(mut node) = self.nodes.remove(&old) else {
            return;
        };
        debug!("renaming node {} into {}", old.short(), new.short());
        node.id = new;
        if let Some(link) = node.link {
            if let Some(info) = self.links.get_mut(&link) {
                info.node = Some(new);
            }
        }
        for slot in node.slots.iter() {
            self.slots.set_owner(slot, Some(new));
        }
        for other in self.nodes.values_mut() {
            if other.primary == Some(old) {
                other.primary = Some(new);
            }
            for replica in other.replicas.iter_mut().filter(|r| **r == old) {
                *replica = new;
            }
        }
        if self.myself == old {
            self.myself = new;
        }
        self.nodes.insert(new, node);
        self.todo.save();
    }

    /// Drops a node and every reference to it.
    pub(crate) fn remove_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        for slot in node.slots.iter() {
            if self.slots.owner(slot) == Some(id) {
                self.slots.set_owner(slot, None);
            }
        }
        self.slots.forget_overlays(id);
        if let Some(primary) = node.primary.and_then(|p| self.nodes.get_mut(&p)) {
            primary.replicas.retain(|r| *r != id);
        }
        for other in self.nodes.values_mut() {
            if other.primary == Some(id) {
                other.primary = None;
            }
            other.remove_fail_report(id);
        }
        if let Some(link) = node.link {
            self.close_link(link);
        }
        self.todo.state_changed();
    }

    /// `CLUSTER FORGET`: removes a node and refuses to re-learn it from
    /// gossip for a while.
    pub fn forget(&mut self, id: NodeId, now: u64) -> Result<(), ClusterError> {
        if id == self.myself {
            return Err(ClusterError::ForgetMyself);
        }
        if self.myself().primary == Some(id) && self.myself().is_replica() {
            return Err(ClusterError::ForgetMyPrimary);
        }
        let node = self.nodes.get(&id).ok_or(ClusterError::UnknownNode(id))?;
        if node.slot_count() > 0 {
            return Err(ClusterError::NodeOwnsSlots(id));
        }
        let ttl = crate::config::ms(self.config.denylist_ttl);
        self.denylist.insert(id, now + ttl);
        self.remove_node(id);
        self.todo.save_and_fsync();
        info!("forgot node {}", id.short());
        Ok(())
    }

    pub fn is_denylisted(&self, id: &NodeId) -> bool {
        self.denylist.contains_key(id)
    }

    pub(crate) fn expire_denylist(&mut self, now: u64) {
        self.denylist.retain(|_, until| *until > now);
    }

    /// Flags a node as possibly failing. Returns false if it already was
    /// suspected or failed.
    pub fn mark_suspected(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if node.flags.myself || !node.is_healthy() {
            return false;
        }
        node.flags.pfail = true;
        self.todo.update_state = true;
        true
    }

    pub fn clear_suspected(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            if node.flags.pfail {
                node.flags.pfail = false;
                self.todo.update_state = true;
            }
        }
    }

    /// Promotes a suspected node to failed if enough primaries agree, and
    /// tells everybody.
    pub fn mark_failed(&mut self, id: NodeId, now: u64) -> Result<(), ClusterError> {
        if self.mark_failed_if_needed(id, now) {
            Ok(())
        } else {
            Err(ClusterError::NoFailureQuorum(id))
        }
    }

    /// Marks a node failed without waiting for failure reports, and tells
    /// everybody. A node that is already failed is left alone.
    pub fn mark_failed_forced(&mut self, id: NodeId, now: u64) -> Result<(), ClusterError> {
        let node = self.nodes.get(&id).ok_or(ClusterError::UnknownNode(id))?;
        if node.flags.myself {
            return Err(ClusterError::TargetIsMyself { action: "fail" });
        }
        if node.flags.fail {
            return Ok(());
        }
        warn!("marking node {} as failing (forced)", id.short());
        self.force_fail(id, now);
        self.broadcast(Body::Fail { node: id });
        Ok(())
    }

    pub(crate) fn mark_failed_if_needed(&mut self, id: NodeId, now: u64) -> bool {
        let needed = self.quorum();
        let validity = self.config.fail_report_validity_ms();
        let i_am_primary = self.myself().is_primary();
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if !node.flags.pfail || node.flags.fail {
            return false;
        }
        let failures = node.valid_fail_reports(validity, now) + usize::from(i_am_primary);
        if failures < needed {
            return false;
        }
        node.flags.pfail = false;
        node.flags.fail = true;
        node.fail_time = now;
        warn!("marking node {} as failing (quorum reached)", id.short());
        self.emit(ClusterEvent::NodeFailed(id));
        self.broadcast(Body::Fail { node: id });
        self.todo.state_changed();
        self.failover_if_my_primary(id);
        true
    }

    /// Marks a node failed on someone else's word.
    pub(crate) fn force_fail(&mut self, id: NodeId, now: u64) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.flags.fail || node.flags.myself {
            return;
        }
        node.flags.fail = true;
        node.flags.pfail = false;
        node.fail_time = now;
        info!("FAIL message received about {}", id.short());
        self.emit(ClusterEvent::NodeFailed(id));
        self.todo.state_changed();
        self.failover_if_my_primary(id);
    }

    /// Schedules an election check when `failed` is the primary we replicate.
    fn failover_if_my_primary(&mut self, failed: NodeId) {
        let me = self.myself();
        if me.is_replica() && me.primary == Some(failed) {
            self.todo.handle_failover = true;
        }
    }

    /// Clears FAIL on a node that is reachable again. Replicas and primaries
    /// without slots recover at once; a primary with slots only after it
    /// stayed failed long enough for a replica to take over.
    pub(crate) fn clear_failure_if_needed(&mut self, id: NodeId, now: u64) {
        let undo = self.config.node_timeout_ms() * u64::from(self.config.fail_undo_time_mult);
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if !node.flags.fail {
            return;
        }
        let serving = node.is_primary() && node.slot_count() > 0;
        if serving && elapsed(now, node.fail_time) <= undo {
            return;
        }
        node.flags.fail = false;
        info!("clear FAIL state for node {}: it is reachable again", id.short());
        self.emit(ClusterEvent::NodeRecovered(id));
        self.todo.state_changed();
    }

    /// Turns `id` into a primary, detaching it from its old primary.
    pub(crate) fn set_node_as_primary(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.is_primary() && node.primary.is_none() {
            return;
        }
        let old = node.primary.take();
        node.set_role_primary();
        if let Some(primary) = old.and_then(|p| self.nodes.get_mut(&p)) {
            primary.replicas.retain(|r| *r != id);
        }
        self.todo.state_changed();
    }

    /// Records that `replica` follows `primary`. The primary may be unknown
    /// locally; the link is then kept on the replica side only.
    pub(crate) fn set_primary(&mut self, replica: NodeId, primary: NodeId) {
        let Some(node) = self.nodes.get_mut(&replica) else {
            return;
        };
        let old = node.primary;
        if old == Some(primary) && node.is_replica() {
            return;
        }
        node.set_role_replica();
        node.primary = Some(primary);
        if let Some(old) = old.and_then(|p| self.nodes.get_mut(&p)) {
            old.replicas.retain(|r| *r != replica);
        }
        if let Some(primary) = self.nodes.get_mut(&primary) {
            if !primary.replicas.contains(&replica) {
                primary.replicas.push(replica);
            }
            primary.flags.migrate_to = true;
        }
        self.todo.save();
    }
}
