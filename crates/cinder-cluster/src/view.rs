//! One node's view of the cluster.
//!
//! A [`ClusterView`] owns everything the coordination loop mutates: the
//! node registry, the slot tables, epochs, election and manual failover
//! bookkeeping. It performs no I/O. Inputs are frames, link events and
//! timer ticks, each stamped with `now` in milliseconds. Outputs are queued
//! as [`Outgoing`] actions and [`ClusterEvent`]s that the caller drains
//! after every step.
//!
//! The operations are spread over several modules, each adding an `impl`
//! block: `registry`, `ownership`, `gossip`, `failover`, `redirect` and
//! `snapshot`.

use std::collections::HashMap;
use std::net::SocketAddr;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use tracing::{debug, info, warn};

use crate::config::{ms, ClusterConfig};
use crate::failover::{Election, ManualFailover};
use crate::keys::SlotKeyIndex;
use crate::message::{Body, Header, ManualFailoverFlags, Message, MessageType};
use crate::node::{ClusterNode, LinkId, NodeFlags, NodeId};
use crate::slots::{SlotTable, SLOT_COUNT};
use crate::time::elapsed;

/// Overall health as computed by this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterHealth {
    Ok,
    Fail,
}

impl std::fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterHealth::Ok => write!(f, "ok"),
            ClusterHealth::Fail => write!(f, "fail"),
        }
    }
}

/// An I/O action requested by the view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Open an outbound bus connection. Frames queued on `link` before the
    /// connection is up must be sent once it is; a failed connect is
    /// reported back through [`ClusterView::link_closed`].
    Connect {
        link: LinkId,
        node: NodeId,
        addr: SocketAddr,
    },
    Send { link: LinkId, message: Message },
    Close { link: LinkId },
}

/// Something the rest of the process may want to react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    NodeFailed(NodeId),
    NodeRecovered(NodeId),
    HealthChanged(ClusterHealth),
    /// This node was promoted to primary.
    Promoted { epoch: u64, replaced: NodeId },
    /// This node now replicates `0`.
    ReplicaOf(NodeId),
    /// Stop accepting writes until `until` (manual failover on a primary).
    PauseWrites { until: u64 },
    ResumeWrites,
    Published { channel: Bytes, message: Bytes },
    /// The slot moved to another node while we still held keys in it.
    /// The keys were dropped from the index and must be deleted from the
    /// store.
    DeleteSlotKeys { slot: u16, keys: Vec<Bytes> },
}

/// Work deferred to [`ClusterView::before_sleep`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Todo {
    pub handle_failover: bool,
    pub update_state: bool,
    pub save_config: bool,
    pub fsync_config: bool,
}

impl Todo {
    pub(crate) fn save(&mut self) {
        self.save_config = true;
    }

    pub(crate) fn save_and_fsync(&mut self) {
        self.save_config = true;
        self.fsync_config = true;
    }

    pub(crate) fn state_changed(&mut self) {
        self.update_state = true;
        self.save_config = true;
    }
}

/// Returned by [`ClusterView::before_sleep`] when the config snapshot must
/// be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveRequest {
    pub fsync: bool,
}

/// Bookkeeping for one bus connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkInfo {
    /// Set for outbound links; inbound links learn nothing about their peer.
    pub node: Option<NodeId>,
    pub created: u64,
}

/// Replication progress of this node, fed by the replication layer.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReplicationState {
    pub offset: u64,
    /// Last time data arrived from our primary.
    pub last_io: u64,
}

/// Bus message counters.
#[derive(Debug, Clone, Default)]
pub struct BusStats {
    pub sent: [u64; MessageType::COUNT],
    pub received: [u64; MessageType::COUNT],
}

impl BusStats {
    pub fn total_sent(&self) -> u64 {
        self.sent.iter().sum()
    }

    pub fn total_received(&self) -> u64 {
        self.received.iter().sum()
    }
}

/// This node's perspective of the whole cluster.
#[derive(Debug)]
pub struct ClusterView {
    pub(crate) config: ClusterConfig,
    pub(crate) myself: NodeId,
    pub(crate) current_epoch: u64,
    pub(crate) last_vote_epoch: u64,
    pub(crate) health: ClusterHealth,
    /// Primaries serving at least one slot.
    pub(crate) size: usize,
    pub(crate) nodes: HashMap<NodeId, ClusterNode>,
    /// Forgotten identities and when they may be re-added.
    pub(crate) denylist: HashMap<NodeId, u64>,
    pub(crate) slots: SlotTable,
    pub(crate) keys: SlotKeyIndex,
    pub(crate) links: HashMap<LinkId, LinkInfo>,
    next_link: u64,
    pub(crate) election: Election,
    pub(crate) manual: ManualFailover,
    pub(crate) replication: ReplicationState,
    pub(crate) todo: Todo,
    pub(crate) stats: BusStats,
    outgoing: Vec<Outgoing>,
    events: Vec<ClusterEvent>,
    pub(crate) rng: StdRng,
    iteration: u64,
    first_call_time: u64,
    among_minority_time: u64,
}

impl ClusterView {
    /// Creates a fresh view: a single primary with a random identity and
    /// no slots, listening for clients on `addr`.
    pub fn new(config: ClusterConfig, addr: SocketAddr, now: u64) -> Self {
        let mut rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let id = NodeId::random(&mut rng);
        let mut view = Self::empty(config, id, rng);
        let mut node = ClusterNode::new(
            id,
            NodeFlags {
                myself: true,
                primary: true,
                ..NodeFlags::default()
            },
            now,
        );
        node.addr = Some(addr);
        view.nodes.insert(id, node);
        info!("no cluster configuration found, my id is {id}");
        view
    }

    /// A view with no nodes at all, `myself` still to be inserted.
    pub(crate) fn empty(config: ClusterConfig, myself: NodeId, rng: StdRng) -> Self {
        Self {
            config,
            myself,
            current_epoch: 0,
            last_vote_epoch: 0,
            health: ClusterHealth::Fail,
            size: 0,
            nodes: HashMap::new(),
            denylist: HashMap::new(),
            slots: SlotTable::new(),
            keys: SlotKeyIndex::new(),
            links: HashMap::new(),
            next_link: 1,
            election: Election::default(),
            manual: ManualFailover::default(),
            replication: ReplicationState::default(),
            todo: Todo::default(),
            stats: BusStats::default(),
            outgoing: Vec::new(),
            events: Vec::new(),
            rng,
            iteration: 0,
            first_call_time: 0,
            among_minority_time: 0,
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn myself_id(&self) -> NodeId {
        self.myself
    }

    /// The local node. Always present.
    pub fn myself(&self) -> &ClusterNode {
        &self.nodes[&self.myself]
    }

    pub(crate) fn myself_mut(&mut self) -> &mut ClusterNode {
        self.nodes
            .get_mut(&self.myself)
            .unwrap_or_else(|| unreachable!("myself is never removed from the registry"))
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn last_vote_epoch(&self) -> u64 {
        self.last_vote_epoch
    }

    pub fn health(&self) -> ClusterHealth {
        self.health
    }

    /// Number of primaries serving at least one slot, as of the last state
    /// update.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slots(&self) -> &SlotTable {
        &self.slots
    }

    pub fn keys(&self) -> &SlotKeyIndex {
        &self.keys
    }

    /// The key index, to be kept in sync by the storage layer.
    pub fn keys_mut(&mut self) -> &mut SlotKeyIndex {
        &mut self.keys
    }

    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    /// Reports replication progress: our offset and the time data last
    /// arrived from our primary. Primaries report their own offset.
    pub fn note_replication(&mut self, offset: u64, now: u64) {
        self.replication.offset = offset;
        self.replication.last_io = now;
    }

    pub fn replication_offset(&self) -> u64 {
        self.replication.offset
    }

    /// Takes the queued I/O actions.
    pub fn drain_outgoing(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outgoing)
    }

    /// Takes the queued events.
    pub fn drain_events(&mut self) -> Vec<ClusterEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn emit(&mut self, event: ClusterEvent) {
        self.events.push(event);
    }

    // -- links --

    /// Registers an inbound connection and returns its handle.
    pub fn accept_link(&mut self, now: u64) -> LinkId {
        self.alloc_link(None, now)
    }

    fn alloc_link(&mut self, node: Option<NodeId>, now: u64) -> LinkId {
        let link = LinkId(self.next_link);
        self.next_link += 1;
        self.links.insert(link, LinkInfo { node, created: now });
        link
    }

    /// The connection behind `link` is gone, or never came up.
    pub fn link_closed(&mut self, link: LinkId) {
        let Some(info) = self.links.remove(&link) else {
            return;
        };
        if let Some(node) = info.node.and_then(|id| self.nodes.get_mut(&id)) {
            if node.link == Some(link) {
                node.link = None;
            }
        }
    }

    /// Drops a link from our side.
    pub(crate) fn close_link(&mut self, link: LinkId) {
        self.link_closed(link);
        self.outgoing.push(Outgoing::Close { link });
    }

    pub(crate) fn link_node(&self, link: LinkId) -> Option<NodeId> {
        self.links.get(&link).and_then(|info| info.node)
    }

    /// Opens the outbound link to `id` and greets it with PING, or MEET if
    /// the node is flagged for it.
    fn connect(&mut self, id: NodeId, now: u64) {
        let port_incr = self.config.port_incr;
        let Some(addr) = self.nodes.get(&id).and_then(|n| n.bus_addr(port_incr)) else {
            return;
        };
        let link = self.alloc_link(Some(id), now);
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.link = Some(link);
        let old_ping_sent = node.ping_sent;
        let meet = node.flags.meet;
        self.outgoing.push(Outgoing::Connect {
            link,
            node: id,
            addr,
        });
        let body = if meet {
            Body::Meet(self.gossip_entries())
        } else {
            Body::Ping(self.gossip_entries())
        };
        self.send_ping(link, body, now);
        if let Some(node) = self.nodes.get_mut(&id) {
            // a fresh connection must not hide an unanswered ping
            if old_ping_sent != 0 {
                node.ping_sent = old_ping_sent;
            }
            node.flags.meet = false;
        }
        debug!("connecting to node {} at {addr}", id.short());
    }

    // -- sending --

    pub(crate) fn build_header(&self) -> Header {
        let me = self.myself();
        let primary = me
            .is_replica()
            .then(|| me.primary.and_then(|p| self.nodes.get(&p)))
            .flatten();
        let source = primary.unwrap_or(me);
        Header {
            current_epoch: self.current_epoch,
            config_epoch: source.config_epoch,
            offset: self.replication.offset,
            sender: me.id,
            slots: source.slots.clone(),
            primary: if me.is_replica() { me.primary } else { None },
            port: me.addr.map_or(0, |a| a.port()),
            flags: me.flags,
            health: self.health,
            mflags: ManualFailoverFlags {
                paused: me.is_primary() && self.manual.end != 0,
                force_ack: false,
            },
        }
    }

    pub(crate) fn push_message(&mut self, link: LinkId, message: Message) {
        self.stats.sent[message.kind() as usize] += 1;
        self.outgoing.push(Outgoing::Send { link, message });
    }

    pub(crate) fn send(&mut self, link: LinkId, body: Body) {
        let message = Message {
            header: self.build_header(),
            body,
        };
        self.push_message(link, message);
    }

    /// Sends a PING / PONG / MEET and stamps `ping_sent` for pings.
    pub(crate) fn send_ping(&mut self, link: LinkId, body: Body, now: u64) {
        if matches!(body, Body::Ping(_)) {
            if let Some(node) = self.link_node(link).and_then(|id| self.nodes.get_mut(&id)) {
                node.ping_sent = now;
            }
        }
        self.send(link, body);
    }

    /// Outbound links of every connected node other than us, in a stable
    /// order.
    pub(crate) fn broadcast_links(&self) -> Vec<LinkId> {
        let mut links: Vec<LinkId> = self
            .nodes
            .values()
            .filter(|n| !n.flags.myself && !n.in_handshake())
            .filter_map(|n| n.link)
            .collect();
        links.sort();
        links
    }

    pub(crate) fn broadcast(&mut self, body: Body) {
        for link in self.broadcast_links() {
            self.send(link, body.clone());
        }
    }

    /// Sends a fresh PONG to every connected node, or only to the other
    /// replicas of our primary.
    pub(crate) fn broadcast_pong(&mut self, siblings_only: bool) {
        let my_primary = self.myself().primary;
        let mut targets: Vec<LinkId> = self
            .nodes
            .values()
            .filter(|n| !n.flags.myself && !n.in_handshake())
            .filter(|n| !siblings_only || (n.is_replica() && n.primary == my_primary))
            .filter_map(|n| n.link)
            .collect();
        targets.sort();
        for link in targets {
            let entries = self.gossip_entries();
            self.send(link, Body::Pong(entries));
        }
    }

    /// Largest config epoch known, or the current epoch if larger.
    pub(crate) fn max_epoch(&self) -> u64 {
        self.nodes
            .values()
            .map(|n| n.config_epoch)
            .fold(self.current_epoch, u64::max)
    }

    /// Gives myself a new config epoch without asking anyone, unless it is
    /// already the unique maximum. Returns true if it changed.
    pub(crate) fn bump_epoch_without_consensus(&mut self) -> bool {
        let max = self.max_epoch();
        let mine = self.myself().config_epoch;
        if mine != 0 && mine == max {
            return false;
        }
        self.current_epoch += 1;
        let epoch = self.current_epoch;
        self.myself_mut().config_epoch = epoch;
        self.todo.save_and_fsync();
        warn!("new config epoch set to {epoch}");
        true
    }

    // -- periodic work --

    /// Timer tick, expected every 100 ms.
    pub fn cron(&mut self, now: u64) {
        self.iteration += 1;
        let node_timeout = self.config.node_timeout_ms();
        let handshake_timeout = self.config.handshake_timeout_ms();

        self.expire_denylist(now);

        // drop stale handshakes, connect everything else without a link
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| !n.flags.myself && !n.flags.noaddr)
            .map(|n| n.id)
            .collect();
        ids.sort();
        for id in &ids {
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            if node.in_handshake() && elapsed(now, node.created) > handshake_timeout {
                debug!("handshake with {} timed out", id.short());
                self.remove_node(*id);
                continue;
            }
            if node.link.is_none() {
                self.connect(*id, now);
            }
        }

        // every 10 ticks ping the node we heard from least recently, out of
        // a few random picks
        if self.iteration % 10 == 0 {
            self.ping_random_node(now);
        }

        let mut orphaned_primaries = 0usize;
        let mut max_replicas = 0usize;
        let mut my_siblings = 0usize;
        let my_primary = self.myself().primary;
        let i_am_replica = self.myself().is_replica();

        ids.retain(|id| self.nodes.contains_key(id));
        for id in ids {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if node.in_handshake() {
                continue;
            }

            if i_am_replica && node.is_primary() && !node.is_failed() {
                let working = self.working_replicas(id);
                if working == 0 && node.slot_count() > 0 && node.flags.migrate_to {
                    orphaned_primaries += 1;
                }
                max_replicas = max_replicas.max(working);
                if my_primary == Some(id) {
                    my_siblings = working;
                }
            }

            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            let (link, ping_sent, pong_received, data_received) = (
                node.link,
                node.ping_sent,
                node.pong_received,
                node.data_received,
            );

            let mut link = link;
            if let Some(current) = link {
                let created = self.links.get(&current).map_or(now, |l| l.created);
                if elapsed(now, created) > node_timeout
                    && ping_sent != 0
                    && elapsed(now, ping_sent) > node_timeout / 2
                    && elapsed(now, data_received) > node_timeout / 2
                {
                    debug!("link to {} looks stuck, reconnecting", id.short());
                    self.close_link(current);
                    link = None;
                }
            }

            if let Some(link) = link {
                if ping_sent == 0 && elapsed(now, pong_received) > node_timeout / 2 {
                    let entries = self.gossip_entries();
                    self.send_ping(link, Body::Ping(entries), now);
                    continue;
                }
                if self.manual.end != 0
                    && self.myself().is_primary()
                    && self.manual.replica == Some(id)
                {
                    let entries = self.gossip_entries();
                    self.send_ping(link, Body::Ping(entries), now);
                    continue;
                }
            }

            if ping_sent == 0 {
                continue;
            }
            if elapsed(now, ping_sent) > node_timeout {
                if let Some(node) = self.nodes.get_mut(&id) {
                    if !node.flags.pfail && !node.flags.fail {
                        debug!("node {} possibly failing", id.short());
                        node.flags.pfail = true;
                        self.todo.update_state = true;
                    }
                }
            }
        }

        self.manual_failover_check_timeout(now);

        if self.myself().is_replica() {
            self.manual_failover_replica_step(now);
            self.handle_replica_failover(now);
            if orphaned_primaries > 0 && max_replicas >= 2 && my_siblings == max_replicas {
                self.handle_replica_migration(max_replicas, now);
            }
        }

        if self.todo.update_state || self.health == ClusterHealth::Fail {
            self.todo.update_state = false;
            self.update_state(now);
        }
    }

    fn ping_random_node(&mut self, now: u64) {
        let candidates: Vec<NodeId> = {
            let mut ids: Vec<NodeId> = self
                .nodes
                .values()
                .filter(|n| {
                    !n.flags.myself && !n.in_handshake() && n.link.is_some() && n.ping_sent == 0
                })
                .map(|n| n.id)
                .collect();
            ids.sort();
            ids.choose_multiple(&mut self.rng, 5).copied().collect()
        };
        let oldest = candidates
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .min_by_key(|n| n.pong_received)
            .and_then(|n| n.link);
        if let Some(link) = oldest {
            let entries = self.gossip_entries();
            self.send_ping(link, Body::Ping(entries), now);
        }
    }

    /// Replicas of `primary` that are neither suspected nor failed.
    pub(crate) fn working_replicas(&self, primary: NodeId) -> usize {
        self.nodes.get(&primary).map_or(0, |p| {
            p.replicas
                .iter()
                .filter_map(|r| self.nodes.get(r))
                .filter(|r| r.is_healthy())
                .count()
        })
    }

    /// Runs the work deferred during the last batch of events. Returns a
    /// request to persist the config when something durable changed.
    pub fn before_sleep(&mut self, now: u64) -> Option<SaveRequest> {
        if std::mem::take(&mut self.todo.handle_failover) {
            self.handle_replica_failover(now);
        }
        if std::mem::take(&mut self.todo.update_state) {
            self.update_state(now);
        }
        let save = std::mem::take(&mut self.todo.save_config);
        let fsync = std::mem::take(&mut self.todo.fsync_config);
        (save || fsync).then_some(SaveRequest { fsync })
    }

    /// Recomputes health and the cluster size.
    pub fn update_state(&mut self, now: u64) {
        if self.first_call_time == 0 {
            self.first_call_time = now;
        }
        // a restarted primary stays down for a moment so it can learn
        // about a newer configuration before it takes writes
        if self.myself().is_primary()
            && self.health == ClusterHealth::Fail
            && elapsed(now, self.first_call_time) < ms(self.config.writable_delay)
        {
            return;
        }

        let mut new_health = ClusterHealth::Ok;

        if self.config.require_full_coverage {
            let uncovered = (0..SLOT_COUNT).any(|slot| match self.slots.owner(slot) {
                None => true,
                Some(owner) => self.nodes.get(&owner).is_none_or(|n| n.is_failed()),
            });
            if uncovered {
                new_health = ClusterHealth::Fail;
            }
        }

        let (size, reachable) = self
            .nodes
            .values()
            .filter(|n| n.is_primary() && n.slot_count() > 0)
            .fold((0usize, 0usize), |(size, reachable), n| {
                (size + 1, reachable + usize::from(n.is_healthy()))
            });
        self.size = size;

        if reachable < self.quorum() {
            new_health = ClusterHealth::Fail;
            self.among_minority_time = now;
        }

        if new_health == self.health {
            return;
        }

        if new_health == ClusterHealth::Ok
            && self.myself().is_primary()
            && elapsed(now, self.among_minority_time) < self.config.rejoin_delay_ms()
        {
            return;
        }

        match new_health {
            ClusterHealth::Ok => info!("cluster state changed: ok"),
            ClusterHealth::Fail => warn!("cluster state changed: fail"),
        }
        self.health = new_health;
        self.emit(ClusterEvent::HealthChanged(new_health));
    }

    /// Votes or failure reports needed for a majority of slot-serving
    /// primaries.
    pub fn quorum(&self) -> usize {
        self.size / 2 + 1
    }

    /// `CLUSTER INFO` style summary.
    pub fn cluster_info(&self) -> String {
        let (mut ok, mut pfail, mut fail) = (0usize, 0usize, 0usize);
        for slot in 0..SLOT_COUNT {
            match self.slots.owner(slot).and_then(|id| self.nodes.get(&id)) {
                Some(n) if n.is_failed() => fail += 1,
                Some(n) if n.is_suspected() => pfail += 1,
                Some(_) => ok += 1,
                None => {}
            }
        }
        format!(
            "cluster_state:{}\r\n\
             cluster_slots_assigned:{}\r\n\
             cluster_slots_ok:{ok}\r\n\
             cluster_slots_pfail:{pfail}\r\n\
             cluster_slots_fail:{fail}\r\n\
             cluster_known_nodes:{}\r\n\
             cluster_size:{}\r\n\
             cluster_current_epoch:{}\r\n\
             cluster_my_epoch:{}\r\n\
             cluster_stats_messages_sent:{}\r\n\
             cluster_stats_messages_received:{}\r\n",
            self.health,
            self.slots.assigned(),
            self.nodes.len(),
            self.size,
            self.current_epoch,
            self.header_config_epoch(),
            self.stats.total_sent(),
            self.stats.total_received(),
        )
    }

    /// Config epoch we advertise: ours, or our primary's for a replica.
    fn header_config_epoch(&self) -> u64 {
        self.build_header().config_epoch
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    pub(crate) const T0: u64 = 1_700_000_000_000;

    pub(crate) fn test_config() -> ClusterConfig {
        ClusterConfig {
            node_timeout: Duration::from_millis(1000),
            writable_delay: Duration::ZERO,
            rng_seed: Some(42),
            ..ClusterConfig::default()
        }
    }

    pub(crate) fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    pub(crate) fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; 20])
    }

    /// A view whose own identity is `id(me)`.
    pub(crate) fn view_as(me: u8) -> ClusterView {
        let mut view = ClusterView::new(test_config(), addr(7000 + u16::from(me)), T0);
        let old = view.myself;
        view.rename_node(old, id(me));
        view
    }

    /// Adds a known, connected-looking primary.
    pub(crate) fn add_primary(view: &mut ClusterView, b: u8) {
        let flags = NodeFlags {
            primary: true,
            ..NodeFlags::default()
        };
        view.upsert(id(b), Some(addr(7000 + u16::from(b))), flags, T0);
    }

    /// Header of a primary `id(sender)` at `epoch` serving `slots`.
    pub(crate) fn primary_header(
        sender: u8,
        epoch: u64,
        slots: &[crate::slots::SlotRange],
    ) -> Header {
        Header {
            current_epoch: epoch,
            config_epoch: epoch,
            offset: 0,
            sender: id(sender),
            slots: crate::slots::SlotBitmap::from_ranges(slots),
            primary: None,
            port: 7000 + u16::from(sender),
            flags: NodeFlags {
                primary: true,
                ..NodeFlags::default()
            },
            health: ClusterHealth::Ok,
            mflags: ManualFailoverFlags::default(),
        }
    }

    #[test]
    fn new_view_is_a_lone_primary() {
        let view = ClusterView::new(test_config(), addr(7000), T0);
        let me = view.myself();
        assert!(me.flags.myself && me.is_primary());
        assert_eq!(me.slot_count(), 0);
        assert_eq!(view.health(), ClusterHealth::Fail);
        assert_eq!(view.current_epoch(), 0);
    }

    #[test]
    fn seeded_views_pick_the_same_identity() {
        let a = ClusterView::new(test_config(), addr(7000), T0);
        let b = ClusterView::new(test_config(), addr(7000), T0);
        assert_eq!(a.myself_id(), b.myself_id());
    }

    #[test]
    fn cron_connects_known_nodes() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.cron(T0 + 100);
        let out = view.drain_outgoing();
        assert!(matches!(
            out[0],
            Outgoing::Connect { node, addr: a, .. } if node == id(2) && a == addr(17002)
        ));
        assert!(matches!(&out[1], Outgoing::Send { message, .. } if message.kind() == MessageType::Ping));
        assert_eq!(view.nodes[&id(2)].ping_sent, T0 + 100);
    }

    #[test]
    fn unanswered_ping_turns_into_pfail() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.cron(T0 + 100);
        view.cron(T0 + 1000);
        assert!(!view.nodes[&id(2)].flags.pfail);
        view.cron(T0 + 1101 + 100);
        assert!(view.nodes[&id(2)].flags.pfail);
    }

    #[test]
    fn failed_connect_keeps_first_ping_time() {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        view.cron(T0 + 100);
        let link = view.nodes[&id(2)].link.unwrap();
        view.link_closed(link);
        assert!(view.nodes[&id(2)].link.is_none());
        view.cron(T0 + 200);
        assert_eq!(view.nodes[&id(2)].ping_sent, T0 + 100);
    }

    #[test]
    fn health_requires_full_coverage() {
        let mut view = view_as(1);
        view.update_state(T0);
        assert_eq!(view.health(), ClusterHealth::Fail);

        view.add_slots(&(0..SLOT_COUNT).collect::<Vec<_>>()).unwrap();
        // still inside the rejoin window opened by the failed check
        view.update_state(T0 + 10);
        assert_eq!(view.health(), ClusterHealth::Fail);
        view.update_state(T0 + 2000);
        assert_eq!(view.health(), ClusterHealth::Ok);
        assert_eq!(view.size(), 1);
        assert!(view
            .drain_events()
            .contains(&ClusterEvent::HealthChanged(ClusterHealth::Ok)));
    }

    #[test]
    fn health_ignores_holes_without_full_coverage() {
        let mut view = view_as(1);
        view.config.require_full_coverage = false;
        view.add_slots(&[0, 1, 2]).unwrap();
        view.update_state(T0);
        assert_eq!(view.health(), ClusterHealth::Ok);
    }

    #[test]
    fn primary_waits_before_becoming_writable() {
        let mut view = view_as(1);
        view.config.writable_delay = Duration::from_millis(2000);
        view.add_slots(&(0..SLOT_COUNT).collect::<Vec<_>>()).unwrap();
        view.update_state(T0);
        assert_eq!(view.health(), ClusterHealth::Fail);
        view.update_state(T0 + 2000);
        assert_eq!(view.health(), ClusterHealth::Ok);
    }

    #[test]
    fn before_sleep_reports_pending_save() {
        let mut view = view_as(1);
        assert_eq!(view.before_sleep(T0), None);
        view.todo.save();
        assert_eq!(view.before_sleep(T0), Some(SaveRequest { fsync: false }));
        view.todo.save_and_fsync();
        assert_eq!(view.before_sleep(T0), Some(SaveRequest { fsync: true }));
        assert_eq!(view.before_sleep(T0), None);
    }

    #[test]
    fn info_reports_counters() {
        let mut view = view_as(1);
        view.add_slots(&[1, 2, 3]).unwrap();
        let info = view.cluster_info();
        assert!(info.contains("cluster_state:fail"));
        assert!(info.contains("cluster_slots_assigned:3"));
        assert!(info.contains("cluster_slots_ok:3"));
        assert!(info.contains("cluster_known_nodes:1"));
        assert!(info.contains("cluster_my_epoch:1"));
    }
}
