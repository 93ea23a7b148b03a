//! In-memory cluster harness.
//!
//! `SimCluster` runs several `ClusterView`s against a fake clock and routes
//! their bus traffic through an in-memory network. Every frame goes through
//! the real codec: it is encoded, length-checked and decoded before it is
//! handed to the receiving view.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use cinder_cluster::{
    frame_length, ClusterConfig, ClusterEvent, ClusterHealth, ClusterView, LinkId, Message,
    NodeId, Outgoing, SlotRange, PREFIX_LEN, SLOT_COUNT,
};

/// Fake wall clock start, in milliseconds.
pub const T0: u64 = 1_700_000_000_000;

/// Cron period used by the real server.
pub const TICK_MS: u64 = 100;

const BASE_PORT: u16 = 7000;
const PORT_INCR: u16 = 10_000;
const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

/// Tunables shared by every simulated node: short timeouts so scenarios
/// finish in a few simulated seconds.
pub fn sim_config(seed: u64) -> ClusterConfig {
    ClusterConfig {
        node_timeout: Duration::from_millis(1000),
        port_incr: PORT_INCR,
        rng_seed: Some(seed),
        ..ClusterConfig::default()
    }
}

struct SimNode {
    view: ClusterView,
    alive: bool,
    events: Vec<ClusterEvent>,
    /// Writes are paused until then (manual failover).
    paused_until: u64,
}

struct Frame {
    to: usize,
    link: LinkId,
    bytes: Vec<u8>,
}

pub struct SimCluster {
    pub now: u64,
    nodes: Vec<SimNode>,
    /// (node, link) → (peer node, peer link)
    routes: HashMap<(usize, LinkId), (usize, LinkId)>,
    in_flight: VecDeque<Frame>,
    pub frames_delivered: u64,
}

impl SimCluster {
    /// `n` isolated nodes; node `i` serves clients on port `7000 + i`.
    pub fn new(n: usize) -> Self {
        let nodes = (0..n)
            .map(|i| SimNode {
                view: ClusterView::new(sim_config(1000 + i as u64), client_addr(i), T0),
                alive: true,
                events: Vec::new(),
                paused_until: 0,
            })
            .collect();
        Self {
            now: T0,
            nodes,
            routes: HashMap::new(),
            in_flight: VecDeque::new(),
            frames_delivered: 0,
        }
    }

    /// `n` nodes that know each other, with no slots assigned.
    pub fn meshed(n: usize) -> Self {
        let mut sim = Self::new(n);
        for i in 1..n {
            sim.view_mut(0).meet(client_addr(i), T0).unwrap();
        }
        let meshed = sim.run_until(30_000, |sim| {
            (0..n).all(|i| {
                let nodes = sim.view(i).nodes();
                nodes.len() == n && nodes.iter().all(|node| !node.flags.handshake)
            })
        });
        assert!(meshed, "nodes never formed a full mesh");
        sim
    }

    /// `primaries` nodes splitting the slot space into contiguous ranges,
    /// each followed by `replicas_each` replicas. Primary `p` is node `p`;
    /// its replicas are the nodes `primaries + p * replicas_each + r`.
    pub fn with_shards(primaries: usize, replicas_each: usize) -> Self {
        let total = primaries * (1 + replicas_each);
        let mut sim = Self::meshed(total);
        for p in 0..primaries {
            let range = shard_range(p, primaries);
            let slots: Vec<u16> = range.iter().collect();
            sim.view_mut(p).add_slots(&slots).unwrap();
            for r in 0..replicas_each {
                let replica = primaries + p * replicas_each + r;
                let primary_id = sim.id(p);
                let now = sim.now;
                sim.view_mut(replica).replicate(primary_id, now).unwrap();
            }
        }
        let settled = sim.run_until(30_000, |sim| {
            sim.alive().all(|i| {
                let view = sim.view(i);
                view.health() == ClusterHealth::Ok
                    && (0..primaries).all(|p| {
                        let range = shard_range(p, primaries);
                        view.slot_owner(range.start) == Some(sim.id(p))
                            && view.slot_owner(range.end) == Some(sim.id(p))
                    })
            })
        });
        assert!(settled, "cluster never settled:\n{}", sim.view(0).cluster_nodes());
        sim
    }

    pub fn view(&self, i: usize) -> &ClusterView {
        &self.nodes[i].view
    }

    pub fn view_mut(&mut self, i: usize) -> &mut ClusterView {
        &mut self.nodes[i].view
    }

    pub fn id(&self, i: usize) -> NodeId {
        self.nodes[i].view.myself_id()
    }

    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.iter().position(|n| n.view.myself_id() == id)
    }

    pub fn alive(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.nodes.len()).filter(|i| self.nodes[*i].alive)
    }

    /// Events emitted by node `i` so far.
    pub fn events(&self, i: usize) -> &[ClusterEvent] {
        &self.nodes[i].events
    }

    /// Stops node `i`. Its peers see their links to it close.
    pub fn kill(&mut self, i: usize) {
        self.nodes[i].alive = false;
        let dead: Vec<((usize, LinkId), (usize, LinkId))> = self
            .routes
            .iter()
            .filter(|((from, _), (to, _))| *from == i || *to == i)
            .map(|(a, b)| (*a, *b))
            .collect();
        for ((from, link), _) in dead {
            self.routes.remove(&(from, link));
            if from != i {
                self.nodes[from].view.link_closed(link);
            }
        }
    }

    /// Advances the clock by one cron period.
    ///
    /// Replication is modelled by offsets only: a primary's offset grows
    /// with the clock unless its writes are paused, and a replica copies
    /// its primary's offset while that primary is up.
    pub fn tick(&mut self) {
        self.now += TICK_MS;
        let now = self.now;
        let offset = now - T0;
        for i in 0..self.nodes.len() {
            let node = &mut self.nodes[i];
            if node.alive && !node.view.myself().is_replica() && now >= node.paused_until {
                node.view.note_replication(offset, now);
            }
        }
        for i in 0..self.nodes.len() {
            if !self.nodes[i].alive {
                continue;
            }
            let me = self.nodes[i].view.myself();
            let feed = me
                .primary
                .filter(|_| me.is_replica())
                .and_then(|p| self.index_of(p))
                .filter(|p| self.nodes[*p].alive)
                .map(|p| self.nodes[p].view.replication_offset());
            if let Some(primary_offset) = feed {
                self.nodes[i].view.note_replication(primary_offset, now);
            }
        }
        for i in 0..self.nodes.len() {
            if self.nodes[i].alive {
                self.nodes[i].view.cron(now);
            }
        }
        self.settle();
    }

    pub fn run_for(&mut self, ms: u64) {
        let end = self.now + ms;
        while self.now < end {
            self.tick();
        }
    }

    /// Ticks until `done` holds or `limit_ms` of simulated time passed.
    pub fn run_until(&mut self, limit_ms: u64, done: impl Fn(&SimCluster) -> bool) -> bool {
        let end = self.now + limit_ms;
        loop {
            if done(self) {
                return true;
            }
            if self.now >= end {
                return false;
            }
            self.tick();
        }
    }

    /// Flushes deferred work and delivers frames until the network is
    /// quiet.
    pub fn settle(&mut self) {
        for _ in 0..100 {
            let mut busy = false;
            for i in 0..self.nodes.len() {
                if !self.nodes[i].alive {
                    continue;
                }
                let now = self.now;
                let node = &mut self.nodes[i];
                node.view.before_sleep(now);
                for event in node.view.drain_events() {
                    match event {
                        ClusterEvent::PauseWrites { until } => node.paused_until = until,
                        ClusterEvent::ResumeWrites => node.paused_until = 0,
                        _ => {}
                    }
                    node.events.push(event);
                }
                let outgoing = node.view.drain_outgoing();
                busy |= !outgoing.is_empty();
                for out in outgoing {
                    self.route(i, out);
                }
            }
            while let Some(frame) = self.in_flight.pop_front() {
                busy = true;
                self.deliver(frame);
            }
            if !busy {
                return;
            }
        }
    }

    fn route(&mut self, from: usize, out: Outgoing) {
        match out {
            Outgoing::Connect { link, addr, .. } => {
                let target = bus_target(addr).filter(|t| *t < self.nodes.len());
                match target {
                    Some(to) if self.nodes[to].alive && to != from => {
                        let peer_link = self.nodes[to].view.accept_link(self.now);
                        self.routes.insert((from, link), (to, peer_link));
                        self.routes.insert((to, peer_link), (from, link));
                    }
                    _ => self.nodes[from].view.link_closed(link),
                }
            }
            Outgoing::Send { link, message } => {
                if let Some(&(to, peer_link)) = self.routes.get(&(from, link)) {
                    self.in_flight.push_back(Frame {
                        to,
                        link: peer_link,
                        bytes: message.encode().to_vec(),
                    });
                }
            }
            Outgoing::Close { link } => {
                if let Some((to, peer_link)) = self.routes.remove(&(from, link)) {
                    self.routes.remove(&(to, peer_link));
                    self.nodes[to].view.link_closed(peer_link);
                }
            }
        }
    }

    fn deliver(&mut self, frame: Frame) {
        if !self.nodes[frame.to].alive || !self.routes.contains_key(&(frame.to, frame.link)) {
            return;
        }
        let len = frame_length(&frame.bytes[..PREFIX_LEN]).expect("valid frame prefix");
        assert_eq!(len, frame.bytes.len(), "declared length matches the frame");
        let message = Message::decode(&frame.bytes).expect("frame decodes");
        self.frames_delivered += 1;
        let now = self.now;
        self.nodes[frame.to]
            .view
            .handle_message(frame.link, Some(LOCALHOST), message, now);
    }
}

pub fn client_addr(i: usize) -> SocketAddr {
    SocketAddr::new(LOCALHOST, BASE_PORT + i as u16)
}

fn bus_target(addr: SocketAddr) -> Option<usize> {
    let port = addr.port().checked_sub(BASE_PORT + PORT_INCR)?;
    Some(usize::from(port))
}

/// The `p`-th of `n` contiguous, near-equal slot ranges.
pub fn shard_range(p: usize, n: usize) -> SlotRange {
    let total = usize::from(SLOT_COUNT);
    let start = total * p / n;
    let end = total * (p + 1) / n - 1;
    SlotRange {
        start: start as u16,
        end: end as u16,
    }
}

#[test]
fn shard_ranges_cover_the_slot_space() {
    let ranges: Vec<SlotRange> = (0..3).map(|p| shard_range(p, 3)).collect();
    assert_eq!(ranges[0].start, 0);
    assert_eq!(ranges[2].end, SLOT_COUNT - 1);
    assert_eq!(ranges[0].end + 1, ranges[1].start);
    assert_eq!(ranges[1].end + 1, ranges[2].start);
    assert_eq!(ranges.iter().map(|r| r.len()).sum::<usize>(), 16384);
}
