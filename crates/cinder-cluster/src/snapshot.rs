//! Config snapshot: the durable part of a view, and its `nodes.conf` text
//! form.
//!
//! One line per node:
//!
//! ```text
//! <id> <ip:port> <flags> <primary|-> <ping> <pong> <epoch> <link> <slots...>
//! ```
//!
//! followed by `vars currentEpoch <n> lastVoteEpoch <n>`. The local node's
//! line also carries `[<slot>->-<id>]` and `[<slot>-<-<id>]` entries for
//! slots being migrated and imported. The same line format backs
//! `CLUSTER NODES`.

use std::fmt;
use std::fmt::Write as _;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::error::ClusterError;
use crate::node::{ClusterNode, NodeFlags, NodeId};
use crate::slots::SlotRange;
use crate::view::ClusterView;

/// Returned when `nodes.conf` text can't be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("nodes.conf line {line}: {reason}")]
pub struct ConfigParseError {
    /// 1-based line number.
    pub line: usize,
    pub reason: String,
}

/// Everything needed to rebuild a view after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterSnapshot {
    pub myself: NodeId,
    pub current_epoch: u64,
    pub last_vote_epoch: u64,
    pub nodes: Vec<NodeRecord>,
}

/// One node as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,
    pub addr: Option<SocketAddr>,
    pub flags: NodeFlags,
    pub primary: Option<NodeId>,
    pub ping_sent: u64,
    pub pong_received: u64,
    pub config_epoch: u64,
    pub connected: bool,
    pub slots: Vec<SlotRange>,
    pub migrating: Vec<(u16, NodeId)>,
    pub importing: Vec<(u16, NodeId)>,
}

impl fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Some(addr) => write!(f, "{} {addr} {}", self.id, self.flags)?,
            None => write!(f, "{} :0 {}", self.id, self.flags)?,
        }
        match self.primary {
            Some(p) => write!(f, " {p}")?,
            None => write!(f, " -")?,
        }
        write!(
            f,
            " {} {} {} {}",
            self.ping_sent,
            self.pong_received,
            self.config_epoch,
            if self.connected {
                "connected"
            } else {
                "disconnected"
            }
        )?;
        for range in &self.slots {
            write!(f, " {range}")?;
        }
        for (slot, target) in &self.migrating {
            write!(f, " [{slot}->-{target}]")?;
        }
        for (slot, source) in &self.importing {
            write!(f, " [{slot}-<-{source}]")?;
        }
        Ok(())
    }
}

impl ClusterSnapshot {
    /// Renders the `nodes.conf` text.
    pub fn to_nodes_conf(&self) -> String {
        let mut out = String::new();
        for record in &self.nodes {
            let _ = writeln!(out, "{record}");
        }
        let _ = writeln!(
            out,
            "vars currentEpoch {} lastVoteEpoch {}",
            self.current_epoch, self.last_vote_epoch
        );
        out
    }

    /// Parses `nodes.conf` text. Blank lines are skipped. Exactly one node
    /// must carry the `myself` flag.
    pub fn parse(text: &str) -> Result<Self, ConfigParseError> {
        let mut nodes = Vec::new();
        let mut myself = None;
        let mut current_epoch = 0;
        let mut last_vote_epoch = 0;

        for (idx, raw) in text.lines().enumerate() {
            let line = idx + 1;
            let err = |reason: String| ConfigParseError { line, reason };
            let fields: Vec<&str> = raw.split_whitespace().collect();
            match fields.first() {
                None => continue,
                Some(&"vars") => {
                    for pair in fields[1..].chunks(2) {
                        let [name, value] = pair else {
                            return Err(err("vars entry without a value".into()));
                        };
                        let value: u64 = value
                            .parse()
                            .map_err(|_| err(format!("invalid value for {name}")))?;
                        match *name {
                            "currentEpoch" => current_epoch = value,
                            "lastVoteEpoch" => last_vote_epoch = value,
                            other => return Err(err(format!("unknown var '{other}'"))),
                        }
                    }
                }
                Some(_) => {
                    let record = parse_node_line(&fields).map_err(err)?;
                    if record.flags.myself {
                        if myself.is_some() {
                            return Err(err("more than one node flagged myself".into()));
                        }
                        myself = Some(record.id);
                    }
                    nodes.push(record);
                }
            }
        }

        let myself = myself.ok_or_else(|| ConfigParseError {
            line: 0,
            reason: "no node flagged myself".into(),
        })?;
        Ok(Self {
            myself,
            current_epoch,
            last_vote_epoch,
            nodes,
        })
    }
}

fn parse_node_line(fields: &[&str]) -> Result<NodeRecord, String> {
    if fields.len() < 8 {
        return Err(format!("expected at least 8 fields, got {}", fields.len()));
    }
    let id = NodeId::parse(fields[0]).map_err(|e| e.to_string())?;
    let addr = match fields[1] {
        ":0" => None,
        a => Some(
            a.parse::<SocketAddr>()
                .map_err(|_| format!("invalid address '{a}'"))?,
        ),
    };
    let flags = NodeFlags::parse(fields[2]).ok_or_else(|| format!("invalid flags '{}'", fields[2]))?;
    let primary = match fields[3] {
        "-" => None,
        p => Some(NodeId::parse(p).map_err(|e| e.to_string())?),
    };
    let number = |s: &str, what: &str| -> Result<u64, String> {
        s.parse().map_err(|_| format!("invalid {what} '{s}'"))
    };
    let ping_sent = number(fields[4], "ping time")?;
    let pong_received = number(fields[5], "pong time")?;
    let config_epoch = number(fields[6], "config epoch")?;
    let connected = match fields[7] {
        "connected" => true,
        "disconnected" => false,
        other => return Err(format!("invalid link state '{other}'")),
    };

    let mut record = NodeRecord {
        id,
        addr,
        flags,
        primary,
        ping_sent,
        pong_received,
        config_epoch,
        connected,
        slots: Vec::new(),
        migrating: Vec::new(),
        importing: Vec::new(),
    };
    for field in &fields[8..] {
        if let Some(inner) = field.strip_prefix('[').and_then(|f| f.strip_suffix(']')) {
            let (slot, peer, migrating) = if let Some((s, p)) = inner.split_once("->-") {
                (s, p, true)
            } else if let Some((s, p)) = inner.split_once("-<-") {
                (s, p, false)
            } else {
                return Err(format!("invalid migration entry '{field}'"));
            };
            let slot: u16 = slot
                .parse()
                .map_err(|_| format!("invalid slot in '{field}'"))?;
            crate::slots::check_slot(slot).map_err(|e| e.to_string())?;
            let peer = NodeId::parse(peer).map_err(|e| e.to_string())?;
            if migrating {
                record.migrating.push((slot, peer));
            } else {
                record.importing.push((slot, peer));
            }
        } else {
            let range: SlotRange = field.parse().map_err(|e: ClusterError| e.to_string())?;
            record.slots.push(range);
        }
    }
    Ok(record)
}

impl ClusterView {
    /// Describes one node the way `CLUSTER NODES` and `nodes.conf` do.
    fn describe(&self, node: &ClusterNode) -> NodeRecord {
        let is_me = node.id == self.myself;
        // transient bits have no text form
        let flags = NodeFlags {
            meet: false,
            migrate_to: false,
            ..node.flags
        };
        NodeRecord {
            id: node.id,
            addr: node.addr,
            flags,
            primary: node.primary,
            ping_sent: node.ping_sent,
            pong_received: node.pong_received,
            config_epoch: node.config_epoch,
            connected: is_me || node.link.is_some(),
            slots: node.slots.ranges(),
            migrating: if is_me {
                self.slots.migrating().collect()
            } else {
                Vec::new()
            },
            importing: if is_me {
                self.slots.importing().collect()
            } else {
                Vec::new()
            },
        }
    }

    /// Captures the durable state. Nodes still in handshake are left out.
    pub fn snapshot(&self) -> ClusterSnapshot {
        ClusterSnapshot {
            myself: self.myself,
            current_epoch: self.current_epoch,
            last_vote_epoch: self.last_vote_epoch,
            nodes: self
                .nodes()
                .into_iter()
                .filter(|n| !n.in_handshake())
                .map(|n| self.describe(n))
                .collect(),
        }
    }

    /// `CLUSTER NODES` output, one line per known node.
    pub fn cluster_nodes(&self) -> String {
        let mut out = String::new();
        for node in self.nodes() {
            let _ = writeln!(out, "{}", self.describe(node));
        }
        out
    }

    /// Rebuilds a view from a snapshot. Links start disconnected; nodes
    /// that had a ping or pong recorded get `now` instead so timeouts start
    /// counting from the restart.
    pub fn restore(
        config: ClusterConfig,
        snapshot: &ClusterSnapshot,
        now: u64,
    ) -> Result<Self, ClusterError> {
        if !snapshot.nodes.iter().any(|r| r.id == snapshot.myself) {
            return Err(ClusterError::Configuration(format!(
                "node {} is not described",
                snapshot.myself
            )));
        }
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let mut view = ClusterView::empty(config, snapshot.myself, rng);

        for record in &snapshot.nodes {
            if record.flags.handshake {
                continue;
            }
            let mut flags = record.flags;
            flags.myself = record.id == snapshot.myself;
            flags.meet = false;
            let mut node = ClusterNode::new(record.id, flags, now);
            node.addr = record.addr;
            node.config_epoch = record.config_epoch;
            if record.ping_sent != 0 {
                node.ping_sent = now;
            }
            if record.pong_received != 0 {
                node.pong_received = now;
            }
            if flags.fail {
                node.fail_time = now;
            }
            view.nodes.insert(record.id, node);
        }

        for record in &snapshot.nodes {
            if !view.nodes.contains_key(&record.id) {
                continue;
            }
            if let Some(primary) = record.primary {
                view.set_primary(record.id, primary);
            }
            let owns = view.nodes.get(&record.id).is_some_and(|n| n.is_primary());
            if owns {
                for range in &record.slots {
                    for slot in range.iter() {
                        view.claim_slot(slot, record.id);
                    }
                }
            } else if !record.slots.is_empty() {
                warn!("ignoring slots listed for non-primary node {}", record.id);
            }
            if record.id == snapshot.myself {
                for &(slot, target) in &record.migrating {
                    view.slots.set_migrating(slot, Some(target));
                }
                for &(slot, source) in &record.importing {
                    view.slots.set_importing(slot, Some(source));
                }
            }
        }

        let max_config = view.nodes.values().map(|n| n.config_epoch).max().unwrap_or(0);
        view.current_epoch = snapshot.current_epoch.max(max_config);
        view.last_vote_epoch = snapshot.last_vote_epoch;
        view.todo = Default::default();
        view.todo.update_state = true;
        info!(
            "loaded cluster configuration: {} nodes, current epoch {}",
            view.nodes.len(),
            view.current_epoch
        );
        Ok(view)
    }
}
