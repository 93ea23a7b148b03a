//! Node identities, flags and the per-node record kept in the registry.

use std::fmt;
use std::net::SocketAddr;

use rand::Rng;

use crate::slots::SlotBitmap;

/// Length of a node identity in raw bytes (160 bits).
pub const NODE_ID_LEN: usize = 20;

/// Length of a node identity in its hex text form, as sent on the wire.
pub const NODE_NAME_LEN: usize = NODE_ID_LEN * 2;

/// Stable 160-bit node identity.
///
/// Displayed and transmitted as 40 lowercase hex characters. Ordering
/// matches the lexicographic order of that text form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

/// Returned when a string is not a valid node identity.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id '{0}': expected 40 hex characters")]
pub struct InvalidNodeId(pub String);

impl NodeId {
    pub fn random(rng: &mut impl Rng) -> Self {
        Self(rng.random())
    }

    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Parses the 40-character hex form. Upper case is accepted.
    pub fn parse(s: &str) -> Result<Self, InvalidNodeId> {
        Self::from_name(s.as_bytes()).ok_or_else(|| InvalidNodeId(s.to_string()))
    }

    /// Decodes a wire name field. Returns `None` on any non-hex byte.
    pub fn from_name(name: &[u8]) -> Option<Self> {
        if name.len() != NODE_NAME_LEN {
            return None;
        }
        let mut out = [0u8; NODE_ID_LEN];
        for (byte, pair) in out.iter_mut().zip(name.chunks_exact(2)) {
            *byte = (hex_value(pair[0])? << 4) | hex_value(pair[1])?;
        }
        Some(Self(out))
    }

    /// Encodes the identity as its 40-byte wire name.
    pub fn to_name(&self) -> [u8; NODE_NAME_LEN] {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut out = [0u8; NODE_NAME_LEN];
        for (i, byte) in self.0.iter().enumerate() {
            out[i * 2] = HEX[usize::from(byte >> 4)];
            out[i * 2 + 1] = HEX[usize::from(byte & 0x0f)];
        }
        out
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        let mut s = self.to_string();
        s.truncate(8);
        s
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

impl std::str::FromStr for NodeId {
    type Err = InvalidNodeId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Opaque handle for one bus connection, allocated by the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

const FLAG_PRIMARY: u16 = 1 << 0;
const FLAG_REPLICA: u16 = 1 << 1;
const FLAG_PFAIL: u16 = 1 << 2;
const FLAG_FAIL: u16 = 1 << 3;
const FLAG_MYSELF: u16 = 1 << 4;
const FLAG_HANDSHAKE: u16 = 1 << 5;
const FLAG_NOADDR: u16 = 1 << 6;
const FLAG_MEET: u16 = 1 << 7;
const FLAG_MIGRATE_TO: u16 = 1 << 8;

/// Role, liveness and lifecycle flags of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeFlags {
    pub myself: bool,
    pub primary: bool,
    pub replica: bool,
    /// Suspected failing: no pong within the node timeout.
    pub pfail: bool,
    /// Failure confirmed by a majority of primaries.
    pub fail: bool,
    /// First contact in progress; the identity is still a placeholder.
    pub handshake: bool,
    /// Address unknown.
    pub noaddr: bool,
    /// Send MEET instead of PING on the next connect.
    pub meet: bool,
    /// Primary that had replicas at some point, eligible as a replica
    /// migration target.
    pub migrate_to: bool,
}

impl NodeFlags {
    pub fn to_wire(self) -> u16 {
        [
            (self.primary, FLAG_PRIMARY),
            (self.replica, FLAG_REPLICA),
            (self.pfail, FLAG_PFAIL),
            (self.fail, FLAG_FAIL),
            (self.myself, FLAG_MYSELF),
            (self.handshake, FLAG_HANDSHAKE),
            (self.noaddr, FLAG_NOADDR),
            (self.meet, FLAG_MEET),
            (self.migrate_to, FLAG_MIGRATE_TO),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .fold(0, |acc, (_, bit)| acc | bit)
    }

    pub fn from_wire(bits: u16) -> Self {
        Self {
            primary: bits & FLAG_PRIMARY != 0,
            replica: bits & FLAG_REPLICA != 0,
            pfail: bits & FLAG_PFAIL != 0,
            fail: bits & FLAG_FAIL != 0,
            myself: bits & FLAG_MYSELF != 0,
            handshake: bits & FLAG_HANDSHAKE != 0,
            noaddr: bits & FLAG_NOADDR != 0,
            meet: bits & FLAG_MEET != 0,
            migrate_to: bits & FLAG_MIGRATE_TO != 0,
        }
    }

    /// Parses the comma separated form used in node description lines.
    pub fn parse(s: &str) -> Option<Self> {
        let mut flags = Self::default();
        for word in s.split(',') {
            match word {
                "myself" => flags.myself = true,
                "master" => flags.primary = true,
                "slave" => flags.replica = true,
                "fail?" => flags.pfail = true,
                "fail" => flags.fail = true,
                "handshake" => flags.handshake = true,
                "noaddr" => flags.noaddr = true,
                "noflags" => {}
                _ => return None,
            }
        }
        Some(flags)
    }
}

impl fmt::Display for NodeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let words: Vec<&str> = [
            (self.myself, "myself"),
            (self.primary, "master"),
            (self.replica, "slave"),
            (self.pfail, "fail?"),
            (self.fail, "fail"),
            (self.handshake, "handshake"),
            (self.noaddr, "noaddr"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, word)| *word)
        .collect();
        if words.is_empty() {
            write!(f, "noflags")
        } else {
            write!(f, "{}", words.join(","))
        }
    }
}

/// One failure report: `reporter` told us the node looked down at `time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailReport {
    pub reporter: NodeId,
    pub time: u64,
}

/// Everything this node knows about one peer (or itself).
///
/// Cross references (`primary`, `replicas`) are identities looked up in the
/// registry, never owned copies. `primary` may name a node that isn't known
/// locally yet.
#[derive(Debug, Clone)]
pub struct ClusterNode {
    pub id: NodeId,
    pub created: u64,
    pub flags: NodeFlags,
    /// Epoch of the last slot ownership change claimed by this node.
    pub config_epoch: u64,
    /// Slots owned, only meaningful for primaries.
    pub slots: SlotBitmap,
    pub replicas: Vec<NodeId>,
    pub primary: Option<NodeId>,
    pub ping_sent: u64,
    pub pong_received: u64,
    /// Last time any frame from this node was processed.
    pub data_received: u64,
    pub fail_time: u64,
    /// Last time we voted for a replica of this node.
    pub voted_time: u64,
    pub repl_offset: u64,
    pub repl_offset_time: u64,
    /// Since when this primary has had no working replica.
    pub orphaned_time: u64,
    /// Client-facing address; the bus listens on `port + port_incr`.
    pub addr: Option<SocketAddr>,
    /// Outbound bus link, if connected.
    pub link: Option<LinkId>,
    pub fail_reports: Vec<FailReport>,
}

impl ClusterNode {
    pub fn new(id: NodeId, flags: NodeFlags, now: u64) -> Self {
        Self {
            id,
            created: now,
            flags,
            config_epoch: 0,
            slots: SlotBitmap::new(),
            replicas: Vec::new(),
            primary: None,
            ping_sent: 0,
            pong_received: 0,
            data_received: 0,
            fail_time: 0,
            voted_time: 0,
            repl_offset: 0,
            repl_offset_time: 0,
            orphaned_time: 0,
            addr: None,
            link: None,
            fail_reports: Vec::new(),
        }
    }

    pub fn is_primary(&self) -> bool {
        self.flags.primary
    }

    pub fn is_replica(&self) -> bool {
        self.flags.replica
    }

    pub fn is_failed(&self) -> bool {
        self.flags.fail
    }

    pub fn is_suspected(&self) -> bool {
        self.flags.pfail
    }

    /// Neither suspected nor failed.
    pub fn is_healthy(&self) -> bool {
        !self.flags.pfail && !self.flags.fail
    }

    pub fn in_handshake(&self) -> bool {
        self.flags.handshake
    }

    pub fn slot_count(&self) -> usize {
        self.slots.count()
    }

    /// Address of the cluster bus endpoint.
    pub fn bus_addr(&self, port_incr: u16) -> Option<SocketAddr> {
        let addr = self.addr?;
        let port = addr.port().checked_add(port_incr)?;
        Some(SocketAddr::new(addr.ip(), port))
    }

    pub(crate) fn set_role_primary(&mut self) {
        self.flags.primary = true;
        self.flags.replica = false;
    }

    pub(crate) fn set_role_replica(&mut self) {
        self.flags.primary = false;
        self.flags.replica = true;
        self.flags.migrate_to = false;
    }

    /// Records or refreshes a report. Returns true if it is new.
    pub(crate) fn add_fail_report(&mut self, reporter: NodeId, now: u64) -> bool {
        if let Some(report) = self.fail_reports.iter_mut().find(|r| r.reporter == reporter) {
            report.time = now;
            return false;
        }
        self.fail_reports.push(FailReport {
            reporter,
            time: now,
        });
        true
    }

    /// Removes the report from `reporter`. Returns true if one existed.
    pub(crate) fn remove_fail_report(&mut self, reporter: NodeId) -> bool {
        let before = self.fail_reports.len();
        self.fail_reports.retain(|r| r.reporter != reporter);
        self.fail_reports.len() != before
    }

    /// Drops reports older than `validity` and returns how many are left.
    pub(crate) fn valid_fail_reports(&mut self, validity: u64, now: u64) -> usize {
        self.fail_reports
            .retain(|r| crate::time::elapsed(now, r.time) <= validity);
        self.fail_reports.len()
    }
}
