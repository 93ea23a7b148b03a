//! Error types for cluster operations.

use std::net::SocketAddr;

use crate::NodeId;

/// Errors returned by the administrative and routing APIs of a view.
///
/// The redirect variants render the exact error line a client expects.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("ERR Unknown node {0}")]
    UnknownNode(NodeId),

    #[error("ERR Invalid or out of range slot {0}")]
    SlotOutOfRange(u16),

    #[error("ERR Slot {0} is already busy")]
    SlotBusy(u16),

    #[error("ERR Slot {0} is already unassigned")]
    SlotUnassigned(u16),

    #[error("ERR I'm not the owner of hash slot {0}")]
    NotOwner(u16),

    #[error("ERR I'm already the owner of hash slot {0}")]
    AlreadyOwner(u16),

    #[error("ERR Can't assign hashslot {slot} to a different node while I still hold {keys} keys for this hash slot")]
    KeysInSlot { slot: u16, keys: usize },

    #[error("ERR node {0} still owns slots, reassign them first")]
    NodeOwnsSlots(NodeId),

    #[error("ERR I tried hard but I can't forget myself...")]
    ForgetMyself,

    #[error("ERR Can't forget my master!")]
    ForgetMyPrimary,

    #[error("ERR Can't {action} myself")]
    TargetIsMyself { action: &'static str },

    /// Ownership claim at an epoch that doesn't beat the current owner.
    #[error("stale claim for slot {slot}: epoch {epoch} <= {current}")]
    StaleClaim { slot: u16, epoch: u64, current: u64 },

    #[error("ERR not enough failure reports to mark {0} as failed")]
    NoFailureQuorum(NodeId),

    #[error("ERR operation not supported on {role} node")]
    WrongRole { role: &'static str },

    #[error("ERR {0}")]
    ManualFailover(&'static str),

    #[error("MOVED {slot} {addr}")]
    Moved { slot: u16, addr: SocketAddr },

    #[error("ASK {slot} {addr}")]
    Ask { slot: u16, addr: SocketAddr },

    #[error("CROSSSLOT Keys in request don't hash to the same slot")]
    CrossSlot,

    #[error("TRYAGAIN Multiple keys request during rehashing of slot")]
    TryAgain,

    #[error("CLUSTERDOWN The cluster is down")]
    ClusterDown,

    #[error("CLUSTERDOWN Hash slot not served")]
    SlotNotServed,

    #[error("ERR invalid cluster configuration: {0}")]
    Configuration(String),
}

impl ClusterError {
    /// Returns true for MOVED and ASK, the errors a client follows.
    pub fn is_redirect(&self) -> bool {
        matches!(self, ClusterError::Moved { .. } | ClusterError::Ask { .. })
    }

    /// Returns true for errors the client should retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClusterError::TryAgain | ClusterError::ClusterDown | ClusterError::SlotNotServed
        )
    }

    pub fn moved(slot: u16, addr: SocketAddr) -> Self {
        ClusterError::Moved { slot, addr }
    }

    pub fn ask(slot: u16, addr: SocketAddr) -> Self {
        ClusterError::Ask { slot, addr }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_lines() {
        let addr: SocketAddr = "127.0.0.1:7001".parse().unwrap();
        assert_eq!(ClusterError::moved(42, addr).to_string(), "MOVED 42 127.0.0.1:7001");
        assert_eq!(ClusterError::ask(500, addr).to_string(), "ASK 500 127.0.0.1:7001");
        assert!(ClusterError::ask(500, addr).is_redirect());
        assert!(!ClusterError::CrossSlot.is_redirect());
        assert!(ClusterError::TryAgain.is_retryable());
        assert!(ClusterError::ClusterDown.to_string().starts_with("CLUSTERDOWN"));
    }
}
