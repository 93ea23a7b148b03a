//! Tunables for the cluster state machines.
//!
//! Every timing rule in the crate reads from [`ClusterConfig`]. Defaults
//! match the classic cluster bus constants, so a zero-config node behaves
//! like any other member of an existing deployment.

use std::time::Duration;

/// Configuration shared by the registry, gossip, election and routing code.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// A node that doesn't answer a ping for this long is flagged PFAIL.
    pub node_timeout: Duration,
    /// Replicas whose data is older than `repl_ping_period + node_timeout *
    /// factor` don't start an election. Zero disables the check.
    pub replica_validity_factor: u64,
    /// Replication heartbeat period, used in the data-age check.
    pub repl_ping_period: Duration,
    /// When set, any unowned or failed slot turns cluster health to FAIL.
    pub require_full_coverage: bool,
    /// Minimum number of working replicas a primary keeps before one of
    /// them may migrate to an orphaned primary.
    pub migration_barrier: usize,
    /// Offset from the client port to the cluster bus port.
    pub port_incr: u16,
    /// Gossip sections carry about `known_nodes / gossip_fraction` entries.
    pub gossip_fraction: usize,
    /// Lower bound on gossip entries per message.
    pub gossip_min_entries: usize,
    /// Fixed part of the delay before a replica asks for votes.
    pub election_base_delay: Duration,
    /// Upper bound of the uniform random part of the election delay.
    pub election_jitter: Duration,
    /// Additional delay per rank position.
    pub election_rank_delay: Duration,
    /// Manual failover must complete within this window.
    pub mf_timeout: Duration,
    /// The primary pauses writes for `mf_timeout * mf_pause_mult`.
    pub mf_pause_mult: u32,
    /// Failure reports expire after `node_timeout * fail_report_validity_mult`.
    pub fail_report_validity_mult: u32,
    /// A failed primary with slots is un-failed only after
    /// `node_timeout * fail_undo_time_mult`.
    pub fail_undo_time_mult: u32,
    /// An orphaned primary must stay orphaned this long before a replica
    /// migrates to it.
    pub replica_migration_delay: Duration,
    /// Forgotten nodes can't be re-added through gossip for this long.
    pub denylist_ttl: Duration,
    /// A primary stays in FAIL state this long after startup.
    pub writable_delay: Duration,
    /// How often the same "can't failover" reason is logged again.
    pub cant_failover_relog_period: Duration,
    /// Cap on the exponent used to back off repeated election attempts.
    pub max_retry_backoff_shift: u32,
    /// Seed for the view's RNG. `None` seeds from the OS.
    pub rng_seed: Option<u64>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_timeout: Duration::from_millis(15_000),
            replica_validity_factor: 10,
            repl_ping_period: Duration::from_secs(10),
            require_full_coverage: true,
            migration_barrier: 1,
            port_incr: 10_000,
            gossip_fraction: 10,
            gossip_min_entries: 3,
            election_base_delay: Duration::from_millis(500),
            election_jitter: Duration::from_millis(500),
            election_rank_delay: Duration::from_millis(1000),
            mf_timeout: Duration::from_millis(5000),
            mf_pause_mult: 2,
            fail_report_validity_mult: 2,
            fail_undo_time_mult: 2,
            replica_migration_delay: Duration::from_millis(5000),
            denylist_ttl: Duration::from_secs(60),
            writable_delay: Duration::from_millis(2000),
            cant_failover_relog_period: Duration::from_secs(300),
            max_retry_backoff_shift: 3,
            rng_seed: None,
        }
    }
}

impl ClusterConfig {
    pub(crate) fn node_timeout_ms(&self) -> u64 {
        ms(self.node_timeout)
    }

    pub(crate) fn fail_report_validity_ms(&self) -> u64 {
        self.node_timeout_ms() * u64::from(self.fail_report_validity_mult)
    }

    /// Handshakes that don't complete in this window are dropped.
    pub(crate) fn handshake_timeout_ms(&self) -> u64 {
        self.node_timeout_ms().max(1000)
    }

    /// Time a primary waits after rejoining the majority before it
    /// accepts writes again.
    pub(crate) fn rejoin_delay_ms(&self) -> u64 {
        self.node_timeout_ms().clamp(500, 5000)
    }

    /// How long an election round may run before it counts as expired.
    pub(crate) fn auth_timeout_ms(&self) -> u64 {
        (self.node_timeout_ms() * 2).max(2000)
    }
}

/// Converts a duration into whole milliseconds, saturating.
pub(crate) fn ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_bus_constants() {
        let cfg = ClusterConfig::default();
        assert_eq!(cfg.node_timeout_ms(), 15_000);
        assert_eq!(cfg.port_incr, 10_000);
        assert_eq!(cfg.fail_report_validity_ms(), 30_000);
        assert_eq!(cfg.auth_timeout_ms(), 30_000);
        assert!(cfg.require_full_coverage);
    }

    #[test]
    fn derived_windows_are_clamped() {
        let cfg = ClusterConfig {
            node_timeout: Duration::from_millis(100),
            ..ClusterConfig::default()
        };
        assert_eq!(cfg.handshake_timeout_ms(), 1000);
        assert_eq!(cfg.rejoin_delay_ms(), 500);
        assert_eq!(cfg.auth_timeout_ms(), 2000);
    }
}
