//! Server configuration: TOML file layout and conversion into the cluster
//! tunables.
//!
//! Resolution order is defaults → TOML file → env vars → CLI flags. Every
//! field has a default so a partial file is fine.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use cinder_cluster::ClusterConfig;
use serde::{Deserialize, Serialize};

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the node advertises and binds to.
    pub bind: String,
    /// Client port. The bus listens on `port + cluster.port_incr`.
    pub port: u16,
    /// Directory holding the config snapshot.
    pub data_dir: String,
    /// File name of the config snapshot inside `data_dir`.
    pub nodes_file: String,
    /// Client addresses of nodes to MEET on startup.
    pub seeds: Vec<String>,
    /// Assign every slot to this node when it starts without a snapshot.
    pub bootstrap: bool,
    pub cluster: ClusterSection,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7000,
            data_dir: ".".into(),
            nodes_file: "nodes.conf".into(),
            seeds: Vec::new(),
            bootstrap: false,
            cluster: ClusterSection::default(),
        }
    }
}

/// The `[cluster]` table. Durations are spelled out in their unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClusterSection {
    pub node_timeout_ms: u64,
    pub replica_validity_factor: u64,
    pub repl_ping_period_secs: u64,
    pub require_full_coverage: bool,
    pub migration_barrier: usize,
    pub port_incr: u16,
    pub gossip_fraction: usize,
    pub gossip_min_entries: usize,
    pub election_base_delay_ms: u64,
    pub election_jitter_ms: u64,
    pub election_rank_delay_ms: u64,
    pub mf_timeout_ms: u64,
    pub mf_pause_mult: u32,
    pub fail_report_validity_mult: u32,
    pub fail_undo_time_mult: u32,
    pub replica_migration_delay_ms: u64,
    pub denylist_ttl_secs: u64,
    pub writable_delay_ms: u64,
    pub cant_failover_relog_secs: u64,
    pub max_retry_backoff_shift: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rng_seed: Option<u64>,
}

impl Default for ClusterSection {
    fn default() -> Self {
        let c = ClusterConfig::default();
        Self {
            node_timeout_ms: millis(c.node_timeout),
            replica_validity_factor: c.replica_validity_factor,
            repl_ping_period_secs: c.repl_ping_period.as_secs(),
            require_full_coverage: c.require_full_coverage,
            migration_barrier: c.migration_barrier,
            port_incr: c.port_incr,
            gossip_fraction: c.gossip_fraction,
            gossip_min_entries: c.gossip_min_entries,
            election_base_delay_ms: millis(c.election_base_delay),
            election_jitter_ms: millis(c.election_jitter),
            election_rank_delay_ms: millis(c.election_rank_delay),
            mf_timeout_ms: millis(c.mf_timeout),
            mf_pause_mult: c.mf_pause_mult,
            fail_report_validity_mult: c.fail_report_validity_mult,
            fail_undo_time_mult: c.fail_undo_time_mult,
            replica_migration_delay_ms: millis(c.replica_migration_delay),
            denylist_ttl_secs: c.denylist_ttl.as_secs(),
            writable_delay_ms: millis(c.writable_delay),
            cant_failover_relog_secs: c.cant_failover_relog_period.as_secs(),
            max_retry_backoff_shift: c.max_retry_backoff_shift,
            rng_seed: c.rng_seed,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl ClusterSection {
    pub fn to_cluster_config(&self) -> ClusterConfig {
        ClusterConfig {
            node_timeout: Duration::from_millis(self.node_timeout_ms),
            replica_validity_factor: self.replica_validity_factor,
            repl_ping_period: Duration::from_secs(self.repl_ping_period_secs),
            require_full_coverage: self.require_full_coverage,
            migration_barrier: self.migration_barrier,
            port_incr: self.port_incr,
            gossip_fraction: self.gossip_fraction,
            gossip_min_entries: self.gossip_min_entries,
            election_base_delay: Duration::from_millis(self.election_base_delay_ms),
            election_jitter: Duration::from_millis(self.election_jitter_ms),
            election_rank_delay: Duration::from_millis(self.election_rank_delay_ms),
            mf_timeout: Duration::from_millis(self.mf_timeout_ms),
            mf_pause_mult: self.mf_pause_mult,
            fail_report_validity_mult: self.fail_report_validity_mult,
            fail_undo_time_mult: self.fail_undo_time_mult,
            replica_migration_delay: Duration::from_millis(self.replica_migration_delay_ms),
            denylist_ttl: Duration::from_secs(self.denylist_ttl_secs),
            writable_delay: Duration::from_millis(self.writable_delay_ms),
            cant_failover_relog_period: Duration::from_secs(self.cant_failover_relog_secs),
            max_retry_backoff_shift: self.max_retry_backoff_shift,
            rng_seed: self.rng_seed,
        }
    }
}

impl ServerConfig {
    /// Reads a TOML file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file '{}': {e}", path.display()))?;
        Self::from_toml(&text)
            .map_err(|e| format!("invalid config file '{}': {e}", path.display()))
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| e.to_string())
    }

    /// Checks values that would make the node unusable.
    pub fn validate(&self) -> Result<(), String> {
        if self.port.checked_add(self.cluster.port_incr).is_none() {
            return Err(format!(
                "port {} + port_incr {} overflows",
                self.port, self.cluster.port_incr
            ));
        }
        if self.cluster.node_timeout_ms == 0 {
            return Err("node_timeout_ms must be greater than zero".into());
        }
        if self.cluster.gossip_fraction == 0 {
            return Err("gossip_fraction must be at least 1".into());
        }
        if self.nodes_file.is_empty() {
            return Err("nodes_file must not be empty".into());
        }
        Ok(())
    }

    /// Client address of this node.
    pub fn client_addr(&self) -> Result<SocketAddr, String> {
        parse_addr(&self.bind, self.port)
    }

    /// Bus address of this node.
    pub fn bus_addr(&self) -> Result<SocketAddr, String> {
        let port = self
            .port
            .checked_add(self.cluster.port_incr)
            .ok_or_else(|| "bus port overflows".to_string())?;
        parse_addr(&self.bind, port)
    }

    pub fn nodes_file_path(&self) -> PathBuf {
        Path::new(&self.data_dir).join(&self.nodes_file)
    }

    /// Parses the seed list as `host:port` client addresses.
    pub fn seed_addrs(&self) -> Result<Vec<SocketAddr>, String> {
        self.seeds
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| format!("invalid seed address '{s}': {e}"))
            })
            .collect()
    }
}

fn parse_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    format!("{host}:{port}")
        .parse()
        .map_err(|e| format!("invalid bind address '{host}:{port}': {e}"))
}
