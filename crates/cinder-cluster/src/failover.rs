//! Replica promotion: automatic failover elections, voting, manual
//! failover and replica migration.
//!
//! A replica of a failed primary waits a delay that grows with its rank
//! (replicas with more replicated data go first), then bumps the current
//! epoch and asks every primary for a vote. Each primary votes at most once
//! per epoch. With a majority the replica takes over its primary's slots
//! under the new epoch and announces it.

use std::fmt;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::ms;
use crate::error::ClusterError;
use crate::message::{Body, Header, Message};
use crate::node::{LinkId, NodeId};
use crate::time::elapsed;
use crate::view::{ClusterEvent, ClusterHealth, ClusterView};

/// Where this replica stands in the current election attempt.
///
/// Requesting votes and waiting for a quorum of them are one phase,
/// [`ElectionPhase::AwaitingQuorum`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ElectionPhase {
    #[default]
    Idle,
    /// Start time scheduled from our rank, waiting for it.
    RankComputed,
    /// Vote requests sent for the election epoch; acks are being counted.
    AwaitingQuorum,
    Elected,
    /// The attempt timed out; a new one is scheduled after a backoff.
    Aborted,
}

/// Why a replica of a failed primary isn't being promoted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CantFailoverReason {
    DataAge,
    WaitingDelay,
    Expired,
    WaitingVotes,
}

impl fmt::Display for CantFailoverReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            CantFailoverReason::DataAge => {
                "Disconnected from primary for longer than allowed. \
                 Please check the 'replica_validity_factor' setting."
            }
            CantFailoverReason::WaitingDelay => "Waiting the delay before I can start a new failover.",
            CantFailoverReason::Expired => "Failover attempt expired.",
            CantFailoverReason::WaitingVotes => "Waiting for votes, but majority still not reached.",
        };
        f.write_str(msg)
    }
}

/// How `CLUSTER FAILOVER` proceeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManualFailoverMode {
    /// Pause the primary, catch up with it, then run an election.
    Default,
    /// Run an election right away, even if the primary is down.
    Force,
    /// Promote without any election.
    Takeover,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Election {
    pub phase: ElectionPhase,
    /// When the current attempt may start (or started) asking for votes.
    pub auth_time: u64,
    pub auth_epoch: u64,
    pub rank: usize,
    pub sent: bool,
    pub voters: Vec<NodeId>,
    /// Expired attempts since the last success, drives the retry backoff.
    pub attempts: u32,
    pub cant_reason: Option<CantFailoverReason>,
    pub last_log_time: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ManualFailover {
    /// Deadline of the running manual failover, 0 if none.
    pub end: u64,
    /// Replica side: caught up with the paused primary.
    pub can_start: bool,
    /// Primary side: replica that asked for the failover.
    pub replica: Option<NodeId>,
    /// Replica side: offset announced by the paused primary.
    pub primary_offset: Option<u64>,
}

impl ClusterView {
    pub fn election_phase(&self) -> ElectionPhase {
        self.election.phase
    }

    /// Epoch of the latest election attempt, 0 if none.
    pub fn election_epoch(&self) -> u64 {
        self.election.auth_epoch
    }

    /// True while a manual failover is running on this node.
    pub fn manual_failover_in_progress(&self) -> bool {
        self.manual.end != 0
    }

    /// Position of this replica among its siblings: the number of siblings
    /// that replicated more data than we did.
    pub fn replica_rank(&self) -> usize {
        let me = self.myself();
        let Some(primary) = me.primary.and_then(|p| self.nodes.get(&p)) else {
            return 0;
        };
        let offset = self.replication.offset;
        primary
            .replicas
            .iter()
            .filter(|r| **r != self.myself)
            .filter_map(|r| self.nodes.get(r))
            .filter(|r| r.repl_offset > offset)
            .count()
    }

    /// Drives the election of this replica. Called from the cron and after
    /// votes arrive.
    pub(crate) fn handle_replica_failover(&mut self, now: u64) {
        let needed = self.quorum();
        let manual = self.manual.end != 0 && self.manual.can_start;
        let auth_timeout = self.config.auth_timeout_ms();
        let shift = self.election.attempts.min(self.config.max_retry_backoff_shift);
        let retry = (auth_timeout * 2) << shift;

        let me = self.myself();
        let Some(primary) = me
            .primary
            .filter(|_| me.is_replica())
            .and_then(|p| self.nodes.get(&p))
        else {
            self.election.cant_reason = None;
            return;
        };
        let primary_id = primary.id;
        if (!primary.is_failed() && !manual) || primary.slot_count() == 0 {
            if matches!(
                self.election.phase,
                ElectionPhase::RankComputed | ElectionPhase::AwaitingQuorum
            ) {
                info!("primary {} is back, aborting failover", primary_id.short());
                self.election.phase = ElectionPhase::Idle;
            }
            self.election.cant_reason = None;
            return;
        }

        let node_timeout = self.config.node_timeout_ms();
        let mut data_age = elapsed(now, self.replication.last_io);
        if data_age > node_timeout {
            data_age -= node_timeout;
        }
        let factor = self.config.replica_validity_factor;
        let max_age = ms(self.config.repl_ping_period) + node_timeout * factor;
        if factor > 0 && data_age > max_age && !manual {
            self.log_cant_failover(CantFailoverReason::DataAge, primary_id, now);
            return;
        }

        if elapsed(now, self.election.auth_time) > retry {
            let jitter = ms(self.config.election_jitter);
            let spread = if jitter > 0 {
                self.rng.random_range(0..jitter)
            } else {
                0
            };
            let mut rank = self.replica_rank();
            let mut auth_time = now
                + ms(self.config.election_base_delay)
                + spread
                + rank as u64 * ms(self.config.election_rank_delay);
            if self.manual.end != 0 {
                auth_time = now;
                rank = 0;
            }
            self.election.auth_time = auth_time;
            self.election.rank = rank;
            self.election.sent = false;
            self.election.voters.clear();
            self.election.phase = ElectionPhase::RankComputed;
            warn!(
                "start of election delayed for {} milliseconds (rank #{rank}, offset {})",
                auth_time - now,
                self.replication.offset
            );
            // tell the siblings our offset so their ranks are accurate
            self.broadcast_pong(true);
            return;
        }

        if !self.election.sent && !manual {
            let rank = self.replica_rank();
            if rank > self.election.rank {
                let added = (rank - self.election.rank) as u64 * ms(self.config.election_rank_delay);
                self.election.auth_time += added;
                self.election.rank = rank;
                info!("replica rank updated to #{rank}, added {added} milliseconds of delay");
            }
        }

        if now < self.election.auth_time {
            self.log_cant_failover(CantFailoverReason::WaitingDelay, primary_id, now);
            return;
        }

        if now - self.election.auth_time > auth_timeout {
            if self.election.phase != ElectionPhase::Aborted {
                self.election.phase = ElectionPhase::Aborted;
                self.election.attempts += 1;
            }
            self.log_cant_failover(CantFailoverReason::Expired, primary_id, now);
            return;
        }

        if !self.election.sent {
            self.current_epoch += 1;
            self.election.auth_epoch = self.current_epoch;
            self.last_vote_epoch = self.current_epoch;
            self.election.sent = true;
            self.election.phase = ElectionPhase::AwaitingQuorum;
            warn!(
                "starting a failover election for epoch {}",
                self.election.auth_epoch
            );
            self.request_failover_auth();
            self.todo.state_changed();
            self.todo.fsync_config = true;
            return;
        }

        if self.election.voters.len() >= needed {
            warn!("failover election won, I'm the new primary");
            let epoch = self.election.auth_epoch;
            let me = self.myself_mut();
            if me.config_epoch < epoch {
                me.config_epoch = epoch;
                warn!("config epoch set to {epoch} after successful failover");
            }
            self.replace_primary(now);
        } else {
            self.log_cant_failover(CantFailoverReason::WaitingVotes, primary_id, now);
        }
    }

    fn request_failover_auth(&mut self) {
        let mut header = self.build_header();
        header.mflags.force_ack = self.manual.end != 0;
        for link in self.broadcast_links() {
            self.push_message(
                link,
                Message {
                    header: header.clone(),
                    body: Body::FailoverAuthRequest,
                },
            );
        }
    }

    fn log_cant_failover(&mut self, reason: CantFailoverReason, primary: NodeId, now: u64) {
        let period = ms(self.config.cant_failover_relog_period);
        if self.election.cant_reason == Some(reason)
            && elapsed(now, self.election.last_log_time) < period
        {
            return;
        }
        self.election.cant_reason = Some(reason);
        self.election.last_log_time = now;

        // right after the failure this is expected, stay quiet
        let quiet = ms(self.config.node_timeout) + 5000;
        let recent = self
            .nodes
            .get(&primary)
            .is_some_and(|p| p.is_failed() && elapsed(now, p.fail_time) < quiet);
        if !recent {
            warn!("currently unable to failover: {reason}");
        }
    }

    /// Takes over the slots of our primary and announces it.
    fn replace_primary(&mut self, now: u64) {
        let me = self.myself;
        let Some(old) = self.myself().primary.filter(|_| self.myself().is_replica()) else {
            return;
        };
        self.set_node_as_primary(me);
        let (slots, siblings): (Vec<u16>, Vec<NodeId>) = self
            .nodes
            .get(&old)
            .map(|n| (n.slots.iter().collect(), n.replicas.clone()))
            .unwrap_or_default();
        for slot in slots {
            self.claim_slot(slot, me);
        }
        for sibling in siblings {
            self.set_primary(sibling, me);
        }
        self.update_state(now);
        self.todo.save_and_fsync();
        self.broadcast_pong(false);
        let update = {
            let node = self.myself();
            Body::Update {
                config_epoch: node.config_epoch,
                node: node.id,
                slots: node.slots.clone(),
            }
        };
        self.broadcast(update);
        self.reset_manual_failover();

        let epoch = self.myself().config_epoch;
        self.election.phase = ElectionPhase::Elected;
        self.election.attempts = 0;
        self.emit(ClusterEvent::Promoted {
            epoch,
            replaced: old,
        });
    }

    /// A replica asks for our vote.
    pub(crate) fn handle_auth_request(
        &mut self,
        requester: NodeId,
        link: LinkId,
        header: &Header,
        now: u64,
    ) {
        let me = self.myself();
        if !me.is_primary() || me.slot_count() == 0 {
            return;
        }
        if header.current_epoch < self.current_epoch {
            warn!(
                "failover auth denied to {}: request epoch {} < current epoch {}",
                requester.short(),
                header.current_epoch,
                self.current_epoch
            );
            return;
        }
        if self.last_vote_epoch == self.current_epoch {
            warn!(
                "failover auth denied to {}: already voted for epoch {}",
                requester.short(),
                self.current_epoch
            );
            return;
        }
        let Some(node) = self.nodes.get(&requester) else {
            return;
        };
        if node.is_primary() {
            warn!("failover auth denied to {}: it is a primary", requester.short());
            return;
        }
        let Some(primary) = node.primary.and_then(|p| self.nodes.get(&p)) else {
            warn!("failover auth denied to {}: I don't know its primary", requester.short());
            return;
        };
        if !primary.is_failed() && !header.mflags.force_ack {
            warn!(
                "failover auth denied to {}: its primary is up",
                requester.short()
            );
            return;
        }
        let window = self.config.node_timeout_ms() * 2;
        if elapsed(now, primary.voted_time) < window {
            warn!(
                "failover auth denied to {}: can't vote for this primary before {} milliseconds",
                requester.short(),
                window - elapsed(now, primary.voted_time)
            );
            return;
        }
        let primary_id = primary.id;

        let stale = header.slots.iter().find(|&slot| {
            self.slots
                .owner(slot)
                .and_then(|o| self.nodes.get(&o))
                .is_some_and(|o| o.config_epoch > header.config_epoch)
        });
        if let Some(slot) = stale {
            warn!(
                "failover auth denied to {}: slot {slot} epoch is newer than the request's {}",
                requester.short(),
                header.config_epoch
            );
            return;
        }

        self.last_vote_epoch = self.current_epoch;
        if let Some(primary) = self.nodes.get_mut(&primary_id) {
            primary.voted_time = now;
        }
        self.todo.save_and_fsync();
        let target = self
            .nodes
            .get(&requester)
            .and_then(|n| n.link)
            .unwrap_or(link);
        self.send(target, Body::FailoverAuthAck);
        warn!(
            "failover auth granted to {} for epoch {}",
            requester.short(),
            self.current_epoch
        );
    }

    pub(crate) fn handle_auth_ack(&mut self, voter: NodeId, header: &Header) {
        let Some(node) = self.nodes.get(&voter) else {
            return;
        };
        if !node.is_primary() || node.slot_count() == 0 {
            return;
        }
        if self.election.phase != ElectionPhase::AwaitingQuorum
            || header.current_epoch < self.election.auth_epoch
        {
            return;
        }
        if !self.election.voters.contains(&voter) {
            debug!("vote received from {}", voter.short());
            self.election.voters.push(voter);
            self.todo.handle_failover = true;
        }
    }

    /// `CLUSTER FAILOVER [FORCE|TAKEOVER]`, run on a replica.
    pub fn manual_failover(
        &mut self,
        mode: ManualFailoverMode,
        now: u64,
    ) -> Result<(), ClusterError> {
        let me = self.myself();
        if me.is_primary() {
            return Err(ClusterError::WrongRole { role: "primary" });
        }
        let Some(primary) = me.primary.and_then(|p| self.nodes.get(&p)) else {
            return Err(ClusterError::ManualFailover(
                "I'm a replica but my primary is unknown to me",
            ));
        };
        if mode == ManualFailoverMode::Default && (primary.is_failed() || primary.link.is_none()) {
            return Err(ClusterError::ManualFailover(
                "Primary is down or failed, please use CLUSTER FAILOVER FORCE",
            ));
        }
        let primary_link = primary.link;

        self.reset_manual_failover();
        self.manual.end = now + ms(self.config.mf_timeout);

        match mode {
            ManualFailoverMode::Takeover => {
                warn!("taking over the primary (user request)");
                self.bump_epoch_without_consensus();
                self.replace_primary(now);
            }
            ManualFailoverMode::Force => {
                warn!("forced failover user request accepted");
                self.manual.can_start = true;
            }
            ManualFailoverMode::Default => {
                warn!("manual failover user request accepted");
                if let Some(link) = primary_link {
                    self.send(link, Body::MfStart);
                }
            }
        }
        Ok(())
    }

    /// Our replica asks us to pause for a manual failover.
    pub(crate) fn handle_mf_start(&mut self, replica: NodeId, now: u64) {
        let follows_me = self
            .nodes
            .get(&replica)
            .is_some_and(|n| n.primary == Some(self.myself));
        if !follows_me || !self.myself().is_primary() {
            return;
        }
        self.reset_manual_failover();
        let timeout = ms(self.config.mf_timeout);
        self.manual.end = now + timeout;
        self.manual.replica = Some(replica);
        let until = now + timeout * u64::from(self.config.mf_pause_mult);
        warn!(
            "manual failover requested by replica {}, pausing writes",
            replica.short()
        );
        self.emit(ClusterEvent::PauseWrites { until });
    }

    pub(crate) fn reset_manual_failover(&mut self) {
        if self.manual.replica.is_some() {
            self.emit(ClusterEvent::ResumeWrites);
        }
        self.manual = ManualFailover::default();
    }

    pub(crate) fn manual_failover_check_timeout(&mut self, now: u64) {
        if self.manual.end != 0 && self.manual.end < now {
            warn!("manual failover timed out");
            self.reset_manual_failover();
        }
    }

    /// Replica side: the election may start once we replicated everything
    /// the paused primary has.
    pub(crate) fn manual_failover_replica_step(&mut self, _now: u64) {
        if self.manual.end == 0 || self.manual.can_start {
            return;
        }
        let Some(target) = self.manual.primary_offset else {
            return;
        };
        if target == self.replication.offset {
            self.manual.can_start = true;
            self.todo.handle_failover = true;
            warn!("all primary replication stream processed, manual failover can start");
        }
    }

    /// Makes this node a replica of `primary`.
    pub(crate) fn become_replica_of(&mut self, primary: NodeId, _now: u64) {
        let me = self.myself;
        if self.myself().is_primary() {
            self.myself_mut().set_role_replica();
            let migrating: Vec<u16> = self.slots.migrating().map(|(slot, _)| slot).collect();
            let importing: Vec<u16> = self.slots.importing().map(|(slot, _)| slot).collect();
            for slot in migrating {
                self.slots.set_migrating(slot, None);
            }
            for slot in importing {
                self.slots.set_importing(slot, None);
            }
        }
        self.set_primary(me, primary);
        self.reset_manual_failover();
        self.todo.state_changed();
        self.emit(ClusterEvent::ReplicaOf(primary));
    }

    /// `CLUSTER REPLICATE`.
    pub fn replicate(&mut self, primary: NodeId, now: u64) -> Result<(), ClusterError> {
        if primary == self.myself {
            return Err(ClusterError::TargetIsMyself { action: "replicate" });
        }
        let node = self
            .nodes
            .get(&primary)
            .ok_or(ClusterError::UnknownNode(primary))?;
        if node.is_replica() {
            return Err(ClusterError::WrongRole { role: "replica" });
        }
        let me = self.myself();
        if me.is_primary() && (me.slot_count() > 0 || !self.keys.is_empty()) {
            return Err(ClusterError::NodeOwnsSlots(self.myself));
        }
        self.become_replica_of(primary, now);
        self.todo.save_and_fsync();
        Ok(())
    }

    /// Moves this replica to an orphaned primary when our own primary has
    /// more working replicas than the migration barrier requires. Only the
    /// replica with the smallest id among the best-served shards moves.
    pub(crate) fn handle_replica_migration(&mut self, max_replicas: usize, now: u64) {
        if self.health != ClusterHealth::Ok {
            return;
        }
        let Some(my_primary) = self.myself().primary else {
            return;
        };
        if self.working_replicas(my_primary) <= self.config.migration_barrier {
            return;
        }

        let mut primaries: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| n.is_primary() && !n.is_failed() && n.flags.migrate_to)
            .map(|n| n.id)
            .collect();
        primaries.sort();

        let mut candidate = self.myself;
        let mut target = None;
        for id in primaries {
            let working = self.working_replicas(id);
            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if working == 0 && target.is_none() && node.slot_count() > 0 {
                if node.orphaned_time == 0 {
                    node.orphaned_time = now;
                }
                target = Some(id);
            } else if working > 0 {
                node.orphaned_time = 0;
            }
            if working == max_replicas {
                if let Some(smallest) = node.replicas.iter().min() {
                    candidate = candidate.min(*smallest);
                }
            }
        }

        let delay = ms(self.config.replica_migration_delay);
        let Some(target) = target else {
            return;
        };
        let orphaned_since = self.nodes.get(&target).map_or(now, |n| n.orphaned_time);
        if candidate == self.myself && elapsed(now, orphaned_since) > delay {
            warn!("migrating to orphaned primary {}", target.short());
            self.become_replica_of(target, now);
        }
    }
}
