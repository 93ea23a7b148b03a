//! The coordination loop: the only place the cluster view is mutated.
//!
//! Timer ticks, bus link events and admin commands are serialized through
//! one `select!` loop. After each of them the loop runs the deferred work
//! (`before_sleep`), carries out the I/O actions the view queued, logs the
//! cluster events and persists the config snapshot when asked to.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use cinder_cluster::{
    unix_ms, ClusterError, ClusterEvent, ClusterView, LinkId, ManualFailoverMode, NodeId,
    Outgoing, QueryFlags, Redirect, SaveRequest,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bus::{self, LinkEvent};
use crate::persist;

/// Cron period of the cluster view.
const TICK: Duration = Duration::from_millis(100);

/// Depth of the link event and admin command queues.
const QUEUE_DEPTH: usize = 4096;

/// What `CLUSTER SETSLOT` should do with a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetSlot {
    Importing(NodeId),
    Migrating(NodeId),
    Node(NodeId),
    Stable,
}

/// An administrative request for the coordinator.
#[derive(Debug, Clone)]
pub enum AdminCommand {
    Meet(SocketAddr),
    Forget(NodeId),
    /// Marks a node failed without waiting for a failure quorum.
    MarkFailed(NodeId),
    AddSlots(Vec<u16>),
    DelSlots(Vec<u16>),
    SetSlot { slot: u16, action: SetSlot },
    Replicate(NodeId),
    Failover(ManualFailoverMode),
    CountKeysInSlot(u16),
    GetKeysInSlot { slot: u16, count: usize },
    Publish { channel: Bytes, message: Bytes },
    Route { keys: Vec<Bytes>, flags: QueryFlags },
    Nodes,
    Info,
}

/// Successful result of an [`AdminCommand`].
#[derive(Debug, Clone, PartialEq)]
pub enum AdminReply {
    Ok,
    Text(String),
    Count(usize),
    Keys(Vec<Bytes>),
    Redirect(Redirect),
}

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("cluster coordinator is not running")]
    Stopped,
}

struct AdminRequest {
    command: AdminCommand,
    reply: oneshot::Sender<Result<AdminReply, ClusterError>>,
}

/// Cheap handle for sending admin commands to a running coordinator.
#[derive(Debug, Clone)]
pub struct AdminHandle {
    tx: mpsc::Sender<AdminRequest>,
}

impl std::fmt::Debug for AdminRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminRequest")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

impl AdminHandle {
    pub async fn call(&self, command: AdminCommand) -> Result<AdminReply, AdminError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(AdminRequest { command, reply })
            .await
            .map_err(|_| AdminError::Stopped)?;
        Ok(rx.await.map_err(|_| AdminError::Stopped)??)
    }
}

/// A live bus connection as seen by the coordinator.
struct Link {
    frames: mpsc::Sender<Bytes>,
    /// Remote address, used to learn the address of nodes that MEET us.
    peer_ip: IpAddr,
}

/// Owns the cluster view and drives it.
pub struct Coordinator {
    view: ClusterView,
    links: HashMap<LinkId, Link>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: mpsc::Receiver<LinkEvent>,
    admin_rx: mpsc::Receiver<AdminRequest>,
    nodes_file: Option<PathBuf>,
}

impl Coordinator {
    /// Wraps `view`. The snapshot is written to `nodes_file` whenever the
    /// view asks for it; `None` disables persistence.
    pub fn new(view: ClusterView, nodes_file: Option<PathBuf>) -> (Self, AdminHandle) {
        let (events_tx, events_rx) = mpsc::channel(QUEUE_DEPTH);
        let (admin_tx, admin_rx) = mpsc::channel(QUEUE_DEPTH);
        let coordinator = Self {
            view,
            links: HashMap::new(),
            events_tx,
            events_rx,
            admin_rx,
            nodes_file,
        };
        (coordinator, AdminHandle { tx: admin_tx })
    }

    /// Sender for the bus listener.
    pub fn link_events(&self) -> mpsc::Sender<LinkEvent> {
        self.events_tx.clone()
    }

    /// Runs until `shutdown` resolves, then saves the snapshot one last
    /// time.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "cluster coordinator running, my id is {}",
            self.view.myself_id()
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutdown requested, stopping cluster coordinator");
                    break;
                }

                _ = tick.tick() => {
                    self.view.cron(unix_ms());
                }

                Some(event) = self.events_rx.recv() => {
                    self.handle_link_event(event);
                }

                Some(request) = self.admin_rx.recv() => {
                    let result = self.handle_admin(request.command);
                    let _ = request.reply.send(result);
                }
            }
            self.after_step();
        }

        self.save(SaveRequest { fsync: true });
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let now = unix_ms();
        match event {
            LinkEvent::Accepted { stream, peer } => {
                let link = self.view.accept_link(now);
                debug!("accepted bus link {link} from {peer}");
                let frames = bus::spawn_inbound(link, stream, self.events_tx.clone());
                self.links.insert(
                    link,
                    Link {
                        frames,
                        peer_ip: peer.ip(),
                    },
                );
            }
            LinkEvent::Frame { link, message } => {
                let Some(peer_ip) = self.links.get(&link).map(|l| l.peer_ip) else {
                    // frame raced with a close
                    return;
                };
                self.view.handle_message(link, Some(peer_ip), message, now);
            }
            LinkEvent::Closed { link } => {
                if self.links.remove(&link).is_some() {
                    debug!("bus link {link} closed");
                }
                self.view.link_closed(link);
            }
        }
    }

    fn handle_admin(&mut self, command: AdminCommand) -> Result<AdminReply, ClusterError> {
        let now = unix_ms();
        let view = &mut self.view;
        match command {
            AdminCommand::Meet(addr) => view.meet(addr, now).map(|_| AdminReply::Ok),
            AdminCommand::Forget(id) => view.forget(id, now).map(|_| AdminReply::Ok),
            AdminCommand::MarkFailed(id) => {
                view.mark_failed_forced(id, now).map(|_| AdminReply::Ok)
            }
            AdminCommand::AddSlots(slots) => view.add_slots(&slots).map(|_| AdminReply::Ok),
            AdminCommand::DelSlots(slots) => view.del_slots(&slots).map(|_| AdminReply::Ok),
            AdminCommand::SetSlot { slot, action } => match action {
                SetSlot::Importing(source) => view.start_importing_from(slot, source),
                SetSlot::Migrating(target) => view.start_migrating_to(slot, target),
                SetSlot::Node(node) => view.set_slot_node(slot, node),
                SetSlot::Stable => view.clear_migration_state(slot),
            }
            .map(|_| AdminReply::Ok),
            AdminCommand::Replicate(primary) => {
                view.replicate(primary, now).map(|_| AdminReply::Ok)
            }
            AdminCommand::Failover(mode) => {
                view.manual_failover(mode, now).map(|_| AdminReply::Ok)
            }
            AdminCommand::CountKeysInSlot(slot) => {
                cinder_cluster::check_slot(slot)?;
                Ok(AdminReply::Count(view.keys().count_in_slot(slot)))
            }
            AdminCommand::GetKeysInSlot { slot, count } => {
                cinder_cluster::check_slot(slot)?;
                Ok(AdminReply::Keys(view.keys().keys_in_slot(slot, count)))
            }
            AdminCommand::Publish { channel, message } => {
                view.publish(channel, message);
                Ok(AdminReply::Ok)
            }
            AdminCommand::Route { keys, flags } => {
                Ok(AdminReply::Redirect(view.route(&keys, flags)))
            }
            AdminCommand::Nodes => Ok(AdminReply::Text(view.cluster_nodes())),
            AdminCommand::Info => Ok(AdminReply::Text(view.cluster_info())),
        }
    }

    /// Deferred work, I/O and persistence after one loop step.
    fn after_step(&mut self) {
        let now = unix_ms();
        let save = self.view.before_sleep(now);
        for out in self.view.drain_outgoing() {
            self.execute(out);
        }
        for event in self.view.drain_events() {
            log_event(&event);
        }
        if let Some(request) = save {
            self.save(request);
        }
    }

    fn execute(&mut self, out: Outgoing) {
        match out {
            Outgoing::Connect { link, node, addr } => {
                debug!("opening bus link {link} to {} at {addr}", node.short());
                let frames = bus::spawn_outbound(link, addr, self.events_tx.clone());
                self.links.insert(
                    link,
                    Link {
                        frames,
                        peer_ip: addr.ip(),
                    },
                );
            }
            Outgoing::Send { link, message } => {
                let Some(l) = self.links.get(&link) else {
                    return;
                };
                if l.frames.try_send(message.encode()).is_err() {
                    debug!("bus link {link} is backed up, dropping {}", message.kind().name());
                }
            }
            Outgoing::Close { link } => {
                // dropping the sender stops the link's tasks
                self.links.remove(&link);
            }
        }
    }

    fn save(&self, request: SaveRequest) {
        let Some(path) = &self.nodes_file else {
            return;
        };
        if let Err(e) = persist::save(path, &self.view.snapshot(), request.fsync) {
            error!("failed to save cluster config to {}: {e}", path.display());
        }
    }
}

fn log_event(event: &ClusterEvent) {
    match event {
        ClusterEvent::NodeFailed(id) => warn!("node {} marked as failed", id.short()),
        ClusterEvent::NodeRecovered(id) => info!("node {} is reachable again", id.short()),
        ClusterEvent::HealthChanged(health) => info!("cluster state changed: {health}"),
        ClusterEvent::Promoted { epoch, replaced } => info!(
            "promoted to primary at epoch {epoch}, replacing {}",
            replaced.short()
        ),
        ClusterEvent::ReplicaOf(primary) => info!("now replicating {}", primary.short()),
        ClusterEvent::PauseWrites { until } => info!("writes paused until {until}"),
        ClusterEvent::ResumeWrites => info!("writes resumed"),
        ClusterEvent::Published { channel, message } => debug!(
            "cluster publish on {:?}: {} bytes",
            channel,
            message.len()
        ),
        ClusterEvent::DeleteSlotKeys { slot, keys } => {
            info!("slot {slot} moved away, {} keys to delete", keys.len())
        }
    }
}
