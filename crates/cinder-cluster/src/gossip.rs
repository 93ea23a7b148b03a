//! Processing of inbound bus frames and construction of gossip sections.

use std::net::{IpAddr, SocketAddr};

use bytes::Bytes;
use rand::seq::IndexedRandom;
use tracing::{debug, info, trace, warn};

use crate::message::{Body, GossipEntry, Header, Message, MessageType};
use crate::node::{ClusterNode, LinkId, NodeId};
use crate::slots::SlotBitmap;
use crate::time::to_wire_secs;
use crate::view::{ClusterEvent, ClusterView};

/// Gossip pong times more than this far in the future are ignored.
const MAX_PONG_SKEW_MS: u64 = 500;

impl ClusterView {
    /// Processes one decoded frame that arrived on `link`. `peer_ip` is the
    /// remote address of the connection, used to learn the address of nodes
    /// that MEET us.
    pub fn handle_message(
        &mut self,
        link: LinkId,
        peer_ip: Option<IpAddr>,
        message: Message,
        now: u64,
    ) {
        let Message { header, body } = message;
        let kind = body.kind();
        self.stats.received[kind as usize] += 1;
        trace!(
            "received {} from {} on {link}",
            kind.name(),
            header.sender.short()
        );

        let sender = self
            .nodes
            .get(&header.sender)
            .filter(|n| !n.in_handshake())
            .map(|n| n.id);
        if let Some(node) = self.nodes.get_mut(&header.sender) {
            node.data_received = now;
        }
        if let Some(sender) = sender {
            self.absorb_header(sender, &header, now);
        }

        match body {
            Body::Ping(entries) | Body::Pong(entries) | Body::Meet(entries) => {
                self.handle_ping(link, peer_ip, kind, &header, sender, &entries, now);
            }
            Body::Fail { node } => {
                if sender.is_some() {
                    self.force_fail(node, now);
                }
            }
            Body::Publish { channel, message } => {
                if sender.is_some() {
                    self.emit(ClusterEvent::Published { channel, message });
                }
            }
            Body::FailoverAuthRequest => {
                if let Some(sender) = sender {
                    self.handle_auth_request(sender, link, &header, now);
                }
            }
            Body::FailoverAuthAck => {
                if let Some(sender) = sender {
                    self.handle_auth_ack(sender, &header);
                }
            }
            Body::MfStart => {
                if let Some(sender) = sender {
                    self.handle_mf_start(sender, now);
                }
            }
            Body::Update {
                config_epoch,
                node,
                slots,
            } => {
                if sender.is_some() {
                    self.handle_update(node, config_epoch, &slots, now);
                }
            }
        }
    }

    /// Epochs and replication offset carried by every header.
    fn absorb_header(&mut self, sender: NodeId, header: &Header, now: u64) {
        if header.current_epoch > self.current_epoch {
            self.current_epoch = header.current_epoch;
            self.todo.save_and_fsync();
        }
        let Some(node) = self.nodes.get_mut(&sender) else {
            return;
        };
        if header.config_epoch > node.config_epoch {
            node.config_epoch = header.config_epoch;
            self.todo.save_and_fsync();
        }
        node.repl_offset = header.offset;
        node.repl_offset_time = now;

        let me = self.myself();
        if self.manual.end != 0
            && me.is_replica()
            && me.primary == Some(sender)
            && header.mflags.paused
            && self.manual.primary_offset.is_none()
        {
            self.manual.primary_offset = Some(header.offset);
            debug!("received replication offset for paused primary: {}", header.offset);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_ping(
        &mut self,
        link: LinkId,
        peer_ip: Option<IpAddr>,
        kind: MessageType,
        header: &Header,
        sender: Option<NodeId>,
        entries: &[GossipEntry],
        now: u64,
    ) {
        if kind != MessageType::Pong {
            if sender.is_none() && kind == MessageType::Meet {
                if let Some(ip) = peer_ip {
                    self.start_handshake(SocketAddr::new(ip, header.port), false, now);
                    self.todo.save();
                }
            }
            let entries = self.gossip_entries();
            self.send(link, Body::Pong(entries));
        }

        if let Some(link_node) = self.link_node(link) {
            let in_handshake = self.nodes.get(&link_node).is_some_and(|n| n.in_handshake());
            if in_handshake {
                if let Some(known) = sender {
                    // we already knew the peer under its real name
                    let addr = self.nodes.get(&link_node).and_then(|n| n.addr);
                    if let Some(addr) = addr {
                        self.update_address(known, addr);
                    }
                    self.remove_node(link_node);
                    return;
                }
                self.rename_node(link_node, header.sender);
                if let Some(node) = self.nodes.get_mut(&header.sender) {
                    node.flags.handshake = false;
                    node.flags.primary = header.flags.primary;
                    node.flags.replica = header.flags.replica;
                }
                info!("handshake with node {} completed", header.sender.short());
                self.todo.save();
            } else if link_node != header.sender {
                warn!(
                    "node {} answered as {}, dropping its address",
                    link_node.short(),
                    header.sender.short()
                );
                if let Some(node) = self.nodes.get_mut(&link_node) {
                    node.flags.noaddr = true;
                    node.addr = None;
                }
                self.close_link(link);
                self.todo.save();
                return;
            }
        }

        if let (Some(sender), Some(ip), MessageType::Ping) = (sender, peer_ip, kind) {
            let inbound = self.nodes.get(&sender).is_some_and(|n| n.link != Some(link));
            if inbound {
                self.update_address(sender, SocketAddr::new(ip, header.port));
            }
        }

        if kind == MessageType::Pong {
            if let Some(id) = self.link_node(link) {
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.pong_received = now;
                    node.ping_sent = 0;
                }
                if self.nodes.get(&id).is_some_and(|n| n.flags.pfail) {
                    self.clear_suspected(id);
                } else {
                    self.clear_failure_if_needed(id, now);
                }
            }
        }

        let Some(sender) = sender else {
            return;
        };

        match header.primary {
            None => self.set_node_as_primary(sender),
            Some(primary) => {
                if self.nodes.get(&sender).is_some_and(|n| n.is_primary()) {
                    let owned: Vec<u16> = self
                        .nodes
                        .get(&sender)
                        .map(|n| n.slots.iter().collect())
                        .unwrap_or_default();
                    for slot in owned {
                        self.unclaim_slot(slot);
                    }
                    if let Some(node) = self.nodes.get_mut(&sender) {
                        node.set_role_replica();
                    }
                    self.todo.state_changed();
                }
                self.set_primary(sender, primary);
            }
        }

        let Some(node) = self.nodes.get(&sender) else {
            return;
        };
        let sender_is_primary = node.is_primary();
        let shard = if sender_is_primary {
            Some(sender)
        } else {
            node.primary
        };
        let dirty = shard
            .and_then(|s| self.nodes.get(&s))
            .is_some_and(|p| p.slots != header.slots);

        if sender_is_primary && dirty {
            self.update_slots_from_claim(sender, header.config_epoch, &header.slots, now);
        }
        if dirty {
            self.send_update_if_stale(sender, link, header);
        }

        let my_epoch = self.myself().config_epoch;
        let sender_epoch = self.nodes.get(&sender).map_or(0, |n| n.config_epoch);
        if sender_is_primary && self.myself().is_primary() && sender_epoch == my_epoch {
            self.handle_epoch_collision(sender);
        }

        self.process_gossip(sender, entries, now);
    }

    /// The sender advertises slots that we know belong to someone at a
    /// newer epoch: tell it.
    fn send_update_if_stale(&mut self, sender: NodeId, link: LinkId, header: &Header) {
        let newer = header.slots.iter().find_map(|slot| {
            let owner = self.slots.owner(slot)?;
            if owner == sender {
                return None;
            }
            self.nodes
                .get(&owner)
                .filter(|n| n.config_epoch > header.config_epoch)
        });
        let Some(owner) = newer else {
            return;
        };
        let body = Body::Update {
            config_epoch: owner.config_epoch,
            node: owner.id,
            slots: owner.slots.clone(),
        };
        debug!(
            "node {} has an old slots configuration, sending UPDATE about {}",
            sender.short(),
            owner.id.short()
        );
        let target = self.nodes.get(&sender).and_then(|n| n.link).unwrap_or(link);
        self.send(target, body);
    }

    /// Two primaries share a config epoch: the one with the smaller id takes
    /// a new one.
    fn handle_epoch_collision(&mut self, sender: NodeId) {
        if sender <= self.myself {
            return;
        }
        self.current_epoch += 1;
        let epoch = self.current_epoch;
        self.myself_mut().config_epoch = epoch;
        self.todo.save_and_fsync();
        warn!(
            "config epoch collision with node {}, config epoch set to {epoch}",
            sender.short()
        );
    }

    fn update_address(&mut self, id: NodeId, addr: SocketAddr) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        if node.addr == Some(addr) || node.flags.myself {
            return;
        }
        node.addr = Some(addr);
        node.flags.noaddr = false;
        let link = node.link;
        info!("address updated for node {}: now {addr}", id.short());
        if let Some(link) = link {
            self.close_link(link);
        }
        self.todo.save();
    }

    fn process_gossip(&mut self, sender: NodeId, entries: &[GossipEntry], now: u64) {
        let sender_is_primary = self.nodes.get(&sender).is_some_and(|n| n.is_primary());
        for entry in entries {
            let reported_down = entry.flags.fail || entry.flags.pfail;
            let Some(node) = self.nodes.get_mut(&entry.node) else {
                let addr = SocketAddr::new(entry.ip, entry.port);
                if !entry.flags.noaddr && !self.is_denylisted(&entry.node) {
                    self.start_handshake(addr, true, now);
                }
                continue;
            };
            if node.flags.myself {
                continue;
            }

            if sender_is_primary {
                if reported_down {
                    if node.add_fail_report(sender, now) {
                        debug!(
                            "node {} reported node {} as not reachable",
                            sender.short(),
                            entry.node.short()
                        );
                    }
                    self.mark_failed_if_needed(entry.node, now);
                } else if node.remove_fail_report(sender) {
                    debug!(
                        "node {} reported node {} is back online",
                        sender.short(),
                        entry.node.short()
                    );
                }
            }

            let Some(node) = self.nodes.get_mut(&entry.node) else {
                continue;
            };
            if !reported_down && node.ping_sent == 0 && node.fail_reports.is_empty() {
                let pong = u64::from(entry.pong_received) * 1000;
                if pong <= now + MAX_PONG_SKEW_MS && pong > node.pong_received {
                    node.pong_received = pong;
                }
            }

            let addr = SocketAddr::new(entry.ip, entry.port);
            if !node.is_healthy() && !reported_down && !entry.flags.noaddr && node.addr != Some(addr)
            {
                self.update_address(entry.node, addr);
            }
        }
    }

    fn handle_update(&mut self, id: NodeId, epoch: u64, slots: &SlotBitmap, now: u64) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        if node.config_epoch >= epoch {
            return;
        }
        if node.is_replica() {
            self.set_node_as_primary(id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.config_epoch = epoch;
        }
        self.todo.save_and_fsync();
        self.update_slots_from_claim(id, epoch, slots, now);
    }

    /// Picks the nodes described in the gossip section of the next PING /
    /// PONG / MEET: a random sample of healthy nodes plus every suspected
    /// one.
    pub(crate) fn gossip_entries(&mut self) -> Vec<GossipEntry> {
        let known = self.nodes.len();
        let wanted = (known / self.config.gossip_fraction.max(1))
            .max(self.config.gossip_min_entries)
            .min(known.saturating_sub(2));

        let mut eligible: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| {
                !n.flags.myself
                    && !n.flags.pfail
                    && !n.in_handshake()
                    && !n.flags.noaddr
                    && !(n.link.is_none() && n.slot_count() == 0)
            })
            .map(|n| n.id)
            .collect();
        eligible.sort();
        let mut chosen: Vec<NodeId> = eligible
            .choose_multiple(&mut self.rng, wanted)
            .copied()
            .collect();

        let mut suspected: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| {
                !n.flags.myself && n.flags.pfail && !n.in_handshake() && !n.flags.noaddr
            })
            .map(|n| n.id)
            .collect();
        suspected.sort();
        chosen.extend(suspected);

        chosen
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter_map(gossip_entry)
            .collect()
    }

    /// Broadcasts a pub/sub message to every node.
    pub fn publish(&mut self, channel: Bytes, message: Bytes) {
        self.broadcast(Body::Publish { channel, message });
    }
}

fn gossip_entry(node: &ClusterNode) -> Option<GossipEntry> {
    let addr = node.addr?;
    Some(GossipEntry {
        node: node.id,
        ping_sent: to_wire_secs(node.ping_sent),
        pong_received: to_wire_secs(node.pong_received),
        ip: addr.ip(),
        port: addr.port(),
        flags: node.flags,
    })
}
