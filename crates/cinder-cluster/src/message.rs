//! Binary wire format of the cluster bus.
//!
//! Every frame starts with a fixed 2208-byte header followed by a body whose
//! shape depends on the message type. All integers are big-endian. Field
//! widths are fixed so independent implementations interoperate:
//!
//! ```text
//! sig "RCmb" | totlen u32 | ver u16 | unused u16 | type u16 | count u16
//! currentEpoch u64 | configEpoch u64 | offset u64
//! sender [40] | slots [2048] | primary [40] (zeros = none) | unused [32]
//! port u16 | flags u16 | health u8 | mflags [3]
//! ```
//!
//! A frame is rejected as a whole if anything is off: signature, version,
//! declared length against the bytes received, or the body length expected
//! for its type. There is no partial recovery.

use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::node::{NodeFlags, NodeId, NODE_NAME_LEN};
use crate::slots::{SlotBitmap, SLOT_BITMAP_LEN};
use crate::view::ClusterHealth;

pub const SIGNATURE: &[u8; 4] = b"RCmb";
pub const PROTOCOL_VERSION: u16 = 0;

/// Size of the fixed header, and the smallest valid frame.
pub const HEADER_LEN: usize = 2208;

/// Size of one gossip entry in PING / PONG / MEET bodies.
pub const GOSSIP_ENTRY_LEN: usize = 104;

/// Bytes a reader needs before it can tell the frame length.
pub const PREFIX_LEN: usize = 8;

/// Upper bound on a frame, so a bogus length can't force a huge allocation.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const IP_FIELD_LEN: usize = 46;
const FAIL_BODY_LEN: usize = NODE_NAME_LEN;
const UPDATE_BODY_LEN: usize = 8 + NODE_NAME_LEN + SLOT_BITMAP_LEN;
const PUBLISH_FIXED_LEN: usize = 8;

const MF_PAUSED: u8 = 1 << 0;
const MF_FORCEACK: u8 = 1 << 1;

/// Why a frame was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("bad frame signature")]
    BadSignature,

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("declared length {declared} but frame has {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("frame length {0} is below the header size")]
    TooShort(usize),

    #[error("frame length {0} exceeds the limit")]
    TooLarge(usize),

    #[error("unknown message type {0}")]
    UnknownType(u16),

    #[error("{kind:?} body should be {expected} bytes, got {actual}")]
    BodyLength {
        kind: MessageType,
        expected: usize,
        actual: usize,
    },

    #[error("invalid node name")]
    InvalidNodeName,

    #[error("invalid address in gossip entry")]
    InvalidAddress,
}

/// Message type tag as carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    FailoverAuthRequest = 5,
    FailoverAuthAck = 6,
    Update = 7,
    MfStart = 8,
}

impl MessageType {
    /// Number of message types, for per-type counters.
    pub const COUNT: usize = 9;

    pub const ALL: [MessageType; Self::COUNT] = [
        MessageType::Ping,
        MessageType::Pong,
        MessageType::Meet,
        MessageType::Fail,
        MessageType::Publish,
        MessageType::FailoverAuthRequest,
        MessageType::FailoverAuthAck,
        MessageType::Update,
        MessageType::MfStart,
    ];

    pub fn from_wire(tag: u16) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
            MessageType::Meet => "meet",
            MessageType::Fail => "fail",
            MessageType::Publish => "publish",
            MessageType::FailoverAuthRequest => "auth-req",
            MessageType::FailoverAuthAck => "auth-ack",
            MessageType::Update => "update",
            MessageType::MfStart => "mfstart",
        }
    }
}

/// Manual failover bits of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ManualFailoverFlags {
    /// Sender is a primary with writes paused for a manual failover.
    pub paused: bool,
    /// Vote even if the primary isn't flagged as failed.
    pub force_ack: bool,
}

/// The sender's view of itself, present on every frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub current_epoch: u64,
    /// Config epoch of the sender, or of its primary for a replica.
    pub config_epoch: u64,
    /// Replication offset.
    pub offset: u64,
    pub sender: NodeId,
    /// Slots served by the sender (its primary's slots for a replica).
    pub slots: SlotBitmap,
    /// `None` when the sender is a primary.
    pub primary: Option<NodeId>,
    /// Client port; the bus port is derived from it.
    pub port: u16,
    pub flags: NodeFlags,
    pub health: ClusterHealth,
    pub mflags: ManualFailoverFlags,
}

/// One node described in a gossip section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEntry {
    pub node: NodeId,
    /// Seconds.
    pub ping_sent: u32,
    /// Seconds.
    pub pong_received: u32,
    pub ip: IpAddr,
    pub port: u16,
    pub flags: NodeFlags,
}

/// Type-specific part of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    Ping(Vec<GossipEntry>),
    Pong(Vec<GossipEntry>),
    Meet(Vec<GossipEntry>),
    Fail { node: NodeId },
    Publish { channel: Bytes, message: Bytes },
    FailoverAuthRequest,
    FailoverAuthAck,
    Update {
        config_epoch: u64,
        node: NodeId,
        slots: SlotBitmap,
    },
    MfStart,
}

impl Body {
    pub fn kind(&self) -> MessageType {
        match self {
            Body::Ping(_) => MessageType::Ping,
            Body::Pong(_) => MessageType::Pong,
            Body::Meet(_) => MessageType::Meet,
            Body::Fail { .. } => MessageType::Fail,
            Body::Publish { .. } => MessageType::Publish,
            Body::FailoverAuthRequest => MessageType::FailoverAuthRequest,
            Body::FailoverAuthAck => MessageType::FailoverAuthAck,
            Body::Update { .. } => MessageType::Update,
            Body::MfStart => MessageType::MfStart,
        }
    }

    /// Gossip entries of a PING / PONG / MEET, empty for other types.
    pub fn gossip(&self) -> &[GossipEntry] {
        match self {
            Body::Ping(e) | Body::Pong(e) | Body::Meet(e) => e,
            _ => &[],
        }
    }
}

/// A complete bus frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        self.body.kind()
    }

    /// Number of gossip entries that will be encoded.
    fn entry_count(&self) -> usize {
        self.body.gossip().len().min(usize::from(u16::MAX))
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN
            + match &self.body {
                Body::Ping(_) | Body::Pong(_) | Body::Meet(_) => {
                    self.entry_count() * GOSSIP_ENTRY_LEN
                }
                Body::Fail { .. } => FAIL_BODY_LEN,
                Body::Publish { channel, message } => {
                    PUBLISH_FIXED_LEN + channel.len() + message.len()
                }
                Body::FailoverAuthRequest | Body::FailoverAuthAck | Body::MfStart => 0,
                Body::Update { .. } => UPDATE_BODY_LEN,
            }
    }

    /// Serializes the frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let count = self.entry_count();
        let h = &self.header;

        buf.put_slice(SIGNATURE);
        buf.put_u32(self.encoded_len() as u32);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u16(0);
        buf.put_u16(self.kind() as u16);
        buf.put_u16(count as u16);
        buf.put_u64(h.current_epoch);
        buf.put_u64(h.config_epoch);
        buf.put_u64(h.offset);
        buf.put_slice(&h.sender.to_name());
        buf.put_slice(h.slots.as_bytes());
        match h.primary {
            Some(primary) => buf.put_slice(&primary.to_name()),
            None => buf.put_bytes(0, NODE_NAME_LEN),
        }
        buf.put_bytes(0, 32);
        buf.put_u16(h.port);
        buf.put_u16(h.flags.to_wire());
        buf.put_u8(match h.health {
            ClusterHealth::Ok => 0,
            ClusterHealth::Fail => 1,
        });
        let mut mflags = 0;
        if h.mflags.paused {
            mflags |= MF_PAUSED;
        }
        if h.mflags.force_ack {
            mflags |= MF_FORCEACK;
        }
        buf.put_u8(mflags);
        buf.put_bytes(0, 2);

        match &self.body {
            Body::Ping(entries) | Body::Pong(entries) | Body::Meet(entries) => {
                for entry in &entries[..count] {
                    encode_entry(buf, entry);
                }
            }
            Body::Fail { node } => buf.put_slice(&node.to_name()),
            Body::Publish { channel, message } => {
                buf.put_u32(channel.len() as u32);
                buf.put_u32(message.len() as u32);
                buf.put_slice(channel);
                buf.put_slice(message);
            }
            Body::FailoverAuthRequest | Body::FailoverAuthAck | Body::MfStart => {}
            Body::Update {
                config_epoch,
                node,
                slots,
            } => {
                buf.put_u64(*config_epoch);
                buf.put_slice(&node.to_name());
                buf.put_slice(slots.as_bytes());
            }
        }
    }

    /// Parses one complete frame. `buf` must hold exactly the frame.
    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        let declared = frame_length(buf)?;
        if declared != buf.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: buf.len(),
            });
        }

        let mut cur = &buf[PREFIX_LEN..];
        let version = cur.get_u16();
        if version != PROTOCOL_VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        cur.advance(2);
        let tag = cur.get_u16();
        let kind = MessageType::from_wire(tag).ok_or(FrameError::UnknownType(tag))?;
        let count = usize::from(cur.get_u16());

        let header = Header {
            current_epoch: cur.get_u64(),
            config_epoch: cur.get_u64(),
            offset: cur.get_u64(),
            sender: get_node_id(&mut cur)?,
            slots: get_bitmap(&mut cur),
            primary: get_optional_node_id(&mut cur)?,
            port: {
                cur.advance(32);
                cur.get_u16()
            },
            flags: NodeFlags::from_wire(cur.get_u16()),
            health: if cur.get_u8() == 0 {
                ClusterHealth::Ok
            } else {
                ClusterHealth::Fail
            },
            mflags: {
                let bits = cur.get_u8();
                cur.advance(2);
                ManualFailoverFlags {
                    paused: bits & MF_PAUSED != 0,
                    force_ack: bits & MF_FORCEACK != 0,
                }
            },
        };

        let actual = cur.len();
        let expect = |expected: usize| {
            if actual == expected {
                Ok(())
            } else {
                Err(FrameError::BodyLength {
                    kind,
                    expected,
                    actual,
                })
            }
        };

        let body = match kind {
            MessageType::Ping | MessageType::Pong | MessageType::Meet => {
                expect(count * GOSSIP_ENTRY_LEN)?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(decode_entry(&mut cur)?);
                }
                match kind {
                    MessageType::Ping => Body::Ping(entries),
                    MessageType::Pong => Body::Pong(entries),
                    _ => Body::Meet(entries),
                }
            }
            MessageType::Fail => {
                expect(FAIL_BODY_LEN)?;
                Body::Fail {
                    node: get_node_id(&mut cur)?,
                }
            }
            MessageType::Publish => {
                if actual < PUBLISH_FIXED_LEN {
                    expect(PUBLISH_FIXED_LEN)?;
                }
                let channel_len = cur.get_u32() as usize;
                let message_len = cur.get_u32() as usize;
                expect(
                    PUBLISH_FIXED_LEN
                        .saturating_add(channel_len)
                        .saturating_add(message_len),
                )?;
                let channel = Bytes::copy_from_slice(&cur[..channel_len]);
                cur.advance(channel_len);
                let message = Bytes::copy_from_slice(&cur[..message_len]);
                Body::Publish { channel, message }
            }
            MessageType::FailoverAuthRequest => {
                expect(0)?;
                Body::FailoverAuthRequest
            }
            MessageType::FailoverAuthAck => {
                expect(0)?;
                Body::FailoverAuthAck
            }
            MessageType::MfStart => {
                expect(0)?;
                Body::MfStart
            }
            MessageType::Update => {
                expect(UPDATE_BODY_LEN)?;
                Body::Update {
                    config_epoch: cur.get_u64(),
                    node: get_node_id(&mut cur)?,
                    slots: get_bitmap(&mut cur),
                }
            }
        };

        Ok(Message { header, body })
    }
}

/// Validates the first [`PREFIX_LEN`] bytes of a frame and returns its
/// declared total length.
///
/// Link readers call this before reading the rest of the frame.
pub fn frame_length(prefix: &[u8]) -> Result<usize, FrameError> {
    if prefix.len() < PREFIX_LEN {
        return Err(FrameError::Truncated {
            need: PREFIX_LEN,
            have: prefix.len(),
        });
    }
    if &prefix[..4] != SIGNATURE {
        return Err(FrameError::BadSignature);
    }
    let len = u32::from_be_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]) as usize;
    if len < HEADER_LEN {
        return Err(FrameError::TooShort(len));
    }
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    Ok(len)
}

fn encode_entry(buf: &mut BytesMut, entry: &GossipEntry) {
    buf.put_slice(&entry.node.to_name());
    buf.put_u32(entry.ping_sent);
    buf.put_u32(entry.pong_received);
    let ip = entry.ip.to_string();
    let ip = ip.as_bytes();
    let n = ip.len().min(IP_FIELD_LEN - 1);
    buf.put_slice(&ip[..n]);
    buf.put_bytes(0, IP_FIELD_LEN - n);
    buf.put_u16(entry.port);
    buf.put_u16(entry.flags.to_wire());
    buf.put_u16(0);
    buf.put_u32(0);
}

fn decode_entry(cur: &mut &[u8]) -> Result<GossipEntry, FrameError> {
    let node = get_node_id(cur)?;
    let ping_sent = cur.get_u32();
    let pong_received = cur.get_u32();
    let raw = &cur[..IP_FIELD_LEN];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(IP_FIELD_LEN);
    let ip = std::str::from_utf8(&raw[..end])
        .ok()
        .and_then(|s| s.parse::<IpAddr>().ok())
        .ok_or(FrameError::InvalidAddress)?;
    cur.advance(IP_FIELD_LEN);
    let port = cur.get_u16();
    let flags = NodeFlags::from_wire(cur.get_u16());
    cur.advance(6);
    Ok(GossipEntry {
        node,
        ping_sent,
        pong_received,
        ip,
        port,
        flags,
    })
}

fn get_node_id(cur: &mut &[u8]) -> Result<NodeId, FrameError> {
    let id = NodeId::from_name(&cur[..NODE_NAME_LEN]).ok_or(FrameError::InvalidNodeName)?;
    cur.advance(NODE_NAME_LEN);
    Ok(id)
}

fn get_optional_node_id(cur: &mut &[u8]) -> Result<Option<NodeId>, FrameError> {
    if cur[..NODE_NAME_LEN].iter().all(|&b| b == 0) {
        cur.advance(NODE_NAME_LEN);
        return Ok(None);
    }
    get_node_id(cur).map(Some)
}

fn get_bitmap(cur: &mut &[u8]) -> SlotBitmap {
    let mut bytes = [0u8; SLOT_BITMAP_LEN];
    cur.copy_to_slice(&mut bytes);
    SlotBitmap::from_bytes(&bytes)
}
