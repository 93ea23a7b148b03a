//! cinder-cluster: the coordination core of a cinder cluster.
//!
//! Every node keeps one [`ClusterView`]: who is in the cluster, which node
//! owns each of the 16384 hash slots, which nodes look failed, and which
//! replica should take over a failed primary. Nodes keep their views in
//! agreement by exchanging binary [`Message`]s over the cluster bus.
//!
//! # Architecture
//!
//! The crate does no I/O and reads no clocks. The caller feeds it:
//!
//! - **frames** received on bus links ([`ClusterView::handle_message`])
//! - **link events** ([`ClusterView::accept_link`], [`ClusterView::link_closed`])
//! - **ticks** every 100 ms ([`ClusterView::cron`])
//! - **admin commands** (meet, forget, add slots, failover, ...)
//!
//! and drains [`Outgoing`] actions and [`ClusterEvent`]s after each step.
//! This keeps every state machine deterministic under test.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use cinder_cluster::{ClusterConfig, ClusterView, QueryFlags, Redirect, unix_ms};
//!
//! let mut view = ClusterView::new(ClusterConfig::default(), "127.0.0.1:7000".parse()?, unix_ms());
//! view.add_slots(&(0..16384).collect::<Vec<_>>())?;
//! view.update_state(unix_ms());
//! assert_eq!(view.route(&[b"mykey"], QueryFlags::default()), Redirect::None);
//! ```

mod config;
mod error;
mod failover;
mod gossip;
mod keys;
mod message;
mod node;
mod ownership;
mod redirect;
mod registry;
mod slots;
mod snapshot;
mod time;
mod view;

pub use config::ClusterConfig;
pub use error::ClusterError;
pub use failover::{CantFailoverReason, ElectionPhase, ManualFailoverMode};
pub use keys::SlotKeyIndex;
pub use message::{
    frame_length, Body, FrameError, GossipEntry, Header, ManualFailoverFlags, Message,
    MessageType, HEADER_LEN, MAX_FRAME_LEN, PREFIX_LEN,
};
pub use node::{ClusterNode, FailReport, InvalidNodeId, LinkId, NodeFlags, NodeId};
pub use redirect::{QueryFlags, Redirect};
pub use slots::{check_slot, key_slot, SlotBitmap, SlotRange, SlotTable, SLOT_COUNT};
pub use snapshot::{ClusterSnapshot, ConfigParseError, NodeRecord};
pub use time::unix_ms;
pub use view::{BusStats, ClusterEvent, ClusterHealth, ClusterView, Outgoing, SaveRequest};
