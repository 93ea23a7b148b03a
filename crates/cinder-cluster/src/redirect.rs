//! Query routing: decides whether a request can be served here or where
//! the client must go instead.
//!
//! Classification is a pure function of the keys, the request flags and
//! the current view.

use std::net::SocketAddr;

use crate::error::ClusterError;
use crate::node::NodeId;
use crate::slots::key_slot;
use crate::view::{ClusterHealth, ClusterView};

/// Per-request state that affects routing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags {
    /// The client sent ASKING before this command.
    pub asking: bool,
    /// The connection is in READONLY mode.
    pub readonly: bool,
    /// The command only reads.
    pub is_read: bool,
}

/// Outcome of routing one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Redirect {
    /// Serve it here.
    None,
    CrossSlot,
    /// Multi-key request on a slot being migrated with only part of the
    /// keys present.
    TryAgain,
    Ask { slot: u16, addr: SocketAddr },
    Moved { slot: u16, addr: SocketAddr },
    DownState,
    DownUnbound,
}

impl Redirect {
    /// The client-visible error, `None` when the request is served.
    pub fn to_error(self) -> Option<ClusterError> {
        match self {
            Redirect::None => None,
            Redirect::CrossSlot => Some(ClusterError::CrossSlot),
            Redirect::TryAgain => Some(ClusterError::TryAgain),
            Redirect::Ask { slot, addr } => Some(ClusterError::ask(slot, addr)),
            Redirect::Moved { slot, addr } => Some(ClusterError::moved(slot, addr)),
            Redirect::DownState => Some(ClusterError::ClusterDown),
            Redirect::DownUnbound => Some(ClusterError::SlotNotServed),
        }
    }
}

impl ClusterView {
    /// Routes a request touching `keys`. Requests without keys are served
    /// locally.
    pub fn route<K: AsRef<[u8]>>(&self, keys: &[K], flags: QueryFlags) -> Redirect {
        let Some(first) = keys.first() else {
            return Redirect::None;
        };
        let slot = key_slot(first.as_ref());
        if keys.iter().any(|k| key_slot(k.as_ref()) != slot) {
            return Redirect::CrossSlot;
        }
        let transient =
            self.slots.migrating_to(slot).is_some() || self.slots.importing_from(slot).is_some();
        let missing = if transient {
            keys.iter().filter(|k| !self.keys.contains(k.as_ref())).count()
        } else {
            0
        };
        self.classify(slot, keys.len(), missing, flags)
    }

    /// Routes a request addressing `slot` directly, as if every key it
    /// touches were present.
    pub fn route_slot(&self, slot: u16, flags: QueryFlags) -> Redirect {
        self.classify(slot, 1, 0, flags)
    }

    fn classify(&self, slot: u16, total: usize, missing: usize, flags: QueryFlags) -> Redirect {
        if self.health == ClusterHealth::Fail && self.config.require_full_coverage {
            return Redirect::DownState;
        }
        let Some(owner) = self.slots.owner(slot) else {
            return Redirect::DownUnbound;
        };
        let multi = total > 1;

        if owner == self.myself {
            if let Some(target) = self.slots.migrating_to(slot) {
                if missing > 0 {
                    if multi && missing < total {
                        return Redirect::TryAgain;
                    }
                    return match self.client_addr(target) {
                        Some(addr) => Redirect::Ask { slot, addr },
                        None => Redirect::DownUnbound,
                    };
                }
            }
            return Redirect::None;
        }

        if self.slots.importing_from(slot).is_some() && flags.asking {
            if multi && missing > 0 {
                return Redirect::TryAgain;
            }
            return Redirect::None;
        }

        let me = self.myself();
        if flags.readonly && flags.is_read && me.is_replica() && me.primary == Some(owner) {
            return Redirect::None;
        }

        match self.client_addr(owner) {
            Some(addr) => Redirect::Moved { slot, addr },
            None => Redirect::DownUnbound,
        }
    }

    fn client_addr(&self, id: NodeId) -> Option<SocketAddr> {
        self.nodes.get(&id).and_then(|n| n.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slots::SLOT_COUNT;
    use crate::view::tests::{add_primary, addr, id, view_as, T0};
    use bytes::Bytes;

    /// `id(1)` owning every slot except 42, which belongs to `id(2)`.
    fn routed_view() -> ClusterView {
        let mut view = view_as(1);
        add_primary(&mut view, 2);
        let mine: Vec<u16> = (0..SLOT_COUNT).filter(|s| *s != 42).collect();
        view.add_slots(&mine).unwrap();
        view.assign_slot(42, id(2), 1).unwrap();
        view.update_state(T0 + 5000);
        assert_eq!(view.health(), ClusterHealth::Ok);
        view
    }

    const KEY_IN_42: &[u8] = b"{t18754}x";

    #[test]
    fn keyless_and_local_requests_are_served() {
        let view = routed_view();
        let none: [&[u8]; 0] = [];
        assert_eq!(view.route(&none, QueryFlags::default()), Redirect::None);
        assert_eq!(view.route(&[b"foo"], QueryFlags::default()), Redirect::None);
    }

    #[test]
    fn foreign_slot_is_moved() {
        let view = routed_view();
        assert_eq!(key_slot(KEY_IN_42), 42);
        let redirect = view.route(&[KEY_IN_42], QueryFlags::default());
        assert_eq!(
            redirect,
            Redirect::Moved {
                slot: 42,
                addr: addr(7002)
            }
        );
        assert_eq!(
            redirect.to_error().unwrap().to_string(),
            "MOVED 42 127.0.0.1:7002"
        );
        assert_eq!(view.route(&[KEY_IN_42], QueryFlags::default()), redirect);
    }

    #[test]
    fn keys_in_different_slots_are_cross_slot() {
        let view = routed_view();
        assert_eq!(
            view.route(&[&b"{t10648}a"[..], &b"{t18065}b"[..]], QueryFlags::default()),
            Redirect::CrossSlot
        );
        // even when one of them would be moved
        assert_eq!(
            view.route(&[&b"foo"[..], KEY_IN_42], QueryFlags::default()),
            Redirect::CrossSlot
        );
    }

    #[test]
    fn down_cluster_refuses_requests() {
        let mut view = view_as(1);
        assert_eq!(view.route(&[b"foo"], QueryFlags::default()), Redirect::DownState);
        view.config.require_full_coverage = false;
        assert_eq!(view.route(&[b"foo"], QueryFlags::default()), Redirect::DownUnbound);
        assert_eq!(
            Redirect::DownUnbound.to_error(),
            Some(ClusterError::SlotNotServed)
        );
    }

    #[test]
    fn migrating_slot_asks_for_moved_keys() {
        let mut view = routed_view();
        view.start_migrating_to(500, id(2)).unwrap();
        view.keys_mut().insert(Bytes::from_static(b"{t9919}here"));

        assert_eq!(
            view.route(&[b"{t9919}k"], QueryFlags::default()),
            Redirect::Ask {
                slot: 500,
                addr: addr(7002)
            }
        );
        assert_eq!(
            view.route(&[b"{t9919}here"], QueryFlags::default()),
            Redirect::None
        );
        assert_eq!(
            view.route(&[&b"{t9919}here"[..], &b"{t9919}k"[..]], QueryFlags::default()),
            Redirect::TryAgain
        );
    }

    #[test]
    fn importing_slot_needs_asking() {
        let mut view = routed_view();
        view.start_importing_from(42, id(2)).unwrap();
        let asking = QueryFlags {
            asking: true,
            ..QueryFlags::default()
        };

        assert!(matches!(
            view.route(&[KEY_IN_42], QueryFlags::default()),
            Redirect::Moved { slot: 42, .. }
        ));
        assert_eq!(view.route(&[KEY_IN_42], asking), Redirect::None);
        assert_eq!(
            view.route(&[KEY_IN_42, &b"{t18754}y"[..]], asking),
            Redirect::TryAgain
        );
    }

    #[test]
    fn readonly_replica_serves_reads_of_its_primary() {
        let mut view = view_as(3);
        add_primary(&mut view, 2);
        view.config.require_full_coverage = false;
        view.assign_slot(42, id(2), 1).unwrap();
        view.set_primary(id(3), id(2));
        view.update_state(T0);

        let read = QueryFlags {
            readonly: true,
            is_read: true,
            ..QueryFlags::default()
        };
        assert_eq!(view.route(&[KEY_IN_42], read), Redirect::None);
        let write = QueryFlags {
            readonly: true,
            ..QueryFlags::default()
        };
        assert!(matches!(view.route(&[KEY_IN_42], write), Redirect::Moved { .. }));
    }
}
