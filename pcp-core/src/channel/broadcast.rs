use {
    crate::{
        atom::{
            define::{name, PCP_VERSION},
            Atom, AtomName,
        },
        utils::{ChannelId, SessionId},
    },
    parking_lot::RwLock,
    std::{
        ops::BitOr,
        sync::atomic::{AtomicU64, Ordering},
    },
    tokio::sync::mpsc,
};

/// Queued atoms per connection before new ones are dropped.
pub const OUTBOX_CAPACITY: usize = 256;
/// Hop budget of broadcasts originated by this node.
pub const DEFAULT_BROADCAST_TTL: u8 = 11;
/// How often to log per-connection drop warnings (every N drops).
const DROP_LOG_INTERVAL: u64 = 100;

const BCST_HEADER: [AtomName; 10] = [
    name::BCST_TTL,
    name::BCST_HOPS,
    name::BCST_FROM,
    name::BCST_DEST,
    name::BCST_GROUP,
    name::BCST_CHANID,
    name::BCST_VERSION,
    name::BCST_VERSION_VP,
    name::BCST_VERSION_EX_PREFIX,
    name::BCST_VERSION_EX_NUMBER,
];

const NOT_DELIVERABLE: [AtomName; 4] = [name::QUIT, name::HELO, name::OLEH, name::BCST];

/// Bitmask of peer roles a broadcast is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BroadcastGroup(u8);

impl BroadcastGroup {
    pub const NONE: Self = Self(0);
    pub const ROOT: Self = Self(0x01);
    pub const TRACKERS: Self = Self(0x02);
    pub const RELAYS: Self = Self(0x04);
    pub const ALL: Self = Self(0xFF);

    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// True when the two masks share at least one role.
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for BroadcastGroup {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What to do with a received `BCST`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastDecision {
    /// The payload is for this node.
    pub deliver_locally: bool,
    /// Copy to pass on, with TTL and hop count already adjusted.
    pub forward: Option<Atom>,
    pub group: BroadcastGroup,
    pub from: Option<SessionId>,
}

/// Apply the flood rule to a received `BCST` atom.
///
/// A broadcast that originated here is dropped. One addressed to this node is
/// delivered and goes no further; anything else is delivered when it has no
/// destination and forwarded while its TTL exceeds one.
#[must_use]
pub fn route_broadcast(atom: &Atom, local_session_id: SessionId) -> BroadcastDecision {
    let from = atom.get_id(name::BCST_FROM);
    let group = BroadcastGroup::from_bits(atom.get_u8(name::BCST_GROUP).unwrap_or(0));
    if from == Some(local_session_id) {
        return BroadcastDecision {
            deliver_locally: false,
            forward: None,
            group,
            from,
        };
    }

    let dest = atom.get_id(name::BCST_DEST);
    let to_me = dest == Some(local_session_id);
    let ttl = atom.get_u8(name::BCST_TTL).unwrap_or(0);
    let forward = if !to_me && ttl > 1 && group != BroadcastGroup::NONE {
        Some(next_hop(atom, ttl))
    } else {
        None
    };

    BroadcastDecision {
        deliver_locally: dest.is_none() || to_me,
        forward,
        group,
        from,
    }
}

fn next_hop(atom: &Atom, ttl: u8) -> Atom {
    let hops = atom.get_u8(name::BCST_HOPS).unwrap_or(0).saturating_add(1);
    let mut children: Vec<Atom> = atom
        .children()
        .iter()
        .map(|child| match child.name() {
            n if n == name::BCST_TTL => Atom::with_u8(n, ttl - 1),
            n if n == name::BCST_HOPS => Atom::with_u8(n, hops),
            _ => child.clone(),
        })
        .collect();
    if atom.child(name::BCST_HOPS).is_none() {
        children.push(Atom::with_u8(name::BCST_HOPS, hops));
    }
    Atom::with_children(name::BCST, children)
}

/// Children of a `BCST` that are not part of its routing header.
pub fn broadcast_payload(atom: &Atom) -> impl Iterator<Item = &Atom> {
    atom.children()
        .iter()
        .filter(|child| !BCST_HEADER.contains(&child.name()))
}

/// Payload children a receiving node applies as if sent directly. Session
/// control atoms and nested broadcasts are never honoured from a broadcast.
pub fn deliverable_payload(atom: &Atom) -> impl Iterator<Item = &Atom> {
    broadcast_payload(atom).filter(|child| !NOT_DELIVERABLE.contains(&child.name()))
}

/// Wrap `payload` in a fresh `BCST` originated by `from`.
#[must_use]
pub fn build_broadcast(
    from: SessionId,
    group: BroadcastGroup,
    channel_id: Option<ChannelId>,
    payload: Vec<Atom>,
) -> Atom {
    let mut children = vec![
        Atom::with_u8(name::BCST_TTL, DEFAULT_BROADCAST_TTL),
        Atom::with_u8(name::BCST_HOPS, 0),
        Atom::with_id(name::BCST_FROM, from),
        Atom::with_u8(name::BCST_GROUP, group.bits()),
    ];
    if let Some(channel_id) = channel_id {
        children.push(Atom::with_id(name::BCST_CHANID, channel_id));
    }
    children.push(Atom::with_u32(name::BCST_VERSION, PCP_VERSION));
    children.extend(payload);
    Atom::with_children(name::BCST, children)
}

/// Sending half of one connection's outbound queue.
///
/// Knows which peer sits at the other end so a broadcast is never handed back to
/// the connection it arrived on.
pub struct Outbox {
    peer: RwLock<Option<SessionId>>,
    sender: mpsc::Sender<Atom>,
    dropped: AtomicU64,
}

impl Outbox {
    #[must_use]
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Atom>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                peer: RwLock::new(None),
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    pub fn set_peer(&self, session_id: SessionId) {
        *self.peer.write() = Some(session_id);
    }

    #[must_use]
    pub fn peer(&self) -> Option<SessionId> {
        *self.peer.read()
    }

    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue `atom` unless it came from this connection's own peer.
    /// Returns whether the atom was queued.
    pub fn post(&self, from: Option<SessionId>, atom: Atom) -> bool {
        if from.is_some() && from == self.peer() {
            return false;
        }
        match self.sender.try_send(atom) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let prev = self.dropped.fetch_add(1, Ordering::Relaxed);
                if (prev + 1) % DROP_LOG_INTERVAL == 1 {
                    tracing::warn!(
                        peer = ?self.peer(),
                        "outbound queue full, dropped {} atoms so far",
                        prev + 1
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Guid;

    fn bcst(ttl: u8, hops: u8, from: SessionId, dest: Option<SessionId>) -> Atom {
        let mut children = vec![
            Atom::with_u8(name::BCST_TTL, ttl),
            Atom::with_u8(name::BCST_HOPS, hops),
            Atom::with_id(name::BCST_FROM, from),
            Atom::with_u8(name::BCST_GROUP, BroadcastGroup::RELAYS.bits()),
        ];
        if let Some(dest) = dest {
            children.push(Atom::with_id(name::BCST_DEST, dest));
        }
        children.push(Atom::with_children(
            name::HOST,
            vec![Atom::with_id(name::HOST_ID, from)],
        ));
        Atom::with_children(name::BCST, children)
    }

    #[test]
    fn test_ttl_one_is_not_forwarded() {
        let local = Guid::new();
        let decision = route_broadcast(&bcst(1, 4, Guid::new(), None), local);
        assert!(decision.deliver_locally);
        assert!(decision.forward.is_none());
    }

    #[test]
    fn test_ttl_two_is_forwarded_once_adjusted() {
        let local = Guid::new();
        let original = bcst(2, 3, Guid::new(), None);
        let decision = route_broadcast(&original, local);
        let forward = decision.forward.unwrap();
        assert_eq!(forward.get_u8(name::BCST_TTL), Some(1));
        assert_eq!(forward.get_u8(name::BCST_HOPS), Some(4));
        assert_eq!(decision.group, BroadcastGroup::RELAYS);
        // payload travels unchanged
        assert_eq!(forward.child(name::HOST), original.child(name::HOST));
        assert_eq!(forward.get_id(name::BCST_FROM), original.get_id(name::BCST_FROM));
        assert_eq!(broadcast_payload(&forward).count(), 1);
    }

    #[test]
    fn test_destination_rules() {
        let local = Guid::new();
        let other = Guid::new();

        let to_me = route_broadcast(&bcst(5, 0, Guid::new(), Some(local)), local);
        assert!(to_me.deliver_locally);
        assert!(to_me.forward.is_none());

        let to_other = route_broadcast(&bcst(5, 0, Guid::new(), Some(other)), local);
        assert!(!to_other.deliver_locally);
        assert!(to_other.forward.is_some());

        let own = route_broadcast(&bcst(5, 0, local, None), local);
        assert!(!own.deliver_locally);
        assert!(own.forward.is_none());
    }

    #[test]
    fn test_missing_hops_is_added() {
        let atom = Atom::with_children(
            name::BCST,
            vec![
                Atom::with_u8(name::BCST_TTL, 3),
                Atom::with_u8(name::BCST_GROUP, BroadcastGroup::ALL.bits()),
            ],
        );
        let forward = route_broadcast(&atom, Guid::new()).forward.unwrap();
        assert_eq!(forward.get_u8(name::BCST_HOPS), Some(1));
        assert_eq!(forward.get_u8(name::BCST_TTL), Some(2));
    }

    #[test]
    fn test_build_broadcast_header() {
        let from = Guid::new();
        let cid = Guid::new();
        let atom = build_broadcast(
            from,
            BroadcastGroup::TRACKERS | BroadcastGroup::RELAYS,
            Some(cid),
            vec![Atom::with_children(name::HOST, vec![])],
        );
        assert_eq!(atom.get_u8(name::BCST_TTL), Some(DEFAULT_BROADCAST_TTL));
        assert_eq!(atom.get_u8(name::BCST_HOPS), Some(0));
        assert_eq!(atom.get_id(name::BCST_FROM), Some(from));
        assert_eq!(atom.get_id(name::BCST_CHANID), Some(cid));
        assert_eq!(atom.get_u8(name::BCST_GROUP), Some(0x06));
        let payload: Vec<_> = broadcast_payload(&atom).collect();
        assert_eq!(payload.len(), 1);
        assert_eq!(payload[0].name(), name::HOST);
    }

    #[test]
    fn test_deliverable_payload_skips_session_control() {
        let atom = build_broadcast(
            Guid::new(),
            BroadcastGroup::RELAYS,
            None,
            vec![
                Atom::with_children(name::CHAN_INFO, vec![]),
                Atom::with_u32(name::QUIT, 1000),
                Atom::with_children(name::HELO, vec![]),
                Atom::with_children(name::OLEH, vec![]),
                bcst(3, 0, Guid::new(), None),
                Atom::with_children(name::HOST, vec![]),
            ],
        );
        assert_eq!(broadcast_payload(&atom).count(), 6);
        let names: Vec<_> = deliverable_payload(&atom).map(Atom::name).collect();
        assert_eq!(names, vec![name::CHAN_INFO, name::HOST]);
    }

    #[tokio::test]
    async fn test_outbox_skips_own_peer_and_drops_when_full() {
        let (outbox, mut rx) = Outbox::new(2);
        let peer = Guid::new();
        outbox.set_peer(peer);

        assert!(!outbox.post(Some(peer), Atom::with_u8(name::OK, 0)));
        assert!(outbox.post(Some(Guid::new()), Atom::with_u8(name::OK, 1)));
        assert!(outbox.post(None, Atom::with_u8(name::OK, 2)));
        assert!(!outbox.post(None, Atom::with_u8(name::OK, 3)));
        assert_eq!(outbox.dropped(), 1);

        assert_eq!(rx.recv().await.unwrap().as_u8().unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().as_u8().unwrap(), 2);
        drop(rx);
        assert!(outbox.is_closed());
        assert!(!outbox.post(None, Atom::with_u8(name::OK, 4)));
    }
}
