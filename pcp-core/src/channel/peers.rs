use {
    crate::{
        atom::{
            define::{host_flags, name, PCP_VERSION},
            Atom, AtomName,
        },
        utils::{BroadcastId, ChannelId, SessionId},
    },
    indexmap::IndexMap,
    parking_lot::Mutex,
    std::{
        net::{IpAddr, SocketAddr},
        sync::atomic::{AtomicU64, Ordering},
        time::{Duration, Instant},
    },
};

/// HOST children interpreted by [`Node::from_host_atom`]; anything else is kept
/// verbatim in `extra`.
const KNOWN_HOST_CHILDREN: [AtomName; 14] = [
    name::HOST_ID,
    name::HOST_IP,
    name::HOST_PORT,
    name::HOST_NUML,
    name::HOST_NUMR,
    name::HOST_UPTIME,
    name::HOST_CHANID,
    name::HOST_VERSION,
    name::HOST_OLDPOS,
    name::HOST_NEWPOS,
    name::HOST_FLAGS1,
    name::HOST_UPHOST_IP,
    name::HOST_UPHOST_PORT,
    name::HOST_UPHOST_HOPS,
];

/// Address and capability snapshot of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Host {
    pub session_id: SessionId,
    pub broadcast_id: BroadcastId,
    /// Reachable endpoints, global address first.
    pub addresses: Vec<SocketAddr>,
    pub is_firewalled: bool,
    pub is_tracker: bool,
    pub relay_count: u32,
    pub direct_count: u32,
    pub version: Option<u32>,
    /// Unrecognised attributes, re-sent as received.
    pub extra: Vec<Atom>,
}

impl Host {
    #[must_use]
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            broadcast_id: BroadcastId::nil(),
            addresses: Vec::new(),
            is_firewalled: false,
            is_tracker: false,
            relay_count: 0,
            direct_count: 0,
            version: None,
            extra: Vec::new(),
        }
    }

    #[must_use]
    pub fn global_address(&self) -> Option<SocketAddr> {
        self.addresses.first().copied()
    }
}

/// A [`Host`] as seen inside one channel's relay graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub host: Host,
    pub uphost: Option<SocketAddr>,
    pub uphost_hops: u32,
    pub is_relay_full: bool,
    pub is_direct_full: bool,
    pub is_receiving: bool,
    pub is_control_full: bool,
    pub old_position: u32,
    pub new_position: u32,
    pub uptime_secs: u32,
    pub last_seen: Instant,
}

impl Node {
    #[must_use]
    pub fn new(host: Host) -> Self {
        Self {
            host,
            uphost: None,
            uphost_hops: 0,
            is_relay_full: false,
            is_direct_full: false,
            is_receiving: false,
            is_control_full: false,
            old_position: 0,
            new_position: 0,
            uptime_secs: 0,
            last_seen: Instant::now(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.host.session_id
    }

    /// Can be asked to relay: reachable, has room and is itself receiving.
    #[must_use]
    pub fn is_relay_candidate(&self) -> bool {
        !self.host.is_firewalled
            && !self.is_relay_full
            && self.is_receiving
            && self.host.global_address().is_some()
    }

    #[must_use]
    pub fn flags1(&self) -> u8 {
        let mut flags = 0;
        if self.host.is_tracker {
            flags |= host_flags::TRACKER;
        }
        if !self.is_relay_full {
            flags |= host_flags::RELAY;
        }
        if !self.is_direct_full {
            flags |= host_flags::DIRECT;
        }
        if self.host.is_firewalled {
            flags |= host_flags::PUSH;
        }
        if self.is_receiving {
            flags |= host_flags::RECV;
        }
        if !self.is_control_full {
            flags |= host_flags::CIN;
        }
        flags
    }

    fn apply_flags1(&mut self, flags: u8) {
        self.host.is_tracker = flags & host_flags::TRACKER != 0;
        self.is_relay_full = flags & host_flags::RELAY == 0;
        self.is_direct_full = flags & host_flags::DIRECT == 0;
        self.host.is_firewalled = flags & host_flags::PUSH != 0;
        self.is_receiving = flags & host_flags::RECV != 0;
        self.is_control_full = flags & host_flags::CIN == 0;
    }

    /// Parse a `HOST` atom. Returns `None` when the atom carries no session id.
    /// Malformed optional attributes are skipped.
    #[must_use]
    pub fn from_host_atom(atom: &Atom) -> Option<(Option<ChannelId>, Self)> {
        let session_id = atom.get_id(name::HOST_ID)?;
        let mut node = Self::new(Host::new(session_id));

        let mut pending_ip: Option<IpAddr> = None;
        for child in atom.children() {
            let child_name = child.name();
            if child_name == name::HOST_IP {
                pending_ip = child.as_ip().ok();
            } else if child_name == name::HOST_PORT {
                if let (Some(ip), Ok(port)) = (pending_ip.take(), child.as_u16()) {
                    node.host.addresses.push(SocketAddr::new(ip, port));
                }
            } else if !KNOWN_HOST_CHILDREN.contains(&child_name) {
                node.host.extra.push(child.clone());
            }
        }

        node.host.relay_count = atom.get_u32(name::HOST_NUMR).unwrap_or(0);
        node.host.direct_count = atom.get_u32(name::HOST_NUML).unwrap_or(0);
        node.host.version = atom.get_u32(name::HOST_VERSION);
        node.uptime_secs = atom.get_u32(name::HOST_UPTIME).unwrap_or(0);
        node.old_position = atom.get_u32(name::HOST_OLDPOS).unwrap_or(0);
        node.new_position = atom.get_u32(name::HOST_NEWPOS).unwrap_or(0);
        if let Some(flags) = atom.get_u8(name::HOST_FLAGS1) {
            node.apply_flags1(flags);
        }
        if let (Some(ip), Some(port)) = (
            atom.get_ip(name::HOST_UPHOST_IP),
            atom.get_u16(name::HOST_UPHOST_PORT),
        ) {
            node.uphost = Some(SocketAddr::new(ip, port));
            node.uphost_hops = atom.get_u32(name::HOST_UPHOST_HOPS).unwrap_or(0);
        }

        Some((atom.get_id(name::HOST_CHANID), node))
    }

    #[must_use]
    pub fn to_host_atom(&self, channel_id: ChannelId) -> Atom {
        let mut children = vec![
            Atom::with_id(name::HOST_CHANID, channel_id),
            Atom::with_id(name::HOST_ID, self.host.session_id),
        ];
        for addr in &self.host.addresses {
            children.push(Atom::with_ip(name::HOST_IP, addr.ip()));
            children.push(Atom::with_u16(name::HOST_PORT, addr.port()));
        }
        children.extend([
            Atom::with_u32(name::HOST_NUMR, self.host.relay_count),
            Atom::with_u32(name::HOST_NUML, self.host.direct_count),
            Atom::with_u32(name::HOST_UPTIME, self.uptime_secs),
            Atom::with_u32(name::HOST_VERSION, self.host.version.unwrap_or(PCP_VERSION)),
            Atom::with_u32(name::HOST_OLDPOS, self.old_position),
            Atom::with_u32(name::HOST_NEWPOS, self.new_position),
            Atom::with_u8(name::HOST_FLAGS1, self.flags1()),
        ]);
        if let Some(uphost) = self.uphost {
            children.push(Atom::with_ip(name::HOST_UPHOST_IP, uphost.ip()));
            children.push(Atom::with_u16(name::HOST_UPHOST_PORT, uphost.port()));
            children.push(Atom::with_u32(name::HOST_UPHOST_HOPS, self.uphost_hops));
        }
        children.extend(self.host.extra.iter().cloned());
        Atom::with_children(name::HOST, children)
    }
}

/// Relay nodes known for one channel, keyed by session id in discovery order.
pub struct PeerGraph {
    nodes: Mutex<IndexMap<SessionId, Node>>,
    expiry: Duration,
    version: AtomicU64,
}

impl PeerGraph {
    #[must_use]
    pub fn new(expiry: Duration) -> Self {
        Self {
            nodes: Mutex::new(IndexMap::new()),
            expiry,
            version: AtomicU64::new(0),
        }
    }

    /// Insert or refresh a node. A refreshed node keeps its discovery slot.
    /// Returns true when the node was not known before.
    pub fn upsert(&self, mut node: Node) -> bool {
        node.last_seen = Instant::now();
        let is_new = self
            .nodes
            .lock()
            .insert(node.session_id(), node)
            .is_none();
        self.version.fetch_add(1, Ordering::Relaxed);
        is_new
    }

    #[must_use]
    pub fn get(&self, session_id: &SessionId) -> Option<Node> {
        self.nodes.lock().get(session_id).cloned()
    }

    pub fn remove(&self, session_id: &SessionId) -> Option<Node> {
        let removed = self.nodes.lock().shift_remove(session_id);
        if removed.is_some() {
            self.version.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Snapshot in discovery order.
    #[must_use]
    pub fn nodes(&self) -> Vec<Node> {
        self.nodes.lock().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.lock().is_empty()
    }

    /// Bumped on every change; compare against a saved value to detect changes.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Evict nodes not refreshed within the expiry window. Returns how many went.
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let expiry = self.expiry;
        let removed = {
            let mut nodes = self.nodes.lock();
            let before = nodes.len();
            nodes.retain(|_, node| now.saturating_duration_since(node.last_seen) <= expiry);
            before - nodes.len()
        };
        if removed > 0 {
            self.version.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Nodes worth offering to a peer we cannot serve ourselves: relay candidates
    /// first, then everything else, both in discovery order.
    #[must_use]
    pub fn select_alternates(&self, exclude: Option<SessionId>, max: usize) -> Vec<Node> {
        let nodes = self.nodes.lock();
        let (preferred, rest): (Vec<&Node>, Vec<&Node>) = nodes
            .values()
            .filter(|node| Some(node.session_id()) != exclude)
            .partition(|node| node.is_relay_candidate());
        preferred
            .into_iter()
            .chain(rest)
            .take(max)
            .cloned()
            .collect()
    }

    /// Relay candidates accepted by `allow`, in discovery order.
    pub fn relay_candidates(&self, allow: impl Fn(&Node) -> bool) -> Vec<Node> {
        self.nodes
            .lock()
            .values()
            .filter(|node| node.is_relay_candidate() && allow(node))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Guid;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn candidate(port: u16) -> Node {
        let mut host = Host::new(Guid::new());
        host.addresses.push(addr(&format!("203.0.113.1:{port}")));
        let mut node = Node::new(host);
        node.is_receiving = true;
        node
    }

    #[test]
    fn test_host_atom_round_trip_keeps_unknown_children() {
        let channel_id = Guid::new();
        let mut node = candidate(7144);
        node.host.addresses.push(addr("192.168.0.5:7144"));
        node.host.relay_count = 3;
        node.host.is_tracker = true;
        node.is_direct_full = true;
        node.uphost = Some(addr("198.51.100.7:7145"));
        node.uphost_hops = 2;
        node.new_position = 4096;
        node.host
            .extra
            .push(Atom::with_string(AtomName::new(b"xtra"), "kept"));

        let atom = node.to_host_atom(channel_id);
        let (cid, parsed) = Node::from_host_atom(&atom).unwrap();
        assert_eq!(cid, Some(channel_id));
        assert_eq!(parsed.host.addresses, node.host.addresses);
        assert_eq!(parsed.host.relay_count, 3);
        assert!(parsed.host.is_tracker);
        assert!(parsed.is_direct_full);
        assert!(!parsed.is_relay_full);
        assert!(parsed.is_receiving);
        assert_eq!(parsed.uphost, node.uphost);
        assert_eq!(parsed.uphost_hops, 2);
        assert_eq!(parsed.new_position, 4096);
        assert_eq!(parsed.host.extra, node.host.extra);
        assert_eq!(parsed.to_host_atom(channel_id), atom);
    }

    #[test]
    fn test_flags1_layout() {
        let mut node = candidate(1);
        node.host.is_firewalled = true;
        node.is_relay_full = true;
        assert_eq!(
            node.flags1(),
            host_flags::DIRECT | host_flags::PUSH | host_flags::RECV | host_flags::CIN
        );
        assert!(!node.is_relay_candidate());
    }

    #[test]
    fn test_host_without_id_is_skipped() {
        let atom = Atom::with_children(name::HOST, vec![Atom::with_u32(name::HOST_NUMR, 1)]);
        assert!(Node::from_host_atom(&atom).is_none());

        // a malformed port drops only that endpoint
        let atom = Atom::with_children(
            name::HOST,
            vec![
                Atom::with_id(name::HOST_ID, Guid::new()),
                Atom::with_ip(name::HOST_IP, "203.0.113.9".parse().unwrap()),
                Atom::with_u8(name::HOST_PORT, 1),
                Atom::with_u32(name::HOST_NUMR, 4),
            ],
        );
        let (_, node) = Node::from_host_atom(&atom).unwrap();
        assert!(node.host.addresses.is_empty());
        assert_eq!(node.host.relay_count, 4);
    }

    #[test]
    fn test_upsert_keeps_discovery_order() {
        let graph = PeerGraph::new(Duration::from_secs(60));
        let a = candidate(1);
        let b = candidate(2);
        assert!(graph.upsert(a.clone()));
        assert!(graph.upsert(b.clone()));
        let version = graph.version();

        let mut refreshed = a.clone();
        refreshed.host.relay_count = 9;
        assert!(!graph.upsert(refreshed));
        assert!(graph.version() > version);

        let nodes = graph.nodes();
        assert_eq!(nodes[0].session_id(), a.session_id());
        assert_eq!(nodes[0].host.relay_count, 9);
        assert_eq!(nodes[1].session_id(), b.session_id());
    }

    #[test]
    fn test_prune_evicts_stale_nodes() {
        let graph = PeerGraph::new(Duration::from_secs(10));
        let a = candidate(1);
        graph.upsert(a.clone());
        graph.upsert(candidate(2));
        assert_eq!(graph.prune(), 0);
        assert_eq!(graph.prune_at(Instant::now() + Duration::from_secs(11)), 2);
        assert!(graph.is_empty());
        assert!(graph.get(&a.session_id()).is_none());
    }

    #[test]
    fn test_select_alternates_order_and_limit() {
        let graph = PeerGraph::new(Duration::from_secs(60));
        let mut firewalled = candidate(1);
        firewalled.host.is_firewalled = true;
        let good1 = candidate(2);
        let mut full = candidate(3);
        full.is_relay_full = true;
        let good2 = candidate(4);
        let requester = candidate(5);
        for node in [&firewalled, &good1, &full, &good2, &requester] {
            graph.upsert(node.clone());
        }

        let picked: Vec<_> = graph
            .select_alternates(Some(requester.session_id()), 8)
            .iter()
            .map(Node::session_id)
            .collect();
        assert_eq!(
            picked,
            vec![
                good1.session_id(),
                good2.session_id(),
                firewalled.session_id(),
                full.session_id()
            ]
        );
        assert_eq!(graph.select_alternates(None, 3).len(), 3);

        let skip = good1.session_id();
        let candidates = graph.relay_candidates(|node| node.session_id() != skip);
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].session_id(), good2.session_id());
    }
}
