//! A relayed channel: content buffer, peer graph, the upstream source and every
//! downstream output, plus broadcast routing between them.

pub mod broadcast;
pub mod content;
pub mod info;
pub mod peers;

use {
    crate::{
        atom::Atom,
        session::ConnectionHandle,
        settings::RelaySettings,
        utils::{BroadcastId, ChannelId, SessionId},
    },
    broadcast::{BroadcastGroup, Outbox},
    content::{ChannelContentBuffer, ContentPacket},
    info::{ChannelInfo, ChannelTrack},
    parking_lot::{Mutex, RwLock},
    peers::{Node, PeerGraph},
    serde::Serialize,
    std::{
        collections::HashMap,
        net::SocketAddr,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc,
        },
        time::{Duration, Instant},
    },
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
    url::Url,
};

pub use broadcast::{route_broadcast, BroadcastDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Idle,
    Searching,
    Connecting,
    Receiving,
    Error,
    Closed,
}

impl ChannelStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Closed)
    }
}

/// What a downstream connection is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OutputKind {
    Relay,
    Direct,
}

pub type OutputId = u64;

struct OutputEntry {
    kind: OutputKind,
    group: BroadcastGroup,
    outbox: Arc<Outbox>,
    cancel: CancellationToken,
}

/// Everything one channel owns. Connections hold an `Arc<Channel>`; the channel
/// only keeps their outboxes and stop tokens.
pub struct Channel {
    id: ChannelId,
    local_session_id: SessionId,
    origin: Option<Url>,
    is_broadcasting: bool,
    broadcast_id: RwLock<BroadcastId>,
    info: RwLock<ChannelInfo>,
    track: RwLock<ChannelTrack>,
    info_changed: watch::Sender<u64>,
    content: ChannelContentBuffer,
    nodes: PeerGraph,
    source: Mutex<Option<ConnectionHandle>>,
    upstream: RwLock<Option<Arc<Outbox>>>,
    upstream_address: RwLock<Option<SocketAddr>>,
    outputs: Mutex<HashMap<OutputId, OutputEntry>>,
    next_output_id: AtomicU64,
    status: watch::Sender<ChannelStatus>,
    cancel: CancellationToken,
    created_at: Instant,
}

impl Channel {
    /// A channel relayed from `origin` (when known) or from peers found later.
    #[must_use]
    pub fn new(
        id: ChannelId,
        local_session_id: SessionId,
        origin: Option<Url>,
        settings: &RelaySettings,
    ) -> Self {
        Self::build(id, local_session_id, origin, false, settings)
    }

    /// A channel originated by this node; content comes from the local encoder.
    #[must_use]
    pub fn new_broadcast(
        id: ChannelId,
        local_session_id: SessionId,
        broadcast_id: BroadcastId,
        info: ChannelInfo,
        settings: &RelaySettings,
    ) -> Self {
        let channel = Self::build(id, local_session_id, None, true, settings);
        *channel.broadcast_id.write() = broadcast_id;
        *channel.info.write() = info;
        channel
    }

    fn build(
        id: ChannelId,
        local_session_id: SessionId,
        origin: Option<Url>,
        is_broadcasting: bool,
        settings: &RelaySettings,
    ) -> Self {
        let (info_changed, _) = watch::channel(0);
        let (status, _) = watch::channel(ChannelStatus::Idle);
        Self {
            id,
            local_session_id,
            origin,
            is_broadcasting,
            broadcast_id: RwLock::new(BroadcastId::nil()),
            info: RwLock::new(ChannelInfo::default()),
            track: RwLock::new(ChannelTrack::default()),
            info_changed,
            content: ChannelContentBuffer::new(settings.content_capacity),
            nodes: PeerGraph::new(settings.node_expiry()),
            source: Mutex::new(None),
            upstream: RwLock::new(None),
            upstream_address: RwLock::new(None),
            outputs: Mutex::new(HashMap::new()),
            next_output_id: AtomicU64::new(1),
            status,
            cancel: CancellationToken::new(),
            created_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ChannelId {
        self.id
    }

    #[must_use]
    pub const fn local_session_id(&self) -> SessionId {
        self.local_session_id
    }

    /// The designated origin (tracker) this channel was requested from.
    #[must_use]
    pub const fn origin(&self) -> Option<&Url> {
        self.origin.as_ref()
    }

    #[must_use]
    pub const fn is_broadcasting(&self) -> bool {
        self.is_broadcasting
    }

    #[must_use]
    pub fn broadcast_id(&self) -> BroadcastId {
        *self.broadcast_id.read()
    }

    pub fn set_broadcast_id(&self, broadcast_id: BroadcastId) {
        *self.broadcast_id.write() = broadcast_id;
    }

    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    // ---- metadata ----

    #[must_use]
    pub fn info(&self) -> ChannelInfo {
        self.info.read().clone()
    }

    #[must_use]
    pub fn track(&self) -> ChannelTrack {
        self.track.read().clone()
    }

    pub fn set_info(&self, info: ChannelInfo) {
        let changed = {
            let mut current = self.info.write();
            let changed = *current != info;
            *current = info;
            changed
        };
        if changed {
            self.notify_info();
        }
    }

    pub fn set_track(&self, track: ChannelTrack) {
        let changed = {
            let mut current = self.track.write();
            let changed = *current != track;
            *current = track;
            changed
        };
        if changed {
            self.notify_info();
        }
    }

    /// Merge a received `CHAN_INFO`.
    pub fn merge_info(&self, atom: &Atom) {
        if self.info.write().merge_atom(atom) {
            self.notify_info();
        }
    }

    /// Merge a received `CHAN_TRACK`.
    pub fn merge_track(&self, atom: &Atom) {
        if self.track.write().merge_atom(atom) {
            self.notify_info();
        }
    }

    #[must_use]
    pub fn subscribe_info(&self) -> watch::Receiver<u64> {
        self.info_changed.subscribe()
    }

    fn notify_info(&self) {
        self.info_changed
            .send_modify(|version| *version = version.wrapping_add(1));
    }

    // ---- content ----

    #[must_use]
    pub const fn content(&self) -> &ChannelContentBuffer {
        &self.content
    }

    #[must_use]
    pub const fn nodes(&self) -> &PeerGraph {
        &self.nodes
    }

    /// Record a node heard about on any connection, evicting expired ones first.
    /// Returns true when the node was not known before.
    pub fn add_node(&self, node: Node) -> bool {
        let expired = self.nodes.prune();
        if expired > 0 {
            tracing::debug!(channel_id = %self.id, expired, "expired nodes pruned");
        }
        self.nodes.upsert(node)
    }

    pub fn set_header(&self, header: ContentPacket) {
        self.content.set_header(header);
    }

    pub fn add_content(&self, packet: ContentPacket) -> bool {
        self.content.add(packet)
    }

    /// A header has arrived and the channel has not failed or closed.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.content.header().is_some() && !self.status().is_terminal()
    }

    // ---- status ----

    #[must_use]
    pub fn status(&self) -> ChannelStatus {
        *self.status.borrow()
    }

    /// Closed is final; later updates are ignored.
    pub fn set_status(&self, status: ChannelStatus) {
        self.status.send_if_modified(|current| {
            if *current == ChannelStatus::Closed || *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<ChannelStatus> {
        self.status.subscribe()
    }

    // ---- connections ----

    /// Token for a new connection: cancelled when the channel closes.
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Install a new source, stopping the one it replaces.
    pub fn start_source(&self, handle: ConnectionHandle) {
        if let Some(previous) = self.source.lock().replace(handle) {
            previous.stop();
        }
    }

    pub fn stop_source(&self) {
        if let Some(source) = self.source.lock().take() {
            source.stop();
        }
        self.set_upstream(None, None);
    }

    #[must_use]
    pub fn has_source(&self) -> bool {
        self.source
            .lock()
            .as_ref()
            .is_some_and(|source| !source.is_finished())
    }

    /// Outbox and address of the live upstream connection, if any.
    pub fn set_upstream(&self, outbox: Option<Arc<Outbox>>, address: Option<SocketAddr>) {
        *self.upstream.write() = outbox;
        *self.upstream_address.write() = address;
    }

    /// Forget the upstream if it is still `outbox`.
    pub fn release_upstream(&self, outbox: &Arc<Outbox>) {
        let mut upstream = self.upstream.write();
        if upstream
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, outbox))
        {
            *upstream = None;
            *self.upstream_address.write() = None;
        }
    }

    #[must_use]
    pub fn upstream_address(&self) -> Option<SocketAddr> {
        *self.upstream_address.read()
    }

    #[must_use]
    pub fn upstream_session_id(&self) -> Option<SessionId> {
        self.upstream.read().as_ref().and_then(|outbox| outbox.peer())
    }

    pub fn add_output(
        &self,
        kind: OutputKind,
        group: BroadcastGroup,
        outbox: Arc<Outbox>,
        cancel: CancellationToken,
    ) -> OutputId {
        let id = self.next_output_id.fetch_add(1, Ordering::Relaxed);
        self.outputs.lock().insert(
            id,
            OutputEntry {
                kind,
                group,
                outbox,
                cancel,
            },
        );
        id
    }

    pub fn set_output_group(&self, id: OutputId, group: BroadcastGroup) {
        if let Some(entry) = self.outputs.lock().get_mut(&id) {
            entry.group = group;
        }
    }

    pub fn remove_output(&self, id: OutputId) {
        self.outputs.lock().remove(&id);
    }

    #[must_use]
    pub fn output_count(&self, kind: OutputKind, excluding: Option<OutputId>) -> usize {
        self.outputs
            .lock()
            .iter()
            .filter(|(id, entry)| entry.kind == kind && Some(**id) != excluding)
            .count()
    }

    #[must_use]
    pub fn relay_count(&self) -> usize {
        self.output_count(OutputKind::Relay, None)
    }

    #[must_use]
    pub fn direct_count(&self) -> usize {
        self.output_count(OutputKind::Direct, None)
    }

    /// Hand `atom` to every connection in `group` except the one whose peer is `from`.
    /// The upstream counts as a member of the root and tracker groups.
    /// Returns how many connections queued it.
    pub fn broadcast(&self, from: Option<SessionId>, atom: &Atom, group: BroadcastGroup) -> usize {
        let mut targets: Vec<Arc<Outbox>> = self
            .outputs
            .lock()
            .values()
            .filter(|entry| entry.group.intersects(group))
            .map(|entry| entry.outbox.clone())
            .collect();
        if group.intersects(BroadcastGroup::TRACKERS | BroadcastGroup::ROOT) {
            if let Some(upstream) = self.upstream.read().clone() {
                targets.push(upstream);
            }
        }

        let delivered = targets
            .iter()
            .filter(|outbox| outbox.post(from, atom.clone()))
            .count();
        tracing::trace!(
            channel_id = %self.id,
            targets = targets.len(),
            delivered,
            "broadcast"
        );
        delivered
    }

    /// Stop the source and every output. The channel stays `Closed` afterwards.
    pub fn close(&self) {
        self.set_status(ChannelStatus::Closed);
        if let Some(source) = self.source.lock().take() {
            source.stop();
        }
        self.set_upstream(None, None);
        for entry in self.outputs.lock().values() {
            entry.cancel.cancel();
        }
        self.cancel.cancel();
        tracing::info!(channel_id = %self.id, "channel closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{atom::define::name, utils::Guid},
        broadcast::build_broadcast,
        peers::Host,
        tokio::sync::mpsc,
    };

    fn channel() -> Channel {
        Channel::new(Guid::new(), Guid::new(), None, &RelaySettings::default())
    }

    fn output(
        channel: &Channel,
        peer: SessionId,
        group: BroadcastGroup,
    ) -> (OutputId, mpsc::Receiver<Atom>) {
        let (outbox, rx) = Outbox::new(8);
        outbox.set_peer(peer);
        let id = channel.add_output(
            OutputKind::Relay,
            group,
            Arc::new(outbox),
            channel.child_token(),
        );
        (id, rx)
    }

    #[test]
    fn test_broadcast_skips_sender_and_other_groups() {
        let channel = channel();
        let x = Guid::new();
        let (_, mut rx_x) = output(&channel, x, BroadcastGroup::RELAYS);
        let (_, mut rx_y) = output(&channel, Guid::new(), BroadcastGroup::RELAYS);
        let (_, mut rx_z) = output(&channel, Guid::new(), BroadcastGroup::RELAYS);
        let (_, mut rx_t) = output(
            &channel,
            Guid::new(),
            BroadcastGroup::TRACKERS,
        );

        let atom = Atom::with_u32(name::OK, 1);
        assert_eq!(channel.broadcast(Some(x), &atom, BroadcastGroup::RELAYS), 2);
        assert!(rx_x.try_recv().is_err());
        assert_eq!(rx_y.try_recv().unwrap(), atom);
        assert_eq!(rx_z.try_recv().unwrap(), atom);
        assert!(rx_t.try_recv().is_err());
    }

    #[test]
    fn test_inbound_broadcast_is_flooded_once_per_member() {
        let channel = channel();
        let sender = Guid::new();
        let (_, mut rx_sender) = output(&channel, sender, BroadcastGroup::RELAYS);
        let (_, mut rx_y) = output(&channel, Guid::new(), BroadcastGroup::RELAYS);
        let (_, mut rx_z) = output(
            &channel,
            Guid::new(),
            BroadcastGroup::RELAYS | BroadcastGroup::TRACKERS,
        );
        let (_, mut rx_t) = output(&channel, Guid::new(), BroadcastGroup::TRACKERS);
        let (upstream, mut rx_up) = Outbox::new(8);
        upstream.set_peer(Guid::new());
        channel.set_upstream(Some(Arc::new(upstream)), None);

        let inbound = build_broadcast(
            Guid::new(),
            BroadcastGroup::RELAYS,
            Some(channel.id()),
            vec![Atom::with_children(name::HOST, vec![])],
        );
        let decision = route_broadcast(&inbound, channel.local_session_id());
        assert!(decision.deliver_locally);
        let forward = decision.forward.unwrap();
        assert_eq!(channel.broadcast(Some(sender), &forward, decision.group), 2);

        for rx in [&mut rx_y, &mut rx_z] {
            let copy = rx.try_recv().unwrap();
            assert_eq!(copy.get_u8(name::BCST_TTL), Some(10));
            assert_eq!(copy.get_u8(name::BCST_HOPS), Some(1));
            assert_eq!(copy.get_id(name::BCST_FROM), inbound.get_id(name::BCST_FROM));
            assert!(rx.try_recv().is_err());
        }
        assert!(rx_sender.try_recv().is_err());
        assert!(rx_t.try_recv().is_err());
        assert!(rx_up.try_recv().is_err());
    }

    #[test]
    fn test_origin_channel_expires_nodes() {
        let settings = RelaySettings {
            node_expiry_secs: 0,
            ..RelaySettings::default()
        };
        let channel = Channel::new_broadcast(
            Guid::new(),
            Guid::new(),
            Guid::new(),
            ChannelInfo::default(),
            &settings,
        );
        let stale = Node::new(Host::new(Guid::new()));
        let stale_id = stale.session_id();
        assert!(channel.add_node(stale));
        std::thread::sleep(Duration::from_millis(5));

        let fresh = Node::new(Host::new(Guid::new()));
        let fresh_id = fresh.session_id();
        assert!(channel.add_node(fresh));
        assert!(channel.nodes().get(&stale_id).is_none());
        assert!(channel.nodes().get(&fresh_id).is_some());
        assert_eq!(channel.nodes().len(), 1);
    }

    #[test]
    fn test_upstream_receives_tracker_broadcasts_only() {
        let channel = channel();
        let (outbox, mut rx) = Outbox::new(8);
        outbox.set_peer(Guid::new());
        channel.set_upstream(Some(Arc::new(outbox)), Some("203.0.113.1:7144".parse().unwrap()));
        assert!(channel.upstream_address().is_some());

        let atom = Atom::with_u32(name::OK, 2);
        assert_eq!(channel.broadcast(None, &atom, BroadcastGroup::RELAYS), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(
            channel.broadcast(None, &atom, BroadcastGroup::TRACKERS | BroadcastGroup::RELAYS),
            1
        );
        assert_eq!(rx.try_recv().unwrap(), atom);
    }

    #[test]
    fn test_output_counts() {
        let channel = channel();
        let (a, _rx_a) = output(&channel, Guid::new(), BroadcastGroup::RELAYS);
        let (_b, _rx_b) = output(&channel, Guid::new(), BroadcastGroup::RELAYS);
        assert_eq!(channel.relay_count(), 2);
        assert_eq!(channel.output_count(OutputKind::Relay, Some(a)), 1);
        assert_eq!(channel.direct_count(), 0);
        channel.remove_output(a);
        assert_eq!(channel.relay_count(), 1);
    }

    #[test]
    fn test_ready_and_close() {
        let channel = channel();
        assert!(!channel.is_ready());
        channel.set_header(ContentPacket::new(0, b"FLV".to_vec()));
        channel.set_status(ChannelStatus::Receiving);
        assert!(channel.is_ready());

        let token = channel.child_token();
        channel.close();
        assert!(token.is_cancelled());
        assert_eq!(channel.status(), ChannelStatus::Closed);
        assert!(!channel.is_ready());

        // closed is final
        channel.set_status(ChannelStatus::Receiving);
        assert_eq!(channel.status(), ChannelStatus::Closed);
    }

    #[test]
    fn test_info_change_notifies() {
        let channel = channel();
        let mut rx = channel.subscribe_info();
        channel.merge_info(&Atom::with_children(
            name::CHAN_INFO,
            vec![Atom::with_string(name::CHAN_INFO_NAME, "ch")],
        ));
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        channel.set_info(channel.info());
        assert!(!rx.has_changed().unwrap());
        assert_eq!(channel.info().name, "ch");
    }
}
