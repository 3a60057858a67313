//! Application root: node identity, channel registry and protocol registries.

use {
    crate::{
        access::{AccessController, ChannelMap},
        atom::define::PCP_VERSION,
        channel::{
            info::ChannelInfo,
            peers::{Host, Node},
            Channel, ChannelStatus,
        },
        registry::{OutputStreamRegistry, SourceStreamRegistry},
        session::{
            direct::DirectOutputFactory, handshake::HeloPort, output::RelayOutputFactory,
            pong::PongOutputFactory, source::PcpSourceFactory,
        },
        settings::RelaySettings,
        utils::{BroadcastId, ChannelId, Guid, SessionId},
    },
    dashmap::{mapref::entry::Entry, DashMap},
    parking_lot::RwLock,
    serde::Serialize,
    std::{
        net::{IpAddr, SocketAddr},
        sync::{
            atomic::{AtomicU16, Ordering},
            Arc,
        },
        time::Instant,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FirewallState {
    Unknown,
    Open,
    Firewalled,
}

pub struct PeerCast {
    session_id: SessionId,
    broadcast_id: BroadcastId,
    settings: RelaySettings,
    listen_port: AtomicU16,
    global_address: RwLock<Option<IpAddr>>,
    firewall: RwLock<FirewallState>,
    channels: ChannelMap,
    access: AccessController,
    output_factories: OutputStreamRegistry,
    source_factories: SourceStreamRegistry,
    cancel: CancellationToken,
    started_at: Instant,
}

impl PeerCast {
    /// A node with the PCP relay, player, pong and source handlers registered.
    #[must_use]
    pub fn new(settings: RelaySettings) -> Arc<Self> {
        let peercast = Self::bare(settings);
        peercast
            .output_factories
            .register(Arc::new(RelayOutputFactory));
        peercast
            .output_factories
            .register(Arc::new(DirectOutputFactory));
        peercast
            .output_factories
            .register(Arc::new(PongOutputFactory));
        peercast
            .source_factories
            .register(Arc::new(PcpSourceFactory));
        Arc::new(peercast)
    }

    /// A node with empty registries.
    #[must_use]
    pub fn bare(settings: RelaySettings) -> Self {
        let channels: ChannelMap = Arc::new(DashMap::new());
        Self {
            session_id: Guid::new(),
            broadcast_id: Guid::new(),
            access: AccessController::new(channels.clone(), &settings),
            settings,
            listen_port: AtomicU16::new(0),
            global_address: RwLock::new(None),
            firewall: RwLock::new(FirewallState::Unknown),
            channels,
            output_factories: OutputStreamRegistry::default(),
            source_factories: SourceStreamRegistry::default(),
            cancel: CancellationToken::new(),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub const fn session_id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub const fn broadcast_id(&self) -> BroadcastId {
        self.broadcast_id
    }

    #[must_use]
    pub const fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    #[must_use]
    pub const fn access(&self) -> &AccessController {
        &self.access
    }

    #[must_use]
    pub const fn output_factories(&self) -> &OutputStreamRegistry {
        &self.output_factories
    }

    #[must_use]
    pub const fn source_factories(&self) -> &SourceStreamRegistry {
        &self.source_factories
    }

    #[must_use]
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::Relaxed)
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::Relaxed);
    }

    #[must_use]
    pub fn global_address(&self) -> Option<IpAddr> {
        *self.global_address.read()
    }

    pub fn set_global_address(&self, ip: IpAddr) {
        let previous = self.global_address.write().replace(ip);
        if previous != Some(ip) {
            info!(address = %ip, "global address discovered");
        }
    }

    #[must_use]
    pub fn firewall(&self) -> FirewallState {
        *self.firewall.read()
    }

    pub fn set_firewall(&self, state: FirewallState) {
        let previous = std::mem::replace(&mut *self.firewall.write(), state);
        if previous != state {
            info!(?state, "firewall state changed");
        }
    }

    /// Port advertisement for an outgoing `HELO`.
    #[must_use]
    pub fn helo_port(&self) -> HeloPort {
        match (self.listen_port(), self.firewall()) {
            (0, _) | (_, FirewallState::Firewalled) => HeloPort::None,
            (port, FirewallState::Open) => HeloPort::Port(port),
            (port, FirewallState::Unknown) => HeloPort::Ping(port),
        }
    }

    #[must_use]
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Token cancelled by [`PeerCast::shutdown`].
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ---- channels ----

    #[must_use]
    pub fn get_channel(&self, id: &ChannelId) -> Option<Arc<Channel>> {
        self.channels.get(id).map(|entry| entry.value().clone())
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Look up a channel, creating it unless `must_exist` is set.
    ///
    /// A newly created channel starts pulling from `tracker` through the source
    /// factory registered for its scheme. An entry that has failed or closed is
    /// closed and dropped, then treated as absent.
    pub fn request_channel(
        self: &Arc<Self>,
        id: ChannelId,
        tracker: Option<Url>,
        must_exist: bool,
    ) -> Option<Arc<Channel>> {
        if self.is_shutdown() {
            return None;
        }
        let mut finished = None;
        let channel = match self.channels.entry(id) {
            Entry::Occupied(entry) if !entry.get().status().is_terminal() => {
                return Some(entry.get().clone())
            }
            Entry::Occupied(entry) if must_exist => {
                finished = Some(entry.remove());
                None
            }
            Entry::Occupied(mut entry) => {
                let channel = self.new_channel(id, tracker.clone());
                finished = Some(entry.insert(channel.clone()));
                Some(channel)
            }
            Entry::Vacant(_) if must_exist => None,
            Entry::Vacant(entry) => {
                let channel = self.new_channel(id, tracker.clone());
                entry.insert(channel.clone());
                Some(channel)
            }
        };
        if let Some(finished) = finished {
            debug!(channel_id = %id, status = ?finished.status(), "finished channel dropped");
            finished.close();
        }
        let channel = channel?;
        info!(channel_id = %id, tracker = ?tracker.as_ref().map(Url::as_str), "channel created");

        if let Some(tracker) = tracker {
            self.start_source(&channel, tracker);
        }
        Some(channel)
    }

    fn new_channel(&self, id: ChannelId, tracker: Option<Url>) -> Arc<Channel> {
        Arc::new(Channel::new(id, self.session_id, tracker, &self.settings))
    }

    /// Start (or restart) pulling `channel` from `tracker`.
    pub fn start_source(self: &Arc<Self>, channel: &Arc<Channel>, tracker: Url) -> bool {
        let Some(factory) = self.source_factories.get(tracker.scheme()) else {
            warn!(channel_id = %channel.id(), scheme = tracker.scheme(), "no source factory for scheme");
            channel.set_status(ChannelStatus::Error);
            return false;
        };
        let handle = factory.create(self.clone(), channel.clone(), tracker);
        channel.start_source(handle);
        true
    }

    /// Register a channel originated by this node. Content is fed through
    /// [`Channel::set_header`] and [`Channel::add_content`].
    pub fn add_broadcast_channel(&self, id: ChannelId, info: ChannelInfo) -> Arc<Channel> {
        let channel = Arc::new(Channel::new_broadcast(
            id,
            self.session_id,
            self.broadcast_id,
            info,
            &self.settings,
        ));
        channel.set_status(ChannelStatus::Receiving);
        if let Some(previous) = self.channels.insert(id, channel.clone()) {
            previous.close();
        }
        info!(channel_id = %id, "broadcast channel added");
        channel
    }

    /// Close a channel and forget it. Returns whether it existed.
    pub fn close_channel(&self, id: &ChannelId) -> bool {
        match self.channels.remove(id) {
            Some((_, channel)) => {
                channel.close();
                true
            }
            None => false,
        }
    }

    /// Close every channel; sources end with `UserShutdown`.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            self.close_channel(&id);
        }
        info!("peercast shut down");
    }

    /// This node as it describes itself in `HOST` atoms for `channel`.
    #[must_use]
    pub fn local_node(&self, channel: &Channel) -> Node {
        let mut host = Host::new(self.session_id);
        host.broadcast_id = channel.broadcast_id();
        let port = self.listen_port();
        if let Some(ip) = self.global_address() {
            host.addresses.push(SocketAddr::new(ip, port));
        }
        host.is_firewalled = self.firewall() == FirewallState::Firewalled;
        host.relay_count = u32::try_from(channel.relay_count()).unwrap_or(u32::MAX);
        host.direct_count = u32::try_from(channel.direct_count()).unwrap_or(u32::MAX);
        host.version = Some(PCP_VERSION);

        let mut node = Node::new(host);
        node.is_relay_full = !self.access.is_channel_relayable(channel, None);
        node.is_direct_full = !self.access.is_channel_playable(channel, None);
        node.is_receiving = channel.status() == ChannelStatus::Receiving;
        node.uphost = channel.upstream_address();
        node.uphost_hops = u32::from(node.uphost.is_some());
        // positions travel as their low 32 bits
        node.old_position = channel.content().oldest().map_or(0, |p| p.position as u32);
        node.new_position = channel.content().newest().map_or(0, |p| p.position as u32);
        node.uptime_secs = u32::try_from(channel.uptime().as_secs()).unwrap_or(u32::MAX);
        node
    }
}
