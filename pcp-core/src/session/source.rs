//! Upstream connection pulling a channel from a tracker or another relay.
//!
//! The connection walks an explicit state machine:
//! `Connect -> SendRelayRequest -> RecvRelayResponse -> PcpHandshake -> Receiving`,
//! and every failure lands in `Closed`, where the failover policy decides
//! whether to pick another upstream or give up.

use {
    super::{
        errors::{SessionErrorValue, SessionResult, StopReason},
        handshake::{build_helo, build_oleh, build_quit, Greeting, HeloPort, QUIT_SHUTDOWN},
        http::{parse_response, RelayRequest},
        transport::AtomStream,
        ConnectionHandle,
    },
    crate::{
        atom::{
            define::{name, packet_type},
            Atom,
        },
        channel::{
            broadcast::{build_broadcast, deliverable_payload, BroadcastGroup, Outbox, OUTBOX_CAPACITY},
            content::{unwrap_position, ContentPacket},
            peers::Node,
            route_broadcast, Channel, ChannelStatus,
        },
        peercast::{FirewallState, PeerCast},
        registry::SourceStreamFactory,
        utils::{backoff_delay, ChannelId, SessionId},
    },
    std::{
        collections::HashMap,
        fmt,
        future::Future,
        net::SocketAddr,
        sync::Arc,
        time::{Duration, Instant},
    },
    tokio::{
        net::TcpStream,
        sync::mpsc,
        time::{interval, timeout, MissedTickBehavior},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
    url::{Host as UrlHost, Url},
};

pub const PCP_SCHEME: &str = "pcp";
pub const DEFAULT_PCP_PORT: u16 = 7144;

const RECONNECT_INITIAL_MS: u64 = 250;
const RECONNECT_MAX_MS: u64 = 5000;
/// Atoms accepted from upstream before its `OLEH`.
const MAX_PREAMBLE_ATOMS: usize = 8;

/// Split `pcp://host[:port][/<channel id>]` into the tracker URL and the
/// channel it names, if any.
#[must_use]
pub fn parse_tracker(uri: &str) -> Option<(Url, Option<ChannelId>)> {
    let url = Url::parse(uri).ok()?;
    if url.scheme() != PCP_SCHEME || url.host().is_none() {
        return None;
    }
    let segment = url
        .path_segments()
        .and_then(|mut segments| segments.find(|segment| !segment.is_empty()));
    let channel_id = match segment {
        Some(segment) => Some(ChannelId::parse_hex(segment)?),
        None => None,
    };
    Some((url, channel_id))
}

/// Where the next connection attempt goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTarget {
    pub host: String,
    pub port: u16,
    /// Known for peers learned from `HOST` atoms; the origin reveals it in `OLEH`.
    pub session_id: Option<SessionId>,
    pub is_origin: bool,
}

impl SourceTarget {
    #[must_use]
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = match url.host()? {
            UrlHost::Domain(domain) => domain.to_string(),
            UrlHost::Ipv4(ip) => ip.to_string(),
            UrlHost::Ipv6(ip) => ip.to_string(),
        };
        Some(Self {
            host,
            port: url.port().unwrap_or(DEFAULT_PCP_PORT),
            session_id: None,
            is_origin: true,
        })
    }

    #[must_use]
    pub fn from_node(node: &Node) -> Option<Self> {
        let addr = node.host.global_address()?;
        Some(Self {
            host: addr.ip().to_string(),
            port: addr.port(),
            session_id: Some(node.session_id()),
            is_origin: false,
        })
    }

    /// Identity used by the ignore list.
    #[must_use]
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for SourceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    Terminate,
    Reconnect,
}

/// Failover policy applied when a connection attempt ends.
#[must_use]
pub const fn recovery_for(reason: StopReason, is_origin: bool) -> Recovery {
    match reason {
        StopReason::UserShutdown | StopReason::NodeNotFound | StopReason::None => {
            Recovery::Terminate
        }
        StopReason::Unavailable => Recovery::Reconnect,
        _ if is_origin => Recovery::Terminate,
        _ => Recovery::Reconnect,
    }
}

/// Upstreams that recently failed, skipped until their entry expires.
#[derive(Debug)]
pub struct IgnoredHosts {
    entries: HashMap<String, Instant>,
    timeout: Duration,
}

impl IgnoredHosts {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            timeout,
        }
    }

    pub fn add(&mut self, key: String) {
        self.entries.insert(key, Instant::now());
    }

    pub fn contains(&mut self, key: &str) -> bool {
        let timeout = self.timeout;
        self.entries.retain(|_, since| since.elapsed() < timeout);
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One live connection to an upstream.
struct Attempt {
    target: SourceTarget,
    remote: SocketAddr,
    stream: AtomStream,
    outbox: Arc<Outbox>,
    outbox_rx: mpsc::Receiver<Atom>,
    relay_full: bool,
}

enum SourceState {
    Connect(Option<SourceTarget>),
    SendRelayRequest(Box<Attempt>),
    RecvRelayResponse(Box<Attempt>),
    PcpHandshake(Box<Attempt>),
    Receiving(Box<Attempt>),
    Closed {
        target: Option<SourceTarget>,
        reason: StopReason,
    },
}

/// Inputs to the host-info cadence: a change in any of them makes an update due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct HostInfoKey {
    nodes_version: u64,
    relays: usize,
    directs: usize,
    status: ChannelStatus,
}

pub struct SourceConnection {
    peercast: Arc<PeerCast>,
    channel: Arc<Channel>,
    origin: Option<SourceTarget>,
    ignored: IgnoredHosts,
    attempt: u32,
    cancel: CancellationToken,
}

impl SourceConnection {
    #[must_use]
    pub fn new(
        peercast: Arc<PeerCast>,
        channel: Arc<Channel>,
        tracker: Option<&Url>,
        cancel: CancellationToken,
    ) -> Self {
        let ignored = IgnoredHosts::new(peercast.settings().ignore_timeout());
        Self {
            origin: tracker.and_then(SourceTarget::from_url),
            peercast,
            channel,
            ignored,
            attempt: 0,
            cancel,
        }
    }

    /// Drive the state machine until the channel is given up or shut down.
    pub async fn run(mut self) -> StopReason {
        self.channel.set_status(ChannelStatus::Searching);
        let mut state = SourceState::Connect(self.origin.clone().or_else(|| self.select_target()));
        loop {
            state = match state {
                SourceState::Connect(target) => self.connect(target).await,
                SourceState::SendRelayRequest(attempt) => self.send_relay_request(attempt).await,
                SourceState::RecvRelayResponse(attempt) => self.recv_relay_response(attempt).await,
                SourceState::PcpHandshake(attempt) => self.pcp_handshake(attempt).await,
                SourceState::Receiving(attempt) => self.receive(attempt).await,
                SourceState::Closed { target, reason } => {
                    match self.on_closed(target, reason).await {
                        Some(next) => next,
                        None => return reason,
                    }
                }
            };
        }
    }

    /// `None` once the connection has been told to stop.
    async fn cancellable<T>(&self, future: impl Future<Output = T>) -> Option<T> {
        tokio::select! {
            () = self.cancel.cancelled() => None,
            output = future => Some(output),
        }
    }

    async fn connect(&mut self, target: Option<SourceTarget>) -> SourceState {
        let Some(target) = target else {
            return SourceState::Closed {
                target: None,
                reason: StopReason::NodeNotFound,
            };
        };
        self.channel.set_status(ChannelStatus::Connecting);
        debug!(channel_id = %self.channel.id(), %target, "connecting to upstream");

        let limit = self.peercast.settings().connect_timeout();
        let connecting = timeout(limit, TcpStream::connect((target.host.as_str(), target.port)));
        let tcp = match self.cancellable(connecting).await {
            None => {
                return SourceState::Closed {
                    target: Some(target),
                    reason: StopReason::UserShutdown,
                }
            }
            Some(Ok(Ok(tcp))) => tcp,
            Some(Ok(Err(err))) => {
                info!(channel_id = %self.channel.id(), %target, "upstream connect failed: {err}");
                return SourceState::Closed {
                    target: Some(target),
                    reason: StopReason::ConnectionError,
                };
            }
            Some(Err(_)) => {
                info!(channel_id = %self.channel.id(), %target, "upstream connect timed out");
                return SourceState::Closed {
                    target: Some(target),
                    reason: StopReason::ConnectionError,
                };
            }
        };

        let remote = match tcp.peer_addr() {
            Ok(remote) => remote,
            Err(err) => {
                warn!(channel_id = %self.channel.id(), %target, "upstream socket unusable: {err}");
                return SourceState::Closed {
                    target: Some(target),
                    reason: StopReason::ConnectionError,
                };
            }
        };
        let (outbox, outbox_rx) = Outbox::new(OUTBOX_CAPACITY);
        SourceState::SendRelayRequest(Box::new(Attempt {
            target,
            remote,
            stream: AtomStream::from_tcp(tcp, self.peercast.settings().send_timeout()),
            outbox: Arc::new(outbox),
            outbox_rx,
            relay_full: false,
        }))
    }

    /// Resume after the newest packet held; positions travel as their low 32 bits.
    fn relay_request(&self) -> RelayRequest {
        let position = self
            .channel
            .content()
            .newest()
            .map(|packet| packet.position as u32);
        RelayRequest::new(self.channel.id()).with_position(position)
    }

    async fn send_relay_request(&mut self, mut attempt: Box<Attempt>) -> SourceState {
        let request = self.relay_request().to_bytes();
        match self.cancellable(attempt.stream.write_bytes(&request)).await {
            None => Self::closed(attempt, StopReason::UserShutdown),
            Some(Ok(())) => SourceState::RecvRelayResponse(attempt),
            Some(Err(err)) => {
                info!(channel_id = %self.channel.id(), target = %attempt.target, "relay request failed: {err}");
                Self::closed(attempt, StopReason::ConnectionError)
            }
        }
    }

    async fn recv_relay_response(&mut self, mut attempt: Box<Attempt>) -> SourceState {
        let settings = self.peercast.settings();
        let reading = timeout(
            settings.handshake_timeout(),
            attempt
                .stream
                .read_header(settings.max_header_bytes, parse_response),
        );
        let status = match self.cancellable(reading).await {
            None => return Self::closed(attempt, StopReason::UserShutdown),
            Some(Ok(Ok(status))) => status,
            Some(Ok(Err(err))) => {
                info!(channel_id = %self.channel.id(), target = %attempt.target, "bad relay response: {err}");
                return Self::closed(attempt, StopReason::ConnectionError);
            }
            Some(Err(_)) => {
                info!(channel_id = %self.channel.id(), target = %attempt.target, "relay response timed out");
                return Self::closed(attempt, StopReason::ConnectionError);
            }
        };

        debug!(channel_id = %self.channel.id(), target = %attempt.target, status, "relay response");
        match status {
            200 => SourceState::PcpHandshake(attempt),
            503 => {
                attempt.relay_full = true;
                SourceState::PcpHandshake(attempt)
            }
            404 => Self::closed(attempt, StopReason::ChannelNotFound),
            _ => Self::closed(attempt, StopReason::AccessDenied),
        }
    }

    async fn pcp_handshake(&mut self, mut attempt: Box<Attempt>) -> SourceState {
        let port = self.peercast.helo_port();
        let helo = build_helo(self.peercast.session_id(), port, None);
        let limit = self.peercast.settings().handshake_timeout();

        let exchange = exchange_greeting(&mut attempt.stream, &helo, limit);
        let oleh = match self.cancellable(exchange).await {
            None => return Self::closed(attempt, StopReason::UserShutdown),
            Some(Ok(oleh)) => oleh,
            Some(Err(err)) => {
                info!(channel_id = %self.channel.id(), target = %attempt.target, "upstream handshake failed: {err}");
                return Self::closed(attempt, err.stop_reason());
            }
        };

        let greeting = Greeting::parse(&oleh);
        if let Some(ip) = greeting.remote_ip {
            self.peercast.set_global_address(ip);
        }
        if let HeloPort::Ping(_) = port {
            match greeting.port {
                Some(port) if port > 0 => self.peercast.set_firewall(FirewallState::Open),
                _ => self.peercast.set_firewall(FirewallState::Firewalled),
            }
        }
        let Some(peer) = greeting.session_id else {
            info!(channel_id = %self.channel.id(), target = %attempt.target, "upstream did not identify itself");
            return Self::closed(attempt, StopReason::ConnectionError);
        };
        if peer == self.peercast.session_id() {
            warn!(channel_id = %self.channel.id(), target = %attempt.target, "upstream is this node");
            return Self::closed(attempt, StopReason::ConnectionError);
        }

        attempt.target.session_id = Some(peer);
        attempt.outbox.set_peer(peer);
        self.channel
            .set_upstream(Some(attempt.outbox.clone()), Some(attempt.remote));
        if attempt.relay_full {
            debug!(channel_id = %self.channel.id(), target = %attempt.target, "upstream is full, collecting alternates");
        } else {
            self.channel.set_status(ChannelStatus::Receiving);
            self.attempt = 0;
            info!(channel_id = %self.channel.id(), target = %attempt.target, "receiving from upstream");
        }
        SourceState::Receiving(attempt)
    }

    async fn receive(&mut self, attempt: Box<Attempt>) -> SourceState {
        let Attempt {
            target,
            remote,
            mut stream,
            outbox,
            mut outbox_rx,
            relay_full,
        } = *attempt;
        let peer = outbox.peer();
        let mut ticker = interval(self.peercast.settings().host_info_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_host_info: Option<(Instant, HostInfoKey)> = None;

        let reason = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let _ = stream.write_atom(&build_quit(QUIT_SHUTDOWN)).await;
                    break StopReason::UserShutdown;
                }
                filled = stream.fill() => {
                    if let Err(err) = filled {
                        debug!(channel_id = %self.channel.id(), %target, "upstream read ended: {err}");
                        break StopReason::ConnectionError;
                    }
                    if let Err(reason) = self.drain_inbound(&mut stream, peer, remote).await {
                        break reason;
                    }
                }
                Some(atom) = outbox_rx.recv() => {
                    if let Err(err) = stream.write_atom(&atom).await {
                        debug!(channel_id = %self.channel.id(), %target, "upstream write failed: {err}");
                        break StopReason::ConnectionError;
                    }
                }
                _ = ticker.tick() => {
                    if !relay_full {
                        self.maybe_send_host_info(&mut last_host_info);
                    }
                }
            }
        };

        self.channel.release_upstream(&outbox);
        stream.shutdown().await;
        SourceState::Closed {
            target: Some(target),
            reason,
        }
    }

    /// Handle every complete atom currently buffered.
    async fn drain_inbound(
        &self,
        stream: &mut AtomStream,
        peer: Option<SessionId>,
        remote: SocketAddr,
    ) -> Result<(), StopReason> {
        loop {
            let atom = match stream.try_read_atom() {
                Ok(Some(atom)) => atom,
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!(channel_id = %self.channel.id(), %remote, "upstream framing lost: {err}");
                    return Err(StopReason::ConnectionError);
                }
            };
            if let Some(reply) = self.handle_atom(&atom, peer, remote)? {
                stream
                    .write_atom(&reply)
                    .await
                    .map_err(|_| StopReason::ConnectionError)?;
            }
        }
    }

    /// Apply one atom from upstream; the returned atom, if any, is the reply.
    fn handle_atom(
        &self,
        atom: &Atom,
        peer: Option<SessionId>,
        remote: SocketAddr,
    ) -> Result<Option<Atom>, StopReason> {
        match atom.name() {
            n if n == name::CHAN => self.handle_chan(atom),
            n if n == name::CHAN_PKT => self.handle_pkt(atom),
            n if n == name::CHAN_INFO => self.channel.merge_info(atom),
            n if n == name::CHAN_TRACK => self.channel.merge_track(atom),
            n if n == name::HOST => self.handle_host(atom),
            n if n == name::BCST => self.handle_bcst(atom, peer, remote),
            n if n == name::HELO => {
                return Ok(Some(build_oleh(
                    self.peercast.session_id(),
                    Some(remote.ip()),
                    0,
                )))
            }
            n if n == name::OLEH => {
                if let Some(ip) = atom.get_ip(name::HELO_REMOTE_IP) {
                    self.peercast.set_global_address(ip);
                }
            }
            n if n == name::QUIT => {
                let code = atom.as_u32().unwrap_or(0);
                let reason = StopReason::from_quit_code(code);
                info!(channel_id = %self.channel.id(), code, %reason, "upstream quit");
                return Err(reason);
            }
            n if n == name::OK => {}
            other => trace!(name = %other, "unhandled atom from upstream"),
        }
        Ok(None)
    }

    fn handle_chan(&self, chan: &Atom) {
        if let Some(id) = chan.get_id(name::CHAN_ID) {
            if id != self.channel.id() {
                debug!(channel_id = %self.channel.id(), other = %id, "chan for another channel ignored");
                return;
            }
        }
        for child in chan.children() {
            match child.name() {
                n if n == name::CHAN_BCID => {
                    if let Ok(broadcast_id) = child.as_id() {
                        self.channel.set_broadcast_id(broadcast_id);
                    }
                }
                n if n == name::CHAN_INFO => self.channel.merge_info(child),
                n if n == name::CHAN_TRACK => self.channel.merge_track(child),
                n if n == name::CHAN_PKT => self.handle_pkt(child),
                _ => {}
            }
        }
    }

    fn handle_pkt(&self, pkt: &Atom) {
        let (Some(kind), Some(data)) = (
            pkt.get_bytes(name::CHAN_PKT_TYPE),
            pkt.get_bytes(name::CHAN_PKT_DATA),
        ) else {
            debug!(channel_id = %self.channel.id(), "malformed packet skipped");
            return;
        };
        let wire_position = pkt.get_u32(name::CHAN_PKT_POS).unwrap_or(0);
        let content = self.channel.content();
        let reference = content
            .newest()
            .or_else(|| content.header())
            .map_or(0, |packet| packet.position);
        let position = unwrap_position(reference, wire_position);

        match &kind[..] {
            packet_type::HEAD => {
                debug!(channel_id = %self.channel.id(), position, len = data.len(), "header received");
                self.channel
                    .set_header(ContentPacket::new(position, data.clone()));
            }
            packet_type::DATA => {
                let continuation = pkt
                    .get_u8(name::CHAN_PKT_CONTINUATION)
                    .is_some_and(|flag| flag != 0);
                self.channel.add_content(
                    ContentPacket::new(position, data.clone()).with_continuation(continuation),
                );
            }
            _ => {}
        }
    }

    fn handle_host(&self, host: &Atom) {
        let Some((channel_id, node)) = Node::from_host_atom(host) else {
            debug!(channel_id = %self.channel.id(), "malformed host skipped");
            return;
        };
        if node.session_id() == self.peercast.session_id() {
            return;
        }
        if channel_id.is_some_and(|id| id != self.channel.id()) {
            return;
        }
        let session_id = node.session_id();
        if self.channel.add_node(node) {
            debug!(channel_id = %self.channel.id(), node = %session_id, "node discovered");
        }
    }

    fn handle_bcst(&self, bcst: &Atom, peer: Option<SessionId>, remote: SocketAddr) {
        let decision = route_broadcast(bcst, self.peercast.session_id());
        let this_channel = bcst
            .get_id(name::BCST_CHANID)
            .is_none_or(|id| id == self.channel.id());
        if decision.deliver_locally && this_channel {
            for child in deliverable_payload(bcst) {
                if let Err(reason) = self.handle_atom(child, peer, remote) {
                    debug!(channel_id = %self.channel.id(), %reason, "broadcast payload rejected");
                }
            }
        }
        if let Some(forward) = decision.forward {
            self.channel.broadcast(peer, &forward, decision.group);
        }
    }

    fn host_info_key(&self) -> HostInfoKey {
        HostInfoKey {
            nodes_version: self.channel.nodes().version(),
            relays: self.channel.relay_count(),
            directs: self.channel.direct_count(),
            status: self.channel.status(),
        }
    }

    /// Broadcast our `HOST` if something changed since the last one and the
    /// short interval has passed, or when the long interval has passed anyway.
    fn maybe_send_host_info(&self, last: &mut Option<(Instant, HostInfoKey)>) {
        self.channel.nodes().prune();
        let settings = self.peercast.settings();
        let key = self.host_info_key();
        let now = Instant::now();
        let due = match *last {
            None => true,
            Some((at, previous)) => {
                let elapsed = now.duration_since(at);
                (previous != key && elapsed >= settings.host_info_interval())
                    || elapsed >= settings.host_info_max_interval()
            }
        };
        if !due {
            return;
        }

        let channel_id = self.channel.id();
        let group = BroadcastGroup::TRACKERS | BroadcastGroup::RELAYS;
        let host = self.peercast.local_node(&self.channel).to_host_atom(channel_id);
        let atom = build_broadcast(self.peercast.session_id(), group, Some(channel_id), vec![host]);
        let delivered = self.channel.broadcast(None, &atom, group);
        trace!(%channel_id, delivered, "host info broadcast");
        *last = Some((now, key));
    }

    /// Next upstream: a relay-capable peer first, then the origin.
    fn select_target(&mut self) -> Option<SourceTarget> {
        self.channel.nodes().prune();
        let own = self.peercast.session_id();
        let candidates = self
            .channel
            .nodes()
            .relay_candidates(|node| node.session_id() != own);
        for node in &candidates {
            if let Some(target) = SourceTarget::from_node(node) {
                if !self.ignored.contains(&target.key()) {
                    return Some(target);
                }
            }
        }
        let origin = self.origin.clone()?;
        (!self.ignored.contains(&origin.key())).then_some(origin)
    }

    async fn on_closed(
        &mut self,
        target: Option<SourceTarget>,
        reason: StopReason,
    ) -> Option<SourceState> {
        let is_origin = target.as_ref().is_some_and(|target| target.is_origin);
        info!(
            channel_id = %self.channel.id(),
            target = ?target.as_ref().map(ToString::to_string),
            %reason,
            "upstream connection closed"
        );

        match recovery_for(reason, is_origin) {
            Recovery::Terminate => {
                if reason != StopReason::UserShutdown {
                    warn!(channel_id = %self.channel.id(), %reason, "no upstream left, giving up");
                    self.channel.set_status(ChannelStatus::Error);
                }
                None
            }
            Recovery::Reconnect => {
                if let Some(target) = &target {
                    self.ignored.add(target.key());
                }
                self.channel.set_status(ChannelStatus::Searching);
                self.attempt = self.attempt.saturating_add(1);
                let delay = backoff_delay(self.attempt, RECONNECT_INITIAL_MS, RECONNECT_MAX_MS);
                debug!(channel_id = %self.channel.id(), attempt = self.attempt, ?delay, "reconnecting");
                if self.cancellable(tokio::time::sleep(delay)).await.is_none() {
                    return Some(SourceState::Closed {
                        target: None,
                        reason: StopReason::UserShutdown,
                    });
                }
                Some(SourceState::Connect(self.select_target()))
            }
        }
    }

    fn closed(attempt: Box<Attempt>, reason: StopReason) -> SourceState {
        SourceState::Closed {
            target: Some(attempt.target),
            reason,
        }
    }
}

/// Send our `HELO` and wait for the upstream's `OLEH`.
async fn exchange_greeting(
    stream: &mut AtomStream,
    helo: &Atom,
    limit: Duration,
) -> SessionResult<Atom> {
    stream.write_atom(helo).await?;
    for _ in 0..MAX_PREAMBLE_ATOMS {
        let atom = stream.read_atom_timeout(limit, "oleh").await?;
        if atom.name() == name::OLEH {
            return Ok(atom);
        }
        if atom.name() == name::QUIT {
            let code = atom.as_u32().unwrap_or(0);
            return Err(StopReason::from_quit_code(code).into());
        }
        trace!(name = %atom.name(), "atom before oleh ignored");
    }
    Err(SessionErrorValue::Handshake("no oleh received".into()).into())
}

/// Source factory for `pcp://` trackers.
pub struct PcpSourceFactory;

impl SourceStreamFactory for PcpSourceFactory {
    fn scheme(&self) -> &'static str {
        PCP_SCHEME
    }

    fn create(
        &self,
        peercast: Arc<PeerCast>,
        channel: Arc<Channel>,
        tracker: Url,
    ) -> ConnectionHandle {
        let cancel = channel.child_token();
        let channel_id = channel.id();
        let source = SourceConnection::new(peercast, channel, Some(&tracker), cancel.clone());
        ConnectionHandle::spawn(cancel, async move {
            let reason = source.run().await;
            debug!(%channel_id, %reason, "source stopped");
        })
    }
}
