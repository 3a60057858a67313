//! Downstream relay connection: answers `GET /channel/<id>` from another node and
//! streams the channel to it.

use {
    super::{
        errors::{SessionErrorValue, SessionResult, StopReason},
        handshake::{
            build_oleh, build_quit, Greeting, QUIT_LOOPBACK, QUIT_NOT_IDENTIFIED, QUIT_OFF_AIR,
            QUIT_SHUTDOWN, QUIT_UNAVAILABLE,
        },
        http::{response_bytes, sniff_channel_id, RelayRequest},
        ping::probe_firewall,
        transport::AtomStream,
        ConnectionHandle,
    },
    crate::{
        access::AccessControlInfo,
        atom::{
            define::{name, packet_type},
            Atom,
        },
        channel::{
            broadcast::{deliverable_payload, BroadcastGroup, Outbox, OUTBOX_CAPACITY},
            content::{unwrap_position, ContentPacket},
            peers::Node,
            route_broadcast, Channel, OutputId, OutputKind,
        },
        peercast::PeerCast,
        registry::{AcceptedConnection, OutputStreamFactory},
        utils::{ChannelId, SessionId},
    },
    std::{net::SocketAddr, sync::Arc},
    tokio::time::timeout,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace, warn},
};

/// Atoms tolerated before the downstream's `HELO`.
const MAX_PREAMBLE_ATOMS: usize = 4;

/// Serves `GET /channel/<id>` relay requests.
pub struct RelayOutputFactory;

impl OutputStreamFactory for RelayOutputFactory {
    fn name(&self) -> &'static str {
        "pcp-relay"
    }

    fn parse_channel_id(&self, header: &[u8]) -> Option<ChannelId> {
        sniff_channel_id(header)
    }

    fn create(
        &self,
        peercast: Arc<PeerCast>,
        connection: AcceptedConnection,
        channel_id: ChannelId,
    ) -> ConnectionHandle {
        let cancel = peercast.child_token();
        let remote = connection.remote_addr;
        let output = RelayOutputConnection::new(peercast, connection, cancel.clone());
        ConnectionHandle::spawn(cancel, async move {
            let reason = output.run().await;
            debug!(%channel_id, %remote, %reason, "relay output closed");
        })
    }
}

/// Where the downstream peer stands after the `HELO`/`OLEH` exchange.
struct Downstream {
    session_id: SessionId,
    output_id: Option<OutputId>,
}

pub struct RelayOutputConnection {
    peercast: Arc<PeerCast>,
    stream: AtomStream,
    remote: SocketAddr,
    access: AccessControlInfo,
    cancel: CancellationToken,
}

impl RelayOutputConnection {
    #[must_use]
    pub fn new(
        peercast: Arc<PeerCast>,
        connection: AcceptedConnection,
        cancel: CancellationToken,
    ) -> Self {
        let stream = AtomStream::new(
            connection.reader,
            connection.writer,
            peercast.settings().send_timeout(),
        )
        .with_buffered(&connection.header);
        Self {
            peercast,
            stream,
            remote: connection.remote_addr,
            access: connection.access,
            cancel,
        }
    }

    pub async fn run(mut self) -> StopReason {
        let reason = self.serve().await;
        self.stream.shutdown().await;
        reason
    }

    async fn serve(&mut self) -> StopReason {
        let cancel = self.cancel.clone();
        let settings = self.peercast.settings();
        let reading = timeout(
            settings.handshake_timeout(),
            self.stream
                .read_header(settings.max_header_bytes, RelayRequest::parse),
        );
        let read = tokio::select! {
            () = cancel.cancelled() => return StopReason::UserShutdown,
            read = reading => read,
        };
        let request = match read {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                debug!(remote = %self.remote, "bad relay request: {err}");
                if matches!(
                    err.value,
                    SessionErrorValue::BadRequest(_) | SessionErrorValue::HeaderTooLarge(_)
                ) {
                    let _ = self.stream.write_bytes(&response_bytes(400)).await;
                }
                return StopReason::ConnectionError;
            }
            Err(_) => {
                debug!(remote = %self.remote, "relay request timed out");
                return StopReason::ConnectionError;
            }
        };

        let channel = self
            .peercast
            .request_channel(request.channel_id, None, true)
            .filter(|channel| channel.is_ready());
        let (status, reason) = match &channel {
            _ if !self.access.accepts_relay => (403, StopReason::AccessDenied),
            None => (404, StopReason::ChannelNotFound),
            Some(_) if request.pcp_version.is_none() => (400, StopReason::BadAgent),
            Some(channel) if !self.peercast.access().is_channel_relayable(channel, None) => {
                (503, StopReason::Unavailable)
            }
            Some(_) => (200, StopReason::None),
        };
        info!(
            channel_id = %request.channel_id,
            remote = %self.remote,
            status,
            agent = request.user_agent.as_deref().unwrap_or(""),
            "relay request"
        );
        if let Err(err) = self.stream.write_bytes(&response_bytes(status)).await {
            debug!(remote = %self.remote, "relay response failed: {err}");
            return StopReason::ConnectionError;
        }
        let Some(channel) = channel else {
            return reason;
        };
        if status != 200 && status != 503 {
            return reason;
        }

        let handshake = tokio::select! {
            () = cancel.cancelled() => return StopReason::UserShutdown,
            handshake = self.handshake() => handshake,
        };
        let peer = match handshake {
            Ok(peer) => peer,
            Err(err) => {
                debug!(remote = %self.remote, "downstream handshake failed: {err}");
                return err.stop_reason();
            }
        };

        if status == 503 {
            self.send_alternates(&channel, peer).await;
            return reason;
        }

        let mut downstream = Downstream {
            session_id: peer,
            output_id: None,
        };
        let result = self
            .stream_channel(&channel, request.position, &mut downstream)
            .await;
        if let Some(output_id) = downstream.output_id {
            channel.remove_output(output_id);
        }
        match result {
            Ok(reason) | Err(reason) => reason,
        }
    }

    /// Read the downstream's `HELO`, probe its port when asked and answer `OLEH`.
    async fn handshake(&mut self) -> SessionResult<SessionId> {
        let settings = self.peercast.settings();
        let limit = settings.handshake_timeout();
        let mut helo = None;
        for _ in 0..MAX_PREAMBLE_ATOMS {
            let atom = self.stream.read_atom_timeout(limit, "helo").await?;
            if atom.name() == name::HELO {
                helo = Some(atom);
                break;
            }
            if atom.name() == name::QUIT {
                return Err(StopReason::from_quit_code(atom.as_u32().unwrap_or(0)).into());
            }
        }
        let Some(helo) = helo else {
            return Err(SessionErrorValue::Handshake("no helo received".into()).into());
        };

        let greeting = Greeting::parse(&helo);
        let Some(peer) = greeting.session_id else {
            self.stream.write_atom(&build_quit(QUIT_NOT_IDENTIFIED)).await?;
            return Err(SessionErrorValue::Handshake("helo without session id".into()).into());
        };
        let own = self.peercast.session_id();
        if peer == own {
            self.stream.write_atom(&build_quit(QUIT_LOOPBACK)).await?;
            return Err(SessionErrorValue::Handshake("connection to self".into()).into());
        }

        let port = match (greeting.port, greeting.ping) {
            (_, Some(ping)) => {
                let reachable =
                    probe_firewall(self.remote.ip(), ping, own, peer, settings.ping_timeout())
                        .await;
                if reachable {
                    ping
                } else {
                    0
                }
            }
            (Some(port), None) => port,
            (None, None) => 0,
        };
        debug!(remote = %self.remote, %peer, port, agent = ?greeting.agent, "downstream identified");
        self.stream
            .write_atom(&build_oleh(own, Some(self.remote.ip()), port))
            .await?;
        Ok(peer)
    }

    /// Tell a peer we are full: a few other nodes to try, then `QUIT`.
    async fn send_alternates(&mut self, channel: &Channel, peer: SessionId) {
        let max = self.peercast.settings().max_alternate_hosts;
        let mut atoms: Vec<Atom> = channel
            .nodes()
            .select_alternates(Some(peer), max)
            .iter()
            .map(|node| node.to_host_atom(channel.id()))
            .collect();
        debug!(channel_id = %channel.id(), remote = %self.remote, alternates = atoms.len(), "relay full");
        atoms.push(build_quit(QUIT_UNAVAILABLE));
        if let Err(err) = self.stream.write_atoms(&atoms).await {
            debug!(remote = %self.remote, "alternate listing failed: {err}");
        }
    }

    /// Header bundle, catch-up, then follow the channel until either side stops.
    async fn stream_channel(
        &mut self,
        channel: &Arc<Channel>,
        requested: Option<u32>,
        downstream: &mut Downstream,
    ) -> Result<StopReason, StopReason> {
        let (outbox, mut outbox_rx) = Outbox::new(OUTBOX_CAPACITY);
        let outbox = Arc::new(outbox);
        outbox.set_peer(downstream.session_id);
        downstream.output_id = Some(channel.add_output(
            OutputKind::Relay,
            BroadcastGroup::RELAYS,
            outbox,
            self.cancel.clone(),
        ));

        let mut content_rx = channel.content().subscribe();
        let mut info_rx = channel.subscribe_info();
        let mut status_rx = channel.subscribe_status();
        content_rx.borrow_and_update();
        info_rx.borrow_and_update();

        let Some(header) = channel.content().header() else {
            return Err(StopReason::OffAir);
        };
        let reference = channel
            .content()
            .newest()
            .map_or(header.position, |packet| packet.position);
        let mut cursor = StreamCursor {
            header_position: header.position,
            position: requested.map_or(header.position, |wire| unwrap_position(reference, wire)),
        };
        let bundle = chan_atom(
            channel.id(),
            vec![
                Atom::with_id(name::CHAN_BCID, channel.broadcast_id()),
                channel.info().to_atom(),
                channel.track().to_atom(),
                packet_atom(packet_type::HEAD, &header),
            ],
        );
        self.write(&[Atom::with_u32(name::OK, 1), bundle]).await?;
        self.send_pending(channel, &mut cursor).await?;
        info!(channel_id = %channel.id(), remote = %self.remote, peer = %downstream.session_id, "relaying");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    let code = if channel.status().is_terminal() {
                        QUIT_OFF_AIR
                    } else {
                        QUIT_SHUTDOWN
                    };
                    let _ = self.stream.write_atom(&build_quit(code)).await;
                    return Ok(StopReason::UserShutdown);
                }
                changed = content_rx.changed() => {
                    if changed.is_err() {
                        return Ok(StopReason::OffAir);
                    }
                    self.send_pending(channel, &mut cursor).await?;
                }
                changed = info_rx.changed() => {
                    if changed.is_err() {
                        return Ok(StopReason::OffAir);
                    }
                    let update = chan_atom(
                        channel.id(),
                        vec![channel.info().to_atom(), channel.track().to_atom()],
                    );
                    self.write(&[update]).await?;
                }
                changed = status_rx.changed() => {
                    let status = *status_rx.borrow_and_update();
                    if changed.is_err() || status.is_terminal() {
                        let _ = self.stream.write_atom(&build_quit(QUIT_OFF_AIR)).await;
                        return Ok(StopReason::OffAir);
                    }
                }
                Some(atom) = outbox_rx.recv() => {
                    self.write(&[atom]).await?;
                }
                filled = self.stream.fill() => {
                    if let Err(err) = filled {
                        debug!(remote = %self.remote, "downstream read ended: {err}");
                        return Err(StopReason::ConnectionError);
                    }
                    self.drain_inbound(channel, downstream)?;
                }
            }
        }
    }

    /// Re-send a changed header, then every packet past the cursor.
    async fn send_pending(
        &mut self,
        channel: &Channel,
        cursor: &mut StreamCursor,
    ) -> Result<(), StopReason> {
        let content = channel.content();
        let mut atoms = Vec::new();
        if let Some(header) = content.header() {
            if header.position != cursor.header_position {
                debug!(channel_id = %channel.id(), position = header.position, "header changed");
                cursor.header_position = header.position;
                cursor.position = cursor.position.max(header.position);
                atoms.push(chan_atom(
                    channel.id(),
                    vec![packet_atom(packet_type::HEAD, &header)],
                ));
            }
        }
        for packet in content.get_newer_than(cursor.position) {
            cursor.position = packet.position;
            atoms.push(chan_atom(
                channel.id(),
                vec![packet_atom(packet_type::DATA, &packet)],
            ));
        }
        if atoms.is_empty() {
            return Ok(());
        }
        trace!(channel_id = %channel.id(), count = atoms.len(), "content sent");
        self.write(&atoms).await
    }

    async fn write(&mut self, atoms: &[Atom]) -> Result<(), StopReason> {
        self.stream.write_atoms(atoms).await.map_err(|err| {
            debug!(remote = %self.remote, "downstream write failed: {err}");
            err.stop_reason()
        })
    }

    fn drain_inbound(
        &mut self,
        channel: &Channel,
        downstream: &Downstream,
    ) -> Result<(), StopReason> {
        loop {
            match self.stream.try_read_atom() {
                Ok(Some(atom)) => self.handle_atom(channel, downstream, &atom)?,
                Ok(None) => return Ok(()),
                Err(err) => {
                    warn!(remote = %self.remote, "downstream framing lost: {err}");
                    return Err(StopReason::ConnectionError);
                }
            }
        }
    }

    fn handle_atom(
        &self,
        channel: &Channel,
        downstream: &Downstream,
        atom: &Atom,
    ) -> Result<(), StopReason> {
        match atom.name() {
            n if n == name::BCST => {
                let decision = route_broadcast(atom, self.peercast.session_id());
                let this_channel = atom
                    .get_id(name::BCST_CHANID)
                    .is_none_or(|id| id == channel.id());
                if decision.deliver_locally && this_channel {
                    for child in deliverable_payload(atom) {
                        self.handle_payload(channel, downstream, child);
                    }
                }
                if let Some(forward) = decision.forward {
                    channel.broadcast(Some(downstream.session_id), &forward, decision.group);
                }
            }
            n if n == name::HOST => self.handle_host(channel, downstream, atom),
            n if n == name::QUIT => {
                let code = atom.as_u32().unwrap_or(0);
                debug!(remote = %self.remote, code, "downstream quit");
                return Err(StopReason::ChannelExit);
            }
            other => trace!(name = %other, "unhandled atom from downstream"),
        }
        Ok(())
    }

    /// Apply one atom delivered inside a broadcast. Metadata is taken only for
    /// relayed channels; a local broadcast owns its own.
    fn handle_payload(&self, channel: &Channel, downstream: &Downstream, atom: &Atom) {
        let relayed = !channel.is_broadcasting();
        match atom.name() {
            n if n == name::HOST => self.handle_host(channel, downstream, atom),
            n if n == name::CHAN_INFO && relayed => channel.merge_info(atom),
            n if n == name::CHAN_TRACK && relayed => channel.merge_track(atom),
            n if n == name::CHAN && relayed => {
                if atom.get_id(name::CHAN_ID).is_some_and(|id| id != channel.id()) {
                    return;
                }
                for child in atom.children() {
                    match child.name() {
                        n if n == name::CHAN_INFO => channel.merge_info(child),
                        n if n == name::CHAN_TRACK => channel.merge_track(child),
                        _ => {}
                    }
                }
            }
            other => trace!(name = %other, "broadcast payload not applied"),
        }
    }

    fn handle_host(&self, channel: &Channel, downstream: &Downstream, atom: &Atom) {
        let Some((channel_id, node)) = Node::from_host_atom(atom) else {
            debug!(remote = %self.remote, "malformed host skipped");
            return;
        };
        if node.session_id() == self.peercast.session_id()
            || channel_id.is_some_and(|id| id != channel.id())
        {
            return;
        }
        if node.session_id() == downstream.session_id {
            if let Some(output_id) = downstream.output_id {
                let group = if node.host.is_tracker {
                    BroadcastGroup::RELAYS | BroadcastGroup::TRACKERS
                } else {
                    BroadcastGroup::RELAYS
                };
                channel.set_output_group(output_id, group);
            }
        }
        channel.add_node(node);
    }
}

/// Progress of one downstream through the channel's content.
struct StreamCursor {
    header_position: u64,
    /// Highest position already sent.
    position: u64,
}

fn chan_atom(channel_id: ChannelId, mut children: Vec<Atom>) -> Atom {
    children.insert(0, Atom::with_id(name::CHAN_ID, channel_id));
    Atom::with_children(name::CHAN, children)
}

/// Positions travel as their low 32 bits.
fn packet_atom(kind: &'static [u8], packet: &ContentPacket) -> Atom {
    let mut children = vec![
        Atom::with_value(name::CHAN_PKT_TYPE, kind),
        Atom::with_u32(name::CHAN_PKT_POS, packet.position as u32),
    ];
    if packet.continuation {
        children.push(Atom::with_u8(name::CHAN_PKT_CONTINUATION, 1));
    }
    children.push(Atom::with_value(name::CHAN_PKT_DATA, packet.data.clone()));
    Atom::with_children(name::CHAN_PKT, children)
}
