//! Direct output: serves a channel to a media player as a plain HTTP stream,
//! the header bytes first and then every content packet in order.

use {
    super::{
        errors::{SessionErrorValue, StopReason},
        http::{play_response_bytes, sniff_stream_id, PlayRequest},
        transport::AtomStream,
        ConnectionHandle,
    },
    crate::{
        access::AccessControlInfo,
        channel::{
            broadcast::{BroadcastGroup, Outbox},
            Channel, OutputKind,
        },
        peercast::PeerCast,
        registry::{AcceptedConnection, OutputStreamFactory},
        utils::ChannelId,
    },
    std::{net::SocketAddr, sync::Arc},
    tokio::time::timeout,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, trace},
};

/// Serves `GET /stream/<id>` play requests.
pub struct DirectOutputFactory;

impl OutputStreamFactory for DirectOutputFactory {
    fn name(&self) -> &'static str {
        "http-direct"
    }

    fn parse_channel_id(&self, header: &[u8]) -> Option<ChannelId> {
        sniff_stream_id(header)
    }

    fn create(
        &self,
        peercast: Arc<PeerCast>,
        connection: AcceptedConnection,
        channel_id: ChannelId,
    ) -> ConnectionHandle {
        let cancel = peercast.child_token();
        let remote = connection.remote_addr;
        let output = DirectOutputConnection::new(peercast, connection, cancel.clone());
        ConnectionHandle::spawn(cancel, async move {
            let reason = output.run().await;
            debug!(%channel_id, %remote, %reason, "direct output closed");
        })
    }
}

pub struct DirectOutputConnection {
    peercast: Arc<PeerCast>,
    stream: AtomStream,
    remote: SocketAddr,
    access: AccessControlInfo,
    cancel: CancellationToken,
}

impl DirectOutputConnection {
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
                .read_header(settings.max_header_bytes, PlayRequest::parse),
        );
        let read = tokio::select! {
            () = cancel.cancelled() => return StopReason::UserShutdown,
            read = reading => read,
        };
        let request = match read {
            Ok(Ok(request)) => request,
            Ok(Err(err)) => {
                debug!(remote = %self.remote, "bad play request: {err}");
                if matches!(
                    err.value,
                    SessionErrorValue::BadRequest(_) | SessionErrorValue::HeaderTooLarge(_)
                ) {
                    let _ = self.stream.write_bytes(&play_response_bytes(400, "")).await;
                }
                return StopReason::ConnectionError;
            }
            Err(_) => {
                debug!(remote = %self.remote, "play request timed out");
                return StopReason::ConnectionError;
            }
        };

        let channel = self
            .peercast
            .request_channel(request.channel_id, None, true)
            .filter(|channel| channel.is_ready());
        let (status, reason) = match &channel {
            _ if !self.access.accepts_play => (403, StopReason::AccessDenied),
            None => (404, StopReason::ChannelNotFound),
            Some(channel) if !self.peercast.access().is_channel_playable(channel, None) => {
                (503, StopReason::Unavailable)
            }
            Some(_) => (200, StopReason::None),
        };
        info!(
            channel_id = %request.channel_id,
            remote = %self.remote,
            status,
            agent = request.user_agent.as_deref().unwrap_or(""),
            "play request"
        );
        let mime_type = channel
            .as_ref()
            .map(|channel| channel.info().mime_type)
            .unwrap_or_default();
        if let Err(err) = self
            .stream
            .write_bytes(&play_response_bytes(status, &mime_type))
            .await
        {
            debug!(remote = %self.remote, "play response failed: {err}");
            return StopReason::ConnectionError;
        }
        let Some(channel) = channel.filter(|_| status == 200) else {
            return reason;
        };

        let (outbox, _outbox_rx) = Outbox::new(1);
        let output_id = channel.add_output(
            OutputKind::Direct,
            BroadcastGroup::NONE,
            Arc::new(outbox),
            self.cancel.clone(),
        );
        let reason = self.stream_channel(&channel).await;
        channel.remove_output(output_id);
        reason
    }

    /// Header bytes, the retained backlog, then live content until either side stops.
    async fn stream_channel(&mut self, channel: &Channel) -> StopReason {
        let mut content_rx = channel.content().subscribe();
        let mut status_rx = channel.subscribe_status();
        content_rx.borrow_and_update();

        let Some(header) = channel.content().header() else {
            return StopReason::OffAir;
        };
        let mut header_position = header.position;
        let mut position = header.position;
        if let Err(reason) = self.write(&header.data).await {
            return reason;
        }
        info!(channel_id = %channel.id(), remote = %self.remote, "playing");

        loop {
            let mut body = Vec::new();
            let content = channel.content();
            if let Some(header) = content.header() {
                if header.position != header_position {
                    header_position = header.position;
                    position = position.max(header.position);
                    body.extend_from_slice(&header.data);
                }
            }
            for packet in content.get_newer_than(position) {
                position = packet.position;
                body.extend_from_slice(&packet.data);
            }
            if !body.is_empty() {
                trace!(channel_id = %channel.id(), len = body.len(), "stream bytes sent");
                if let Err(reason) = self.write(&body).await {
                    return reason;
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return StopReason::UserShutdown,
                changed = content_rx.changed() => {
                    if changed.is_err() {
                        return StopReason::OffAir;
                    }
                }
                changed = status_rx.changed() => {
                    if changed.is_err() || status_rx.borrow_and_update().is_terminal() {
                        return StopReason::OffAir;
                    }
                }
                filled = self.stream.fill() => {
                    if let Err(err) = filled {
                        debug!(remote = %self.remote, "player disconnected: {err}");
                        return StopReason::ConnectionError;
                    }
                    self.stream.discard_buffered();
                }
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), StopReason> {
        self.stream.write_bytes(bytes).await.map_err(|err| {
            debug!(remote = %self.remote, "player write failed: {err}");
            err.stop_reason()
        })
    }
}
