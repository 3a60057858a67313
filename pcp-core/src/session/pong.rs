//! Answers reachability probes from other nodes.

use {
    super::{
        errors::{SessionErrorValue, SessionResult},
        handshake::{build_oleh, build_quit, Greeting, QUIT_NOT_IDENTIFIED, QUIT_SHUTDOWN},
        transport::AtomStream,
        ConnectionHandle,
    },
    crate::{
        atom::define::name,
        peercast::PeerCast,
        registry::{AcceptedConnection, OutputStreamFactory},
        utils::{ChannelId, SessionId},
    },
    std::{net::SocketAddr, sync::Arc, time::Duration},
    tokio_util::sync::CancellationToken,
};

/// Atoms tolerated before the `HELO` arrives.
const MAX_PREAMBLE_ATOMS: usize = 4;

/// Handles connections opened with the `pcp\n` magic atom.
pub struct PongOutputFactory;

impl OutputStreamFactory for PongOutputFactory {
    fn name(&self) -> &'static str {
        "pcp-pong"
    }

    /// Probes carry no channel; the nil id marks a match.
    fn parse_channel_id(&self, header: &[u8]) -> Option<ChannelId> {
        header
            .starts_with(name::CONNECT.as_bytes())
            .then(ChannelId::nil)
    }

    fn create(
        &self,
        peercast: Arc<PeerCast>,
        connection: AcceptedConnection,
        _channel_id: ChannelId,
    ) -> ConnectionHandle {
        let cancel = peercast.child_token();
        let settings = peercast.settings();
        let stream = AtomStream::new(
            connection.reader,
            connection.writer,
            settings.send_timeout(),
        )
        .with_buffered(&connection.header);
        let session_id = peercast.session_id();
        let limit = settings.handshake_timeout();
        let remote = connection.remote_addr;
        ConnectionHandle::spawn(cancel.clone(), async move {
            match serve_pong(stream, session_id, remote, limit, cancel).await {
                Ok(()) => tracing::debug!(%remote, "pong answered"),
                Err(err) => tracing::debug!(%remote, "pong failed: {err}"),
            }
        })
    }
}

/// Read the prober's `HELO`, answer with our session id and hang up.
pub async fn serve_pong(
    mut stream: AtomStream,
    local_session_id: SessionId,
    remote: SocketAddr,
    limit: Duration,
    cancel: CancellationToken,
) -> SessionResult<()> {
    let helo = tokio::select! {
        () = cancel.cancelled() => return Ok(()),
        helo = read_helo(&mut stream, limit) => helo?,
    };

    if Greeting::parse(&helo).session_id.is_none() {
        stream.write_atom(&build_quit(QUIT_NOT_IDENTIFIED)).await?;
    } else {
        stream
            .write_atoms(&[
                build_oleh(local_session_id, Some(remote.ip()), 0),
                build_quit(QUIT_SHUTDOWN),
            ])
            .await?;
    }
    stream.shutdown().await;
    Ok(())
}

async fn read_helo(stream: &mut AtomStream, limit: Duration) -> SessionResult<crate::atom::Atom> {
    for _ in 0..MAX_PREAMBLE_ATOMS {
        let atom = stream.read_atom_timeout(limit, "pong handshake").await?;
        if atom.name() == name::HELO {
            return Ok(atom);
        }
    }
    Err(SessionErrorValue::Handshake("no helo received".into()).into())
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            atom::Atom,
            session::handshake::{build_connect, build_helo, HeloPort},
            utils::Guid,
        },
        tokio::io::{duplex, split},
    };

    fn stream_pair() -> (AtomStream, AtomStream) {
        let (a, b) = duplex(4096);
        let (ar, aw) = split(a);
        let (br, bw) = split(b);
        let limit = Duration::from_secs(1);
        (
            AtomStream::new(Box::new(ar), Box::new(aw), limit),
            AtomStream::new(Box::new(br), Box::new(bw), limit),
        )
    }

    #[test]
    fn test_parse_channel_id_matches_magic_only() {
        let factory = PongOutputFactory;
        let magic = build_connect().encode().unwrap();
        assert_eq!(factory.parse_channel_id(&magic), Some(ChannelId::nil()));
        assert_eq!(factory.parse_channel_id(b"GET /channel/"), None);
        assert_eq!(factory.parse_channel_id(b"pc"), None);
    }

    #[tokio::test]
    async fn test_pong_answers_with_own_session() {
        let (mut client, server) = stream_pair();
        let sid = Guid::new();
        let remote: SocketAddr = "198.51.100.3:5000".parse().unwrap();
        let task = tokio::spawn(serve_pong(
            server,
            sid,
            remote,
            Duration::from_secs(1),
            CancellationToken::new(),
        ));

        client
            .write_atoms(&[build_connect(), build_helo(Guid::new(), HeloPort::None, None)])
            .await
            .unwrap();
        let oleh = client.read_atom().await.unwrap();
        assert_eq!(oleh.name(), name::OLEH);
        let greeting = Greeting::parse(&oleh);
        assert_eq!(greeting.session_id, Some(sid));
        assert_eq!(greeting.remote_ip, Some(remote.ip()));
        assert_eq!(client.read_atom().await.unwrap().name(), name::QUIT);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pong_rejects_anonymous_helo() {
        let (mut client, server) = stream_pair();
        let task = tokio::spawn(serve_pong(
            server,
            Guid::new(),
            "198.51.100.3:5000".parse().unwrap(),
            Duration::from_secs(1),
            CancellationToken::new(),
        ));
        client
            .write_atom(&Atom::with_children(name::HELO, vec![]))
            .await
            .unwrap();
        let quit = client.read_atom().await.unwrap();
        assert_eq!(quit.as_u32().unwrap(), QUIT_NOT_IDENTIFIED);
        task.await.unwrap().unwrap();
    }
}
