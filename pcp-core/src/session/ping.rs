//! Outbound reachability probe toward a peer's advertised listen port.

use {
    super::{
        errors::{SessionError, SessionErrorValue, SessionResult},
        handshake::{build_connect, build_helo, build_quit, Greeting, HeloPort, QUIT_SHUTDOWN},
        transport::AtomStream,
    },
    crate::{atom::define::name, net::is_routable, utils::SessionId},
    std::{
        net::{IpAddr, SocketAddr},
        time::Duration,
    },
    tokio::{net::TcpStream, time::timeout},
};

/// Connect to `addr`, greet it and require an `OLEH` carrying `expected`.
///
/// The whole exchange is bounded by `limit`.
pub async fn ping_handshake(
    addr: SocketAddr,
    local_session_id: SessionId,
    expected: SessionId,
    limit: Duration,
) -> SessionResult<()> {
    timeout(limit, async {
        let tcp = TcpStream::connect(addr).await?;
        let mut stream = AtomStream::from_tcp(tcp, limit);
        stream
            .write_atoms(&[
                build_connect(),
                build_helo(local_session_id, HeloPort::None, None),
            ])
            .await?;

        let reply = stream.read_atom().await?;
        if reply.name() != name::OLEH {
            return Err(SessionErrorValue::Handshake(format!(
                "expected oleh, got {}",
                reply.name()
            ))
            .into());
        }
        if Greeting::parse(&reply).session_id != Some(expected) {
            return Err(SessionErrorValue::Handshake("session id mismatch".into()).into());
        }
        let _ = stream.write_atom(&build_quit(QUIT_SHUTDOWN)).await;
        stream.shutdown().await;
        Ok::<(), SessionError>(())
    })
    .await
    .map_err(|_| SessionErrorValue::Timeout("ping"))?
}

/// Whether the peer claiming `expected` accepts connections on `ip:port`.
///
/// Non-routable addresses are never contacted and count as unreachable.
pub async fn probe_firewall(
    ip: IpAddr,
    port: u16,
    local_session_id: SessionId,
    expected: SessionId,
    limit: Duration,
) -> bool {
    if port == 0 || !is_routable(&ip) {
        tracing::debug!(%ip, port, "ping skipped for non-routable address");
        return false;
    }
    let addr = SocketAddr::new(ip, port);
    match ping_handshake(addr, local_session_id, expected, limit).await {
        Ok(()) => {
            tracing::debug!(%addr, "ping succeeded");
            true
        }
        Err(err) => {
            tracing::debug!(%addr, "ping failed: {err}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{session::handshake::build_oleh, utils::Guid},
        tokio::net::TcpListener,
    };

    /// Answers exactly one ping with `sid`.
    async fn responder(sid: SessionId) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut stream = AtomStream::from_tcp(tcp, Duration::from_secs(1));
            assert_eq!(stream.read_atom().await.unwrap().name(), name::CONNECT);
            assert_eq!(stream.read_atom().await.unwrap().name(), name::HELO);
            stream.write_atom(&build_oleh(sid, None, 0)).await.unwrap();
            let _ = stream.read_atom().await;
        });
        addr
    }

    #[tokio::test]
    async fn test_ping_accepts_matching_session() {
        let sid = Guid::new();
        let addr = responder(sid).await;
        ping_handshake(addr, Guid::new(), sid, Duration::from_secs(2))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ping_rejects_other_session() {
        let addr = responder(Guid::new()).await;
        let err = ping_handshake(addr, Guid::new(), Guid::new(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err.value, SessionErrorValue::Handshake(_)));
    }

    #[tokio::test]
    async fn test_probe_never_targets_private_addresses() {
        // a live responder on loopback is still not probed
        let sid = Guid::new();
        let addr = responder(sid).await;
        assert!(
            !probe_firewall(addr.ip(), addr.port(), Guid::new(), sid, Duration::from_secs(1)).await
        );
        assert!(
            !probe_firewall("10.1.2.3".parse().unwrap(), 7144, Guid::new(), sid, Duration::from_millis(10)).await
        );
    }
}
