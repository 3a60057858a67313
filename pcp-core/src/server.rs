use {
    crate::{
        access::AccessControlInfo,
        peercast::PeerCast,
        registry::AcceptedConnection,
    },
    bytes::BytesMut,
    std::{
        io,
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    },
    tokio::{
        io::AsyncReadExt,
        net::{TcpListener, TcpStream},
        time::timeout,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

const SNIFF_CHUNK: usize = 512;

/// Accepts node-to-node connections and hands each one to the output factory
/// that recognises its first bytes.
pub struct RelayServer {
    peercast: Arc<PeerCast>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl RelayServer {
    pub async fn bind(peercast: Arc<PeerCast>, addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        peercast.set_listen_port(local_addr.port());
        Ok(Self {
            peercast,
            listener,
            local_addr,
        })
    }

    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until `shutdown` fires. Connections already handed to a factory
    /// keep running until the node itself shuts down.
    pub async fn run(self, shutdown: CancellationToken) -> io::Result<()> {
        let max_connections = self.peercast.settings().max_connections;
        let active_connections = Arc::new(AtomicUsize::new(0));
        info!(
            "pcp server listening on tcp://{} (max_connections: {max_connections})",
            self.local_addr
        );

        loop {
            let (tcp, remote_addr) = tokio::select! {
                () = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                },
            };

            let current = active_connections.load(Ordering::Relaxed);
            if current >= max_connections {
                warn!(
                    %remote_addr,
                    "connection rejected: at capacity ({current}/{max_connections})"
                );
                drop(tcp);
                continue;
            }

            active_connections.fetch_add(1, Ordering::Relaxed);
            let conn_counter = active_connections.clone();
            let peercast = self.peercast.clone();
            tokio::spawn(async move {
                if let Err(err) = handle_connection(peercast, tcp, remote_addr).await {
                    debug!(%remote_addr, "connection closed before dispatch: {err}");
                }
                conn_counter.fetch_sub(1, Ordering::Relaxed);
            });
        }

        info!("pcp server on {} stopped", self.local_addr);
        Ok(())
    }
}

/// Sniff the header, then run the matching output to completion.
async fn handle_connection(
    peercast: Arc<PeerCast>,
    mut tcp: TcpStream,
    remote_addr: SocketAddr,
) -> io::Result<()> {
    let settings = peercast.settings();
    let local_addr = tcp.local_addr()?;
    let limit = settings.handshake_timeout();
    let sniffed = timeout(limit, sniff(&peercast, &mut tcp, settings.max_header_bytes))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "no recognisable header"))??;
    let Some(header) = sniffed else {
        debug!(%remote_addr, "unrecognised request");
        return Ok(());
    };

    let Some((factory, channel_id)) = peercast.output_factories().find(&header) else {
        return Ok(());
    };
    debug!(%remote_addr, factory = factory.name(), %channel_id, "connection dispatched");
    let (reader, writer) = tcp.into_split();
    let connection = AcceptedConnection {
        reader: Box::new(reader),
        writer: Box::new(writer),
        local_addr,
        remote_addr,
        access: AccessControlInfo::default(),
        header: header.freeze(),
    };
    factory
        .create(peercast.clone(), connection, channel_id)
        .join()
        .await;
    Ok(())
}

/// Read until a factory recognises the bytes. `None` when the peer hangs up,
/// the header limit is reached or a complete HTTP header matches nothing.
async fn sniff(
    peercast: &PeerCast,
    tcp: &mut TcpStream,
    max_header_bytes: usize,
) -> io::Result<Option<BytesMut>> {
    let mut header = BytesMut::with_capacity(SNIFF_CHUNK);
    loop {
        if peercast.output_factories().find(&header).is_some() {
            return Ok(Some(header));
        }
        if header.len() >= max_header_bytes || header.windows(4).any(|w| w == b"\r\n\r\n") {
            return Ok(None);
        }
        let want = SNIFF_CHUNK.min(max_header_bytes - header.len());
        let mut chunk = vec![0u8; want];
        let n = tcp.read(&mut chunk).await?;
        if n == 0 {
            return Ok(None);
        }
        header.extend_from_slice(&chunk[..n]);
    }
}
