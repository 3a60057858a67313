//! Nodes talking to each other over loopback TCP.

use {
    pcp_core::{
        atom::define::name,
        channel::{content::ContentPacket, info::ChannelInfo, peers::Host, peers::Node},
        session::{
            handshake::{build_helo, build_oleh, build_quit, Greeting, HeloPort},
            http::{parse_response, response_bytes, RelayRequest},
            AtomStream,
        },
        Atom, Channel, ChannelId, ChannelStatus, Guid, PeerCast, RelayServer, RelaySettings,
    },
    std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    },
    tokio::net::{TcpListener, TcpStream},
    tokio_util::sync::CancellationToken,
    url::Url,
};

const ID: &str = "531DC8DFC7FB42928AC2C0A626517A87";
const WAIT: Duration = Duration::from_secs(10);

fn channel_id() -> ChannelId {
    ChannelId::parse_hex(ID).unwrap()
}

fn settings() -> RelaySettings {
    RelaySettings {
        handshake_timeout_ms: 2000,
        connect_timeout_ms: 2000,
        ..RelaySettings::default()
    }
}

async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

struct TestNode {
    peercast: Arc<PeerCast>,
    addr: SocketAddr,
    shutdown: CancellationToken,
}

impl TestNode {
    async fn start() -> Self {
        let peercast = PeerCast::new(settings());
        let server = RelayServer::bind(peercast.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = server.local_addr();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));
        Self {
            peercast,
            addr,
            shutdown,
        }
    }

    /// A node originating the test channel with a header and two packets.
    async fn broadcasting() -> (Self, Arc<Channel>) {
        let node = Self::start().await;
        let info = ChannelInfo {
            name: "loopback".into(),
            bitrate: 128,
            ..ChannelInfo::default()
        };
        let channel = node.peercast.add_broadcast_channel(channel_id(), info);
        channel.set_header(ContentPacket::new(0, b"HEAD".to_vec()));
        channel.add_content(ContentPacket::new(4, b"AAAA".to_vec()));
        channel.add_content(ContentPacket::new(8, b"BBBB".to_vec()));
        (node, channel)
    }

    fn tracker(&self) -> Url {
        Url::parse(&format!("pcp://{}/{ID}", self.addr)).unwrap()
    }

    fn stop(&self) {
        self.shutdown.cancel();
        self.peercast.shutdown();
    }
}

fn pkt_of(chan: &Atom) -> (Vec<u8>, u32, Vec<u8>) {
    let pkt = chan.child(name::CHAN_PKT).unwrap();
    (
        pkt.get_bytes(name::CHAN_PKT_TYPE).unwrap().to_vec(),
        pkt.get_u32(name::CHAN_PKT_POS).unwrap(),
        pkt.get_bytes(name::CHAN_PKT_DATA).unwrap().to_vec(),
    )
}

/// Speak the downstream side of a relay request against `addr`.
async fn relay_client(addr: SocketAddr) -> (AtomStream, u16) {
    let tcp = TcpStream::connect(addr).await.unwrap();
    let mut client = AtomStream::from_tcp(tcp, Duration::from_secs(2));
    client
        .write_bytes(&RelayRequest::new(channel_id()).to_bytes())
        .await
        .unwrap();
    let status = client.read_header(4096, parse_response).await.unwrap();
    (client, status)
}

#[tokio::test]
async fn test_direct_relay_request() {
    let (origin, channel) = TestNode::broadcasting().await;
    let (mut client, status) = relay_client(origin.addr).await;
    assert_eq!(status, 200);

    client
        .write_atom(&build_helo(Guid::new(), HeloPort::None, None))
        .await
        .unwrap();
    let oleh = client.read_atom().await.unwrap();
    assert_eq!(
        Greeting::parse(&oleh).session_id,
        Some(origin.peercast.session_id())
    );

    let ok = client.read_atom().await.unwrap();
    assert_eq!(ok.name(), name::OK);
    assert_eq!(ok.as_u32().unwrap(), 1);

    let bundle = client.read_atom().await.unwrap();
    assert_eq!(bundle.name(), name::CHAN);
    let info = bundle.child(name::CHAN_INFO).unwrap();
    assert_eq!(info.get_string(name::CHAN_INFO_NAME).as_deref(), Some("loopback"));
    assert!(bundle.child(name::CHAN_TRACK).is_some());
    assert_eq!(pkt_of(&bundle), (b"head".to_vec(), 0, b"HEAD".to_vec()));

    assert_eq!(pkt_of(&client.read_atom().await.unwrap()).1, 4);
    assert_eq!(pkt_of(&client.read_atom().await.unwrap()).1, 8);

    channel.add_content(ContentPacket::new(12, b"CCCC".to_vec()));
    let next = client.read_atom().await.unwrap();
    assert_eq!(pkt_of(&next), (b"data".to_vec(), 12, b"CCCC".to_vec()));

    origin.stop();
}

#[tokio::test]
async fn test_relay_chain() {
    let (origin, origin_channel) = TestNode::broadcasting().await;
    let relay = TestNode::start().await;

    let channel = relay
        .peercast
        .request_channel(channel_id(), Some(origin.tracker()), false)
        .unwrap();
    wait_for("relay to receive", || {
        channel.status() == ChannelStatus::Receiving && channel.content().newest().is_some()
    })
    .await;
    assert_eq!(channel.info().name, "loopback");
    assert_eq!(channel.broadcast_id(), origin.peercast.broadcast_id());
    assert_eq!(origin_channel.relay_count(), 1);

    origin_channel.add_content(ContentPacket::new(12, b"CCCC".to_vec()));
    wait_for("new packet to reach the relay", || {
        channel.content().newest().map(|p| p.position) == Some(12)
    })
    .await;

    // a third node can now pull from the relay
    let (mut client, status) = relay_client(relay.addr).await;
    assert_eq!(status, 200);
    client
        .write_atom(&build_helo(Guid::new(), HeloPort::None, None))
        .await
        .unwrap();
    client.read_atom().await.unwrap();
    client.read_atom().await.unwrap();
    let bundle = client.read_atom().await.unwrap();
    assert_eq!(pkt_of(&bundle).2, b"HEAD".to_vec());

    relay.stop();
    origin.stop();
}

/// Origin that is full: lists `alternates` and quits with "unavailable".
async fn full_origin(alternates: Vec<SocketAddr>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (tcp, remote) = listener.accept().await.unwrap();
        let mut stream = AtomStream::from_tcp(tcp, Duration::from_secs(2));
        stream.read_header(4096, RelayRequest::parse).await.unwrap();
        stream.write_bytes(&response_bytes(503)).await.unwrap();
        let helo = stream.read_atom().await.unwrap();
        assert_eq!(helo.name(), name::HELO);
        let mut atoms = vec![build_oleh(Guid::new(), Some(remote.ip()), 0)];
        for alternate in alternates {
            let mut host = Host::new(Guid::new());
            host.addresses.push(alternate);
            let mut node = Node::new(host);
            node.is_receiving = true;
            atoms.push(node.to_host_atom(channel_id()));
        }
        atoms.push(build_quit(1003));
        stream.write_atoms(&atoms).await.unwrap();
        let _ = stream.read_atom().await;
    });
    addr
}

/// Upstream that answers every relay request with 404.
async fn missing_channel(contacted: Arc<AtomicBool>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            contacted.store(true, Ordering::SeqCst);
            let mut stream = AtomStream::from_tcp(tcp, Duration::from_secs(2));
            if stream.read_header(4096, RelayRequest::parse).await.is_ok() {
                let _ = stream.write_bytes(&response_bytes(404)).await;
            }
            stream.shutdown().await;
        }
    });
    addr
}

#[tokio::test]
async fn test_source_fails_over_to_next_peer() {
    let contacted = Arc::new(AtomicBool::new(false));
    let dead_end = missing_channel(contacted.clone()).await;
    let (healthy, _) = TestNode::broadcasting().await;
    let origin = full_origin(vec![dead_end, healthy.addr]).await;

    let node = TestNode::start().await;
    let tracker = Url::parse(&format!("pcp://{origin}/{ID}")).unwrap();
    let channel = node
        .peercast
        .request_channel(channel_id(), Some(tracker), false)
        .unwrap();

    wait_for("failover to the healthy peer", || {
        channel.status() == ChannelStatus::Receiving
            && channel.content().newest().map(|p| p.position) == Some(8)
    })
    .await;
    assert!(contacted.load(Ordering::SeqCst));
    assert_eq!(channel.upstream_address(), Some(healthy.addr));
    assert!(channel.nodes().len() >= 2);

    node.stop();
    healthy.stop();
}

#[tokio::test]
async fn test_origin_without_channel_ends_in_error() {
    let contacted = Arc::new(AtomicBool::new(false));
    let origin = missing_channel(contacted.clone()).await;

    let node = TestNode::start().await;
    let tracker = Url::parse(&format!("pcp://{origin}/{ID}")).unwrap();
    let channel = node
        .peercast
        .request_channel(channel_id(), Some(tracker), false)
        .unwrap();

    wait_for("the channel to fail", || channel.status() == ChannelStatus::Error).await;
    assert!(contacted.load(Ordering::SeqCst));
    node.stop();
}

#[tokio::test]
async fn test_shutdown_closes_relayed_channels() {
    let (origin, _) = TestNode::broadcasting().await;
    let relay = TestNode::start().await;
    let channel = relay
        .peercast
        .request_channel(channel_id(), Some(origin.tracker()), false)
        .unwrap();
    wait_for("relay to receive", || channel.status() == ChannelStatus::Receiving).await;

    relay.stop();
    assert_eq!(channel.status(), ChannelStatus::Closed);
    assert!(relay.peercast.channels().is_empty());
    assert!(relay
        .peercast
        .request_channel(channel_id(), None, false)
        .is_none());
    origin.stop();
}
