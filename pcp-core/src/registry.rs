//! Protocol registries: output handlers chosen by sniffing a connection's first
//! bytes, and source connectors chosen by URI scheme.

use {
    crate::{
        access::AccessControlInfo,
        channel::Channel,
        peercast::PeerCast,
        session::{BoxedReader, BoxedWriter, ConnectionHandle},
        utils::ChannelId,
    },
    bytes::Bytes,
    parking_lot::RwLock,
    std::{collections::HashMap, net::SocketAddr, sync::Arc},
    url::Url,
};

/// A connection handed over by the listener once a factory recognised it.
pub struct AcceptedConnection {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub local_addr: SocketAddr,
    pub remote_addr: SocketAddr,
    pub access: AccessControlInfo,
    /// Bytes already read while sniffing; the handler consumes them first.
    pub header: Bytes,
}

/// Serves one kind of inbound connection.
pub trait OutputStreamFactory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Channel requested by `header`, or `None` when this factory does not
    /// recognise the bytes (yet).
    fn parse_channel_id(&self, header: &[u8]) -> Option<ChannelId>;

    fn create(
        &self,
        peercast: Arc<PeerCast>,
        connection: AcceptedConnection,
        channel_id: ChannelId,
    ) -> ConnectionHandle;
}

/// Pulls a channel from upstream for URIs of one scheme.
pub trait SourceStreamFactory: Send + Sync {
    fn scheme(&self) -> &'static str;

    fn create(&self, peercast: Arc<PeerCast>, channel: Arc<Channel>, tracker: Url)
        -> ConnectionHandle;
}

/// Output factories in registration order.
#[derive(Default)]
pub struct OutputStreamRegistry {
    factories: RwLock<Vec<Arc<dyn OutputStreamFactory>>>,
}

impl OutputStreamRegistry {
    pub fn register(&self, factory: Arc<dyn OutputStreamFactory>) {
        tracing::debug!(name = factory.name(), "output factory registered");
        self.factories.write().push(factory);
    }

    /// First factory that recognises `header`, with the channel it names.
    #[must_use]
    pub fn find(&self, header: &[u8]) -> Option<(Arc<dyn OutputStreamFactory>, ChannelId)> {
        self.factories.read().iter().find_map(|factory| {
            factory
                .parse_channel_id(header)
                .map(|channel_id| (factory.clone(), channel_id))
        })
    }

    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.read().iter().map(|f| f.name()).collect()
    }
}

/// Source factories keyed by URI scheme.
#[derive(Default)]
pub struct SourceStreamRegistry {
    factories: RwLock<HashMap<String, Arc<dyn SourceStreamFactory>>>,
}

impl SourceStreamRegistry {
    /// Replaces any factory already registered for the same scheme.
    pub fn register(&self, factory: Arc<dyn SourceStreamFactory>) {
        tracing::debug!(scheme = factory.scheme(), "source factory registered");
        self.factories
            .write()
            .insert(factory.scheme().to_ascii_lowercase(), factory);
    }

    #[must_use]
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn SourceStreamFactory>> {
        self.factories
            .read()
            .get(&scheme.to_ascii_lowercase())
            .cloned()
    }
}
