use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables shared by the channel, sessions and access control.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Relay outputs across all channels.
    pub max_relays: u32,
    /// Relay outputs per channel, 0 for no per-channel limit.
    pub max_relays_per_channel: u32,
    /// Direct (play) outputs across all channels.
    pub max_directs: u32,
    /// Content packets retained per channel.
    pub content_capacity: usize,
    pub send_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub host_info_interval_secs: u64,
    pub host_info_max_interval_secs: u64,
    pub ignore_timeout_secs: u64,
    pub node_expiry_secs: u64,
    pub ping_timeout_ms: u64,
    pub max_alternate_hosts: usize,
    pub max_header_bytes: usize,
    pub max_connections: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_relays: 8,
            max_relays_per_channel: 0,
            max_directs: 8,
            content_capacity: 100,
            send_timeout_ms: 3000,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            host_info_interval_secs: 10,
            host_info_max_interval_secs: 120,
            ignore_timeout_secs: 180,
            node_expiry_secs: 600,
            ping_timeout_ms: 2000,
            max_alternate_hosts: 8,
            max_header_bytes: 4096,
            max_connections: 1000,
        }
    }
}

impl RelaySettings {
    #[must_use]
    pub const fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    #[must_use]
    pub const fn host_info_interval(&self) -> Duration {
        Duration::from_secs(self.host_info_interval_secs)
    }

    #[must_use]
    pub const fn host_info_max_interval(&self) -> Duration {
        Duration::from_secs(self.host_info_max_interval_secs)
    }

    #[must_use]
    pub const fn ignore_timeout(&self) -> Duration {
        Duration::from_secs(self.ignore_timeout_secs)
    }

    #[must_use]
    pub const fn node_expiry(&self) -> Duration {
        Duration::from_secs(self.node_expiry_secs)
    }

    #[must_use]
    pub const fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}
