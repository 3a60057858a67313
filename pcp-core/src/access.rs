//! Relay and play admission limits.

use {
    crate::{
        channel::{Channel, OutputId, OutputKind},
        settings::RelaySettings,
        utils::ChannelId,
    },
    dashmap::DashMap,
    std::sync::Arc,
};

pub type ChannelMap = Arc<DashMap<ChannelId, Arc<Channel>>>;

/// What the listener lets an accepted connection ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessControlInfo {
    pub accepts_relay: bool,
    pub accepts_play: bool,
}

impl Default for AccessControlInfo {
    fn default() -> Self {
        Self {
            accepts_relay: true,
            accepts_play: true,
        }
    }
}

/// Counts outputs across every channel against the configured limits.
pub struct AccessController {
    channels: ChannelMap,
    max_relays: usize,
    max_relays_per_channel: usize,
    max_directs: usize,
}

impl AccessController {
    #[must_use]
    pub fn new(channels: ChannelMap, settings: &RelaySettings) -> Self {
        Self {
            channels,
            max_relays: settings.max_relays as usize,
            max_relays_per_channel: settings.max_relays_per_channel as usize,
            max_directs: settings.max_directs as usize,
        }
    }

    /// Whether one more relay output fits, not counting `excluding` on `channel`.
    #[must_use]
    pub fn is_channel_relayable(&self, channel: &Channel, excluding: Option<OutputId>) -> bool {
        let on_channel = channel.output_count(OutputKind::Relay, excluding);
        if self.max_relays_per_channel > 0 && on_channel >= self.max_relays_per_channel {
            return false;
        }
        self.total(channel, OutputKind::Relay, on_channel) < self.max_relays
    }

    /// Whether one more direct (play) output fits.
    #[must_use]
    pub fn is_channel_playable(&self, channel: &Channel, excluding: Option<OutputId>) -> bool {
        let on_channel = channel.output_count(OutputKind::Direct, excluding);
        self.total(channel, OutputKind::Direct, on_channel) < self.max_directs
    }

    /// Outputs of `kind` on every channel, using `on_channel` for `channel` itself.
    fn total(&self, channel: &Channel, kind: OutputKind, on_channel: usize) -> usize {
        self.channels
            .iter()
            .filter(|entry| *entry.key() != channel.id())
            .map(|entry| entry.value().output_count(kind, None))
            .sum::<usize>()
            + on_channel
    }

    #[must_use]
    pub fn total_relays(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.value().relay_count())
            .sum()
    }

    #[must_use]
    pub fn total_directs(&self) -> usize {
        self.channels
            .iter()
            .map(|entry| entry.value().direct_count())
            .sum()
    }
}
