use {
    bytes::Bytes,
    parking_lot::Mutex,
    std::{cmp::Ordering, collections::VecDeque},
    tokio::sync::watch,
};

/// One chunk of a channel's stream. Equality and ordering look at `position` only.
#[derive(Debug, Clone)]
pub struct ContentPacket {
    pub position: u64,
    pub data: Bytes,
    /// Set when this chunk continues the previous one rather than starting a new frame.
    pub continuation: bool,
}

impl ContentPacket {
    pub fn new(position: u64, data: impl Into<Bytes>) -> Self {
        Self {
            position,
            data: data.into(),
            continuation: false,
        }
    }

    #[must_use]
    pub fn with_continuation(mut self, continuation: bool) -> Self {
        self.continuation = continuation;
        self
    }
}

impl PartialEq for ContentPacket {
    fn eq(&self, other: &Self) -> bool {
        self.position == other.position
    }
}

impl Eq for ContentPacket {}

impl PartialOrd for ContentPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ContentPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position.cmp(&other.position)
    }
}

/// Bounded, position-sorted packet store for one channel plus its header packet.
///
/// Cloned packets share their payload, so handing the whole backlog to a newly
/// joined output is cheap. Every successful mutation bumps a counter observable
/// through [`ChannelContentBuffer::subscribe`].
pub struct ChannelContentBuffer {
    capacity: usize,
    packets: Mutex<VecDeque<ContentPacket>>,
    header: Mutex<Option<ContentPacket>>,
    changed: watch::Sender<u64>,
}

impl ChannelContentBuffer {
    /// A capacity of zero is raised to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (changed, _) = watch::channel(0);
        Self {
            capacity,
            packets: Mutex::new(VecDeque::with_capacity(capacity)),
            header: Mutex::new(None),
            changed,
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert in position order. Returns false, leaving the buffer untouched, when a
    /// packet with the same position is already held or when the buffer is full and
    /// the packet is older than everything retained.
    pub fn add(&self, packet: ContentPacket) -> bool {
        {
            let mut packets = self.packets.lock();
            let index = match packets.binary_search_by_key(&packet.position, |p| p.position) {
                Ok(_) => return false,
                Err(index) => index,
            };
            if index == 0 && packets.len() >= self.capacity {
                return false;
            }
            packets.insert(index, packet);
            while packets.len() > self.capacity {
                packets.pop_front();
            }
        }
        self.notify();
        true
    }

    /// Packets with a position strictly greater than `position`, ascending.
    #[must_use]
    pub fn get_newer_than(&self, position: u64) -> Vec<ContentPacket> {
        let packets = self.packets.lock();
        let start = packets.partition_point(|p| p.position <= position);
        packets.range(start..).cloned().collect()
    }

    /// First packet with a position strictly greater than `position`.
    #[must_use]
    pub fn find_next_by_position(&self, position: u64) -> Option<ContentPacket> {
        let packets = self.packets.lock();
        let index = packets.partition_point(|p| p.position <= position);
        packets.get(index).cloned()
    }

    #[must_use]
    pub fn oldest(&self) -> Option<ContentPacket> {
        self.packets.lock().front().cloned()
    }

    #[must_use]
    pub fn newest(&self) -> Option<ContentPacket> {
        self.packets.lock().back().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }

    /// Replace the header. Body packets older than the new header belong to the
    /// previous stream and are discarded.
    pub fn set_header(&self, header: ContentPacket) {
        {
            let mut packets = self.packets.lock();
            let keep_from = packets.partition_point(|p| p.position < header.position);
            packets.drain(..keep_from);
            *self.header.lock() = Some(header);
        }
        self.notify();
    }

    #[must_use]
    pub fn header(&self) -> Option<ContentPacket> {
        self.header.lock().clone()
    }

    /// Drop the header and every body packet.
    pub fn clear(&self) {
        self.packets.lock().clear();
        *self.header.lock() = None;
        self.notify();
    }

    /// Receiver that observes a new value after every mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changed.subscribe()
    }

    fn notify(&self) {
        self.changed.send_modify(|version| *version = version.wrapping_add(1));
    }
}

/// Expand a 32-bit wire position to the 64-bit position nearest `reference`.
#[must_use]
pub fn unwrap_position(reference: u64, wire: u32) -> u64 {
    const SPAN: u64 = 1 << 32;
    const HALF: u64 = 1 << 31;
    let candidate = (reference & !(SPAN - 1)) | u64::from(wire);
    if candidate > reference && candidate - reference > HALF && candidate >= SPAN {
        candidate - SPAN
    } else if candidate < reference && reference - candidate > HALF {
        candidate + SPAN
    } else {
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(packets: &[ContentPacket]) -> Vec<u64> {
        packets.iter().map(|p| p.position).collect()
    }

    #[test]
    fn test_eviction_keeps_highest_positions() {
        let buffer = ChannelContentBuffer::new(3);
        for pos in [10, 20, 30, 40, 50] {
            assert!(buffer.add(ContentPacket::new(pos, vec![pos as u8])));
        }
        assert_eq!(buffer.len(), 3);
        assert_eq!(positions(&buffer.get_newer_than(0)), vec![30, 40, 50]);
        assert_eq!(buffer.oldest().unwrap().position, 30);
        assert_eq!(buffer.newest().unwrap().position, 50);

        // older than everything retained while full
        assert!(!buffer.add(ContentPacket::new(5, vec![])));
        assert_eq!(positions(&buffer.get_newer_than(0)), vec![30, 40, 50]);

        // out of order but within range evicts the oldest
        assert!(buffer.add(ContentPacket::new(45, vec![])));
        assert_eq!(positions(&buffer.get_newer_than(0)), vec![40, 45, 50]);
    }

    #[test]
    fn test_duplicate_position_is_ignored() {
        let buffer = ChannelContentBuffer::new(10);
        assert!(buffer.add(ContentPacket::new(1, b"first".to_vec())));
        assert!(!buffer.add(ContentPacket::new(1, b"second".to_vec())));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.oldest().unwrap().data.as_ref(), b"first");
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let buffer = ChannelContentBuffer::new(0);
        assert_eq!(buffer.capacity(), 1);
        buffer.add(ContentPacket::new(1, vec![]));
        buffer.add(ContentPacket::new(2, vec![]));
        assert_eq!(positions(&buffer.get_newer_than(0)), vec![2]);
    }

    #[test]
    fn test_newer_than_is_strict_and_repeatable() {
        let buffer = ChannelContentBuffer::new(10);
        for pos in [3, 1, 2, 5, 4] {
            buffer.add(ContentPacket::new(pos, vec![]));
        }
        let first = buffer.get_newer_than(2);
        assert_eq!(positions(&first), vec![3, 4, 5]);
        assert_eq!(positions(&buffer.get_newer_than(2)), positions(&first));
        assert!(buffer.get_newer_than(5).is_empty());

        assert_eq!(buffer.find_next_by_position(3).unwrap().position, 4);
        assert_eq!(buffer.find_next_by_position(0).unwrap().position, 1);
        assert!(buffer.find_next_by_position(5).is_none());
    }

    #[test]
    fn test_header_discards_older_body() {
        let buffer = ChannelContentBuffer::new(10);
        buffer.add(ContentPacket::new(100, vec![]));
        buffer.add(ContentPacket::new(200, vec![]));
        buffer.set_header(ContentPacket::new(150, b"head".to_vec()));
        assert_eq!(buffer.header().unwrap().position, 150);
        assert_eq!(positions(&buffer.get_newer_than(0)), vec![200]);

        buffer.clear();
        assert!(buffer.header().is_none());
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_change_notification() {
        let buffer = ChannelContentBuffer::new(4);
        let mut rx = buffer.subscribe();
        assert!(!rx.has_changed().unwrap());

        buffer.add(ContentPacket::new(1, vec![]));
        rx.changed().await.unwrap();
        let seen = *rx.borrow_and_update();

        // rejected insert does not notify
        buffer.add(ContentPacket::new(1, vec![]));
        assert!(!rx.has_changed().unwrap());

        buffer.set_header(ContentPacket::new(0, vec![]));
        assert!(rx.has_changed().unwrap());
        assert_ne!(*rx.borrow_and_update(), seen);
    }

    #[test]
    fn test_unwrap_position() {
        assert_eq!(unwrap_position(0, 5), 5);
        assert_eq!(unwrap_position(1000, 900), 900);
        assert_eq!(unwrap_position(0xFFFF_FFF0, 0x10), 0x1_0000_0010);
        assert_eq!(unwrap_position(0x1_0000_0010, 0xFFFF_FFF0), 0xFFFF_FFF0);
        assert_eq!(unwrap_position(0x2_0000_0000, 7), 0x2_0000_0007);
        // near zero never wraps below zero
        assert_eq!(unwrap_position(10, 0xFFFF_FFF0), 0xFFFF_FFF0);
    }
}
