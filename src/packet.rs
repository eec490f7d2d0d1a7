//! Buffers queued on a socket or in flight on a port.
//!
//! A [`Packet`] carries one receive or transmit buffer together with metadata
//! tagged by protocol variant. The queue engine moves packets between three
//! places: free, queued on a socket, or in flight on a port's IO slot. The
//! current place is tracked explicitly so a packet can never sit in two at once.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Where a packet currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketState {
    Free,
    Queued,
    InFlight,
}

/// Metadata attached to a completed receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RxMeta {
    Ip4 {
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
    },
    Tcp4 {
        urgent: bool,
    },
    Tcp6 {
        urgent: bool,
    },
    Udp4 {
        remote: SocketAddrV4,
        local: Option<SocketAddrV4>,
    },
    Udp6 {
        remote: SocketAddrV6,
        local: Option<SocketAddrV6>,
    },
}

impl RxMeta {
    pub fn is_urgent(&self) -> bool {
        matches!(
            self,
            Self::Tcp4 { urgent: true } | Self::Tcp6 { urgent: true }
        )
    }

    /// The peer the data came from, for connectionless variants.
    pub fn remote(&self) -> Option<SocketAddr> {
        match *self {
            Self::Ip4 { source, .. } => Some(SocketAddr::from((source, 0))),
            Self::Udp4 { remote, .. } => Some(remote.into()),
            Self::Udp6 { remote, .. } => Some(remote.into()),
            Self::Tcp4 { .. } | Self::Tcp6 { .. } => None,
        }
    }
}

/// Metadata handed to the transport with a transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxMeta {
    Ip4 {
        destination: Option<Ipv4Addr>,
    },
    Tcp4 {
        urgent: bool,
    },
    Tcp6 {
        urgent: bool,
    },
    /// A missing remote sends to the port's configured peer.
    Udp4 {
        remote: Option<SocketAddrV4>,
    },
    Udp6 {
        remote: Option<SocketAddrV6>,
    },
}

impl TxMeta {
    pub fn is_urgent(&self) -> bool {
        matches!(
            self,
            Self::Tcp4 { urgent: true } | Self::Tcp6 { urgent: true }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketMeta {
    Empty,
    Rx(RxMeta),
    Tx(TxMeta),
}

/// A buffer with a read cursor.
///
/// `consumed` counts the bytes already handed to the caller and `valid` the
/// bytes still unread, so `consumed + valid` never exceeds the buffer length.
#[derive(Debug)]
pub struct Packet {
    state: PacketState,
    meta: PacketMeta,
    buffer: Vec<u8>,
    consumed: usize,
    valid: usize,
    capacity: usize,
}

impl Packet {
    /// A free receive packet able to hold `capacity` bytes.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            state: PacketState::Free,
            meta: PacketMeta::Empty,
            buffer: Vec::new(),
            consumed: 0,
            valid: 0,
            capacity,
        }
    }

    /// A queued transmit packet holding a copy of `data`.
    pub(crate) fn for_transmit(data: &[u8], meta: TxMeta) -> Self {
        Self {
            state: PacketState::Queued,
            meta: PacketMeta::Tx(meta),
            buffer: data.to_vec(),
            consumed: 0,
            valid: data.len(),
            capacity: data.len(),
        }
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn meta(&self) -> PacketMeta {
        self.meta
    }

    pub fn rx_meta(&self) -> Option<RxMeta> {
        match self.meta {
            PacketMeta::Rx(meta) => Some(meta),
            _ => None,
        }
    }

    pub fn tx_meta(&self) -> Option<TxMeta> {
        match self.meta {
            PacketMeta::Tx(meta) => Some(meta),
            _ => None,
        }
    }

    /// Unread bytes.
    pub fn valid_bytes(&self) -> usize {
        self.valid
    }

    pub fn consumed_bytes(&self) -> usize {
        self.consumed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The unread portion of the buffer.
    pub fn data(&self) -> &[u8] {
        &self.buffer[self.consumed..self.consumed + self.valid]
    }

    /// Stores received bytes, truncating to the packet's capacity. Returns the
    /// number of bytes kept.
    pub(crate) fn fill(&mut self, data: &[u8], meta: RxMeta) -> usize {
        let kept = data.len().min(self.capacity);
        self.buffer.clear();
        self.buffer.extend_from_slice(&data[..kept]);
        self.meta = PacketMeta::Rx(meta);
        self.consumed = 0;
        self.valid = kept;
        kept
    }

    /// Advances the read cursor by up to `count` bytes. Returns how many were
    /// consumed.
    pub(crate) fn consume(&mut self, count: usize) -> usize {
        let count = count.min(self.valid);
        self.consumed += count;
        self.valid -= count;
        count
    }

    pub(crate) fn transition(&mut self, to: PacketState) {
        debug_assert_ne!(self.state, to, "packet is already {to:?}");
        self.state = to;
    }

    /// Returns the packet to the free state, dropping its contents.
    pub(crate) fn recycle(&mut self) {
        self.state = PacketState::Free;
        self.meta = PacketMeta::Empty;
        self.buffer.clear();
        self.consumed = 0;
        self.valid = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(data: &[u8]) -> Packet {
        let mut packet = Packet::with_capacity(16);
        packet.fill(data, RxMeta::Tcp4 { urgent: false });
        packet.transition(PacketState::Queued);
        packet
    }

    #[test]
    fn partial_consume_moves_cursor() {
        let mut packet = received(b"hello world");
        assert_eq!(packet.consume(6), 6);
        assert_eq!(packet.data(), b"world");
        assert_eq!(packet.consumed_bytes(), 6);
        assert_eq!(packet.valid_bytes(), 5);
        assert_eq!(packet.consume(100), 5);
        assert_eq!(packet.valid_bytes(), 0);
    }

    #[test]
    fn fill_truncates_to_capacity() {
        let mut packet = Packet::with_capacity(4);
        assert_eq!(packet.fill(b"abcdef", RxMeta::Tcp4 { urgent: true }), 4);
        assert_eq!(packet.data(), b"abcd");
        assert!(packet.rx_meta().unwrap().is_urgent());
    }

    #[test]
    fn recycle_clears_state() {
        let mut packet = received(b"abc");
        packet.recycle();
        assert_eq!(packet.state(), PacketState::Free);
        assert_eq!(packet.meta(), PacketMeta::Empty);
        assert!(packet.data().is_empty());
    }

    #[test]
    fn datagram_meta_carries_remote() {
        let remote: SocketAddrV4 = "10.0.0.2:53".parse().unwrap();
        let meta = RxMeta::Udp4 {
            remote,
            local: None,
        };
        assert_eq!(meta.remote(), Some(SocketAddr::V4(remote)));
        assert!(!meta.is_urgent());
    }
}
