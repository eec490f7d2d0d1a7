use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default per-socket receive watermark in bytes.
pub const DEFAULT_MAX_RX_BUF: usize = 64 * 1024;
/// Default per-socket transmit watermark in bytes.
pub const DEFAULT_MAX_TX_BUF: usize = 64 * 1024;
/// Default ceiling applied to `listen` backlogs.
pub const DEFAULT_MAX_BACKLOG: usize = 32;
/// Default size of the buffer posted with each receive.
pub const DEFAULT_RX_PACKET_SIZE: usize = 64 * 1024;
/// The largest UDP payload carried by an IPv4 datagram.
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_507;

/// Tunables for a [`SocketLayer`](crate::SocketLayer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Receive watermark inherited by every socket at open. Receiving on a
    /// port pauses while a socket buffers at least this many bytes.
    pub max_rx_buf: usize,
    /// Transmit watermark inherited by every socket at open. `send` returns
    /// [`WouldBlock`](crate::SocketError::WouldBlock) at or above it.
    pub max_tx_buf: usize,
    /// Ceiling for the backlog passed to `listen`.
    pub max_backlog: usize,
    /// Capacity of the buffer posted with each receive.
    pub rx_packet_size: usize,
    /// Largest payload accepted by a datagram or raw `send`.
    pub max_datagram_size: usize,
    /// How often [`SocketLayer::run`](crate::SocketLayer::run) pumps the
    /// transports.
    #[serde(with = "millis")]
    pub dispatch_interval: Duration,
}

impl Config {
    /// Clamps a requested backlog to `1..=max_backlog`. A request of zero asks
    /// for the ceiling.
    pub fn clamp_backlog(&self, requested: usize) -> usize {
        let ceiling = self.max_backlog.max(1);
        match requested {
            0 => ceiling,
            n => n.min(ceiling),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_rx_buf: DEFAULT_MAX_RX_BUF,
            max_tx_buf: DEFAULT_MAX_TX_BUF,
            max_backlog: DEFAULT_MAX_BACKLOG,
            rx_packet_size: DEFAULT_RX_PACKET_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            dispatch_interval: Duration::from_millis(10),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
