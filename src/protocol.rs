//! The per-variant capability table.
//!
//! Each protocol variant implements [`Protocol`] once, as a static value. The
//! socket layer never matches on the variant to decide behavior; it asks the
//! socket's table. Operations a variant lacks keep the default body, which
//! reports [`SocketError::NotSupported`].

use crate::{
    address::Variant,
    error::TransportError,
    flags::MessageFlags,
    id::Token,
    options::{OptionValue, ProtocolOptions, SocketOption},
    packet::{Packet, RxMeta},
    port::{Port, PortCx},
    queue::ReceivedData,
    socket::Socket,
    transport::Inbound,
    SocketError,
};
use std::net::SocketAddr;

/// How `start_connect` left the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectStart {
    /// A connect token is outstanding.
    Pending,
    /// The port is ready to exchange data.
    Complete,
}

/// How `close_port_op` left the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseOp {
    /// The transport will report the close with the given token.
    Pending,
    /// The transport is already reset.
    Complete,
}

/// Which socket queue a discarded packet was accounted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accounting {
    Rx,
    Tx,
    TxUrgent,
}

pub(crate) trait Protocol: Send + Sync {
    fn variant(&self) -> Variant;

    fn supports_urgent(&self) -> bool {
        false
    }

    /// Checks that `address` can be a local address for this variant.
    fn verify_local_address(&self, address: &SocketAddr) -> Result<(), SocketError>;

    /// Fills in the variant-specific parts of a new port's configuration.
    fn allocate_port(&self, _port: &mut Port, _socket: &Socket) -> Result<(), SocketError> {
        Ok(())
    }

    fn is_configured(&self, port: &Port) -> bool {
        port.configured
    }

    /// The local address in use, as reported by the transport once configured.
    fn local_address(&self, port: &Port) -> SocketAddr {
        if port.configured {
            if let Some(local) = port.transport.mode_data().local {
                return local;
            }
        }
        port.config.local
    }

    fn set_local_address(&self, port: &mut Port, address: SocketAddr) -> Result<(), SocketError> {
        self.verify_local_address(&address)?;
        port.config.local = address;
        Ok(())
    }

    fn remote_address(&self, port: &Port) -> Option<SocketAddr> {
        if port.configured {
            if let Some(remote) = port.transport.mode_data().remote {
                return Some(remote);
            }
        }
        port.config.remote
    }

    fn set_remote_address(&self, port: &mut Port, address: SocketAddr) -> Result<(), SocketError> {
        if !self.variant().accepts(&address) {
            return Err(SocketError::InvalidArgument);
        }
        port.config.remote = Some(address);
        Ok(())
    }

    fn start_connect(&self, _cx: &mut PortCx<'_>) -> Result<ConnectStart, SocketError> {
        Err(SocketError::NotSupported)
    }

    /// The connect status of one port.
    fn poll_connect(&self, _port: &Port) -> Result<(), SocketError> {
        Err(SocketError::NotSupported)
    }

    /// Configures the port passively and posts an accept.
    fn listen(&self, _cx: &mut PortCx<'_>) -> Result<(), SocketError> {
        Err(SocketError::NotSupported)
    }

    /// Adopts the addresses of an accepted connection.
    fn accept(&self, _port: &mut Port) -> Result<(), SocketError> {
        Err(SocketError::NotSupported)
    }

    fn get_option(
        &self,
        _options: &ProtocolOptions,
        _option: SocketOption,
    ) -> Result<OptionValue, SocketError> {
        Err(SocketError::NotSupported)
    }

    fn set_option(
        &self,
        _options: &mut ProtocolOptions,
        _option: SocketOption,
        _value: OptionValue,
    ) -> Result<(), SocketError> {
        Err(SocketError::NotSupported)
    }

    /// Releases a packet that leaves a socket queue without being delivered
    /// in full, keeping the byte counters exact.
    fn free_packet(&self, socket: &mut Socket, mut packet: Packet, accounting: Accounting) {
        let bytes = packet.valid_bytes();
        match accounting {
            Accounting::Rx => socket.rx_discarded += bytes,
            Accounting::Tx => socket.tx_bytes -= bytes,
            Accounting::TxUrgent => socket.tx_urgent_bytes -= bytes,
        }
        packet.recycle();
        socket.recycle_rx(packet);
    }

    /// Drops any protocol state held by the port.
    fn close_port(&self, _port: &mut Port) {}

    /// Starts the transport-level close of a port.
    fn close_port_op(&self, cx: &mut PortCx<'_>, token: Token) -> Result<CloseOp, SocketError>;

    /// Moves queued data into a caller buffer. `None` means nothing is queued.
    fn receive(
        &self,
        socket: &mut Socket,
        flags: MessageFlags,
        len: usize,
    ) -> Result<Option<ReceivedData>, SocketError>;

    /// Derives the packet metadata for data a receive delivered.
    fn on_receive_complete(&self, port: &Port, inbound: &Inbound) -> Result<RxMeta, TransportError>;

    fn start_receive(&self, port: &mut Port, token: Token, capacity: usize) -> Result<(), TransportError> {
        port.transport.receive(token, capacity)
    }

    /// Builds the packet for one `send`.
    fn transmit(
        &self,
        socket: &Socket,
        data: &[u8],
        urgent: bool,
        to: Option<SocketAddr>,
    ) -> Result<Packet, SocketError>;

    fn on_transmit_complete(&self, socket: &mut Socket, packet: Packet) {
        self.free_packet(socket, packet, Accounting::Tx);
    }

    fn on_urgent_transmit_complete(&self, socket: &mut Socket, packet: Packet) {
        self.free_packet(socket, packet, Accounting::TxUrgent);
    }
}
