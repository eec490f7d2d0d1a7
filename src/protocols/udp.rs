//! Datagram sockets over UDP/IPv4 and UDP/IPv6.

use crate::{
    address::Variant,
    error::TransportError,
    flags::MessageFlags,
    id::Token,
    options::{OptionValue, ProtocolOptions, SocketOption},
    packet::{Packet, RxMeta, TxMeta},
    port::{ConnectStatus, Port, PortCx},
    protocol::{CloseOp, ConnectStart, Protocol},
    queue::{receive_datagram, ReceivedData},
    socket::Socket,
    transport::Inbound,
    SocketError,
};
use std::net::SocketAddr;

pub(crate) struct Udp {
    variant: Variant,
}

pub(crate) static UDP4: Udp = Udp {
    variant: Variant::Udp4,
};

pub(crate) static UDP6: Udp = Udp {
    variant: Variant::Udp6,
};

impl Protocol for Udp {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn verify_local_address(&self, address: &SocketAddr) -> Result<(), SocketError> {
        if self.variant.accepts(address) {
            Ok(())
        } else {
            Err(SocketError::InvalidArgument)
        }
    }

    fn set_remote_address(&self, port: &mut Port, address: SocketAddr) -> Result<(), SocketError> {
        if !self.variant.accepts(&address) || address.port() == 0 {
            return Err(SocketError::InvalidArgument);
        }
        port.config.remote = Some(address);
        Ok(())
    }

    fn start_connect(&self, cx: &mut PortCx<'_>) -> Result<ConnectStart, SocketError> {
        cx.port.configure()?;
        cx.port.connect = ConnectStatus::Connected;
        cx.port.established = true;
        Ok(ConnectStart::Complete)
    }

    fn poll_connect(&self, port: &Port) -> Result<(), SocketError> {
        match port.config.remote {
            Some(_) => Ok(()),
            None => Err(SocketError::NotConnected),
        }
    }

    fn get_option(
        &self,
        options: &ProtocolOptions,
        option: SocketOption,
    ) -> Result<OptionValue, SocketError> {
        match option {
            SocketOption::TimeToLive => Ok(OptionValue::U8(options.time_to_live)),
            SocketOption::TypeOfService => Ok(OptionValue::U8(options.type_of_service)),
            _ => Err(SocketError::NotSupported),
        }
    }

    fn set_option(
        &self,
        options: &mut ProtocolOptions,
        option: SocketOption,
        value: OptionValue,
    ) -> Result<(), SocketError> {
        match option {
            SocketOption::TimeToLive => options.time_to_live = value.ok_u8()?,
            SocketOption::TypeOfService => options.type_of_service = value.ok_u8()?,
            _ => return Err(SocketError::NotSupported),
        }
        Ok(())
    }

    /// Datagram transports have no connection to tear down, so a reset is the
    /// whole close.
    fn close_port_op(&self, cx: &mut PortCx<'_>, _token: Token) -> Result<CloseOp, SocketError> {
        cx.port.transport.configure(None)?;
        Ok(CloseOp::Complete)
    }

    fn receive(
        &self,
        socket: &mut Socket,
        flags: MessageFlags,
        len: usize,
    ) -> Result<Option<ReceivedData>, SocketError> {
        Ok(receive_datagram(socket, flags, len))
    }

    fn on_receive_complete(&self, _port: &Port, inbound: &Inbound) -> Result<RxMeta, TransportError> {
        match inbound.remote {
            Some(SocketAddr::V4(remote)) if self.variant == Variant::Udp4 => Ok(RxMeta::Udp4 {
                remote,
                local: match inbound.local {
                    Some(SocketAddr::V4(local)) => Some(local),
                    _ => None,
                },
            }),
            Some(SocketAddr::V6(remote)) if self.variant == Variant::Udp6 => Ok(RxMeta::Udp6 {
                remote,
                local: match inbound.local {
                    Some(SocketAddr::V6(local)) => Some(local),
                    _ => None,
                },
            }),
            _ => Err(TransportError::InvalidParameter),
        }
    }

    fn transmit(
        &self,
        _socket: &Socket,
        data: &[u8],
        _urgent: bool,
        to: Option<SocketAddr>,
    ) -> Result<Packet, SocketError> {
        let meta = match (self.variant, to) {
            (Variant::Udp4, None) => TxMeta::Udp4 { remote: None },
            (Variant::Udp6, None) => TxMeta::Udp6 { remote: None },
            (Variant::Udp4, Some(SocketAddr::V4(remote))) if remote.port() != 0 => TxMeta::Udp4 {
                remote: Some(remote),
            },
            (Variant::Udp6, Some(SocketAddr::V6(remote))) if remote.port() != 0 => TxMeta::Udp6 {
                remote: Some(remote),
            },
            _ => return Err(SocketError::InvalidArgument),
        };
        Ok(Packet::for_transmit(data, meta))
    }
}
