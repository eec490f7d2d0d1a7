//! Raw sockets carrying whole IPv4 payloads for one protocol number.

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
use std::net::{Ipv4Addr, SocketAddr};

pub(crate) struct RawIp4;

pub(crate) static RAW_IP4: RawIp4 = RawIp4;

fn ipv4(address: Option<SocketAddr>) -> Option<Ipv4Addr> {
    match address {
        Some(SocketAddr::V4(address)) => Some(*address.ip()),
        _ => None,
    }
}

impl Protocol for RawIp4 {
    fn variant(&self) -> Variant {
        Variant::RawIp4
    }

    fn verify_local_address(&self, address: &SocketAddr) -> Result<(), SocketError> {
        if address.is_ipv4() {
            Ok(())
        } else {
            Err(SocketError::InvalidArgument)
        }
    }

    fn allocate_port(&self, port: &mut Port, socket: &Socket) -> Result<(), SocketError> {
        port.config.protocol = socket.ip_protocol;
        port.config.header_included = socket.options.protocol.header_included;
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
            SocketOption::HeaderIncluded => Ok(OptionValue::Bool(options.header_included)),
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
            SocketOption::HeaderIncluded => options.header_included = value.ok_bool()?,
            _ => return Err(SocketError::NotSupported),
        }
        Ok(())
    }

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

    fn on_receive_complete(&self, port: &Port, inbound: &Inbound) -> Result<RxMeta, TransportError> {
        let source = ipv4(inbound.remote).ok_or(TransportError::InvalidParameter)?;
        let destination = ipv4(inbound.local)
            .or_else(|| ipv4(Some(port.config.local)))
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        Ok(RxMeta::Ip4 {
            source,
            destination,
            protocol: port.config.protocol,
        })
    }

    fn transmit(
        &self,
        _socket: &Socket,
        data: &[u8],
        _urgent: bool,
        to: Option<SocketAddr>,
    ) -> Result<Packet, SocketError> {
        let destination = match to {
            None => None,
            Some(SocketAddr::V4(to)) => Some(*to.ip()),
            Some(SocketAddr::V6(_)) => return Err(SocketError::InvalidArgument),
        };
        Ok(Packet::for_transmit(data, TxMeta::Ip4 { destination }))
    }
}
