//! Stream sockets over TCP/IPv4 and TCP/IPv6.

use crate::{
    address::Variant,
    error::TransportError,
    flags::MessageFlags,
    id::Token,
    io::Operation,
    options::{OptionValue, ProtocolOptions, SocketOption},
    packet::{Packet, RxMeta, TxMeta},
    port::{ConnectStatus, Port, PortCx},
    protocol::{CloseOp, ConnectStart, Protocol},
    queue::{receive_stream, ReceivedData},
    socket::Socket,
    transport::Inbound,
    SocketError,
};
use std::net::SocketAddr;

pub(crate) struct Tcp {
    variant: Variant,
}

pub(crate) static TCP4: Tcp = Tcp {
    variant: Variant::Tcp4,
};

pub(crate) static TCP6: Tcp = Tcp {
    variant: Variant::Tcp6,
};

impl Tcp {
    fn post_accept(&self, cx: &mut PortCx<'_>) -> Result<(), SocketError> {
        let port = &mut *cx.port;
        let token = cx.tokens.issue(port.id, Operation::Accept);
        if let Err(e) = port.transport.accept(token) {
            cx.tokens.retire(token);
            return Err(e.into());
        }
        port.accept_token = Some(token);
        Ok(())
    }
}

impl Protocol for Tcp {
    fn variant(&self) -> Variant {
        self.variant
    }

    fn supports_urgent(&self) -> bool {
        true
    }

    fn verify_local_address(&self, address: &SocketAddr) -> Result<(), SocketError> {
        if self.variant.accepts(address) {
            Ok(())
        } else {
            Err(SocketError::InvalidArgument)
        }
    }

    fn allocate_port(&self, port: &mut Port, socket: &Socket) -> Result<(), SocketError> {
        port.config.no_delay = socket.options.protocol.no_delay;
        Ok(())
    }

    fn set_remote_address(&self, port: &mut Port, address: SocketAddr) -> Result<(), SocketError> {
        if !self.variant.accepts(&address) || address.ip().is_unspecified() || address.port() == 0 {
            return Err(SocketError::InvalidArgument);
        }
        port.config.remote = Some(address);
        Ok(())
    }

    fn start_connect(&self, cx: &mut PortCx<'_>) -> Result<ConnectStart, SocketError> {
        let port = &mut *cx.port;
        port.config.passive = false;
        port.configure()?;
        let token = cx.tokens.issue(port.id, Operation::Connect);
        if let Err(e) = port.transport.connect(token) {
            cx.tokens.retire(token);
            return Err(e.into());
        }
        port.connect_token = Some(token);
        port.connect = ConnectStatus::Pending;
        Ok(ConnectStart::Pending)
    }

    fn poll_connect(&self, port: &Port) -> Result<(), SocketError> {
        match port.connect {
            ConnectStatus::Idle => Err(SocketError::NotConnected),
            ConnectStatus::Pending => Err(SocketError::InProgress),
            ConnectStatus::Connected => Ok(()),
            ConnectStatus::Failed(e) => Err(e),
        }
    }

    fn listen(&self, cx: &mut PortCx<'_>) -> Result<(), SocketError> {
        if !cx.port.listening {
            cx.port.config.passive = true;
            cx.port.config.remote = None;
            cx.port.configure()?;
            cx.port.listening = true;
        }
        self.post_accept(cx)
    }

    fn accept(&self, port: &mut Port) -> Result<(), SocketError> {
        let mode = port.transport.mode_data();
        if let Some(local) = mode.local {
            port.config.local = local;
        }
        port.config.remote = mode.remote;
        port.config.passive = false;
        Ok(())
    }

    fn get_option(
        &self,
        options: &ProtocolOptions,
        option: SocketOption,
    ) -> Result<OptionValue, SocketError> {
        match option {
            SocketOption::TimeToLive => Ok(OptionValue::U8(options.time_to_live)),
            SocketOption::TypeOfService => Ok(OptionValue::U8(options.type_of_service)),
            SocketOption::NoDelay => Ok(OptionValue::Bool(options.no_delay)),
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
            SocketOption::NoDelay => options.no_delay = value.ok_bool()?,
            _ => return Err(SocketError::NotSupported),
        }
        Ok(())
    }

    fn close_port_op(&self, cx: &mut PortCx<'_>, token: Token) -> Result<CloseOp, SocketError> {
        let abort = cx.port.close_now;
        cx.port.transport.close(token, abort)?;
        Ok(CloseOp::Pending)
    }

    fn receive(
        &self,
        socket: &mut Socket,
        flags: MessageFlags,
        len: usize,
    ) -> Result<Option<ReceivedData>, SocketError> {
        Ok(receive_stream(socket, flags, len))
    }

    fn on_receive_complete(&self, _port: &Port, inbound: &Inbound) -> Result<RxMeta, TransportError> {
        let urgent = inbound.urgent;
        Ok(match self.variant {
            Variant::Tcp6 => RxMeta::Tcp6 { urgent },
            _ => RxMeta::Tcp4 { urgent },
        })
    }

    fn transmit(
        &self,
        _socket: &Socket,
        data: &[u8],
        urgent: bool,
        to: Option<SocketAddr>,
    ) -> Result<Packet, SocketError> {
        if to.is_some() {
            return Err(SocketError::AlreadyConnected);
        }
        let meta = match self.variant {
            Variant::Tcp6 => TxMeta::Tcp6 { urgent },
            _ => TxMeta::Tcp4 { urgent },
        };
        Ok(Packet::for_transmit(data, meta))
    }
}
