use crate::{
    address::SocketType,
    id::SocketId,
    layer::LayerState,
    socket::SocketState,
    SocketError,
};
use std::time::Duration;

/// An option readable with `get_option` and, unless noted, writable with
/// `set_option`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketOption {
    /// Receive watermark in bytes.
    ReceiveBuffer,
    /// Transmit watermark in bytes.
    SendBuffer,
    ReceiveTimeout,
    SendTimeout,
    /// The socket type. Read only.
    Type,
    /// Returns and clears the latched error. Read only.
    Error,
    /// Whether the socket is listening. Read only.
    AcceptConnections,
    ReuseAddress,
    TimeToLive,
    TypeOfService,
    /// Disable send coalescing. Stream sockets only.
    NoDelay,
    /// The caller supplies the IP header. Raw sockets only.
    HeaderIncluded,
}

impl SocketOption {
    /// Whether the option is handled by the variant's capability table rather
    /// than by the socket itself.
    pub fn is_protocol_level(self) -> bool {
        matches!(
            self,
            Self::TimeToLive | Self::TypeOfService | Self::NoDelay | Self::HeaderIncluded
        )
    }
}

/// The value of a [`SocketOption`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionValue {
    Bool(bool),
    Size(usize),
    U8(u8),
    Timeout(Option<Duration>),
    Type(SocketType),
    Error(Option<SocketError>),
}

impl OptionValue {
    /// Get the contained `bool`.
    pub fn to_bool(self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(value),
            _ => None,
        }
    }

    /// Get the contained size.
    pub fn to_size(self) -> Option<usize> {
        match self {
            Self::Size(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_u8(self) -> Option<u8> {
        match self {
            Self::U8(value) => Some(value),
            _ => None,
        }
    }

    pub fn to_timeout(self) -> Option<Option<Duration>> {
        match self {
            Self::Timeout(value) => Some(value),
            _ => None,
        }
    }

    /// Get the contained `bool` or fail with `InvalidArgument`.
    pub fn ok_bool(self) -> Result<bool, SocketError> {
        self.to_bool().ok_or(SocketError::InvalidArgument)
    }

    /// Get the contained size or fail with `InvalidArgument`.
    pub fn ok_size(self) -> Result<usize, SocketError> {
        self.to_size().ok_or(SocketError::InvalidArgument)
    }

    pub fn ok_u8(self) -> Result<u8, SocketError> {
        self.to_u8().ok_or(SocketError::InvalidArgument)
    }

    pub fn ok_timeout(self) -> Result<Option<Duration>, SocketError> {
        self.to_timeout().ok_or(SocketError::InvalidArgument)
    }
}

/// Protocol-level settings every new port of a socket is configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtocolOptions {
    pub time_to_live: u8,
    pub type_of_service: u8,
    pub no_delay: bool,
    pub header_included: bool,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            time_to_live: 64,
            type_of_service: 0,
            no_delay: false,
            header_included: false,
        }
    }
}

/// Socket-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct SocketOptions {
    pub receive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
    pub reuse_address: bool,
    pub protocol: ProtocolOptions,
}

impl LayerState {
    pub(crate) fn get_option(
        &mut self,
        fd: SocketId,
        option: SocketOption,
    ) -> Result<OptionValue, SocketError> {
        let socket = self.sockets.get_mut(&fd).ok_or(SocketError::InvalidSocket)?;
        Ok(match option {
            SocketOption::ReceiveBuffer => OptionValue::Size(socket.max_rx_buf),
            SocketOption::SendBuffer => OptionValue::Size(socket.max_tx_buf),
            SocketOption::ReceiveTimeout => OptionValue::Timeout(socket.options.receive_timeout),
            SocketOption::SendTimeout => OptionValue::Timeout(socket.options.send_timeout),
            SocketOption::Type => OptionValue::Type(socket.variant.socket_type()),
            SocketOption::Error => {
                OptionValue::Error(socket.rx_error.take().or_else(|| socket.tx_error.take()))
            }
            SocketOption::AcceptConnections => {
                OptionValue::Bool(socket.state == SocketState::Listening)
            }
            SocketOption::ReuseAddress => OptionValue::Bool(socket.options.reuse_address),
            _ => socket.protocol.get_option(&socket.options.protocol, option)?,
        })
    }

    /// Stores the option on the socket. Port settings reach the transport the
    /// next time the port is configured.
    pub(crate) fn set_option(
        &mut self,
        fd: SocketId,
        option: SocketOption,
        value: OptionValue,
    ) -> Result<(), SocketError> {
        let socket = self
            .sockets
            .get_mut(&fd)
            .filter(|s| !s.closing)
            .ok_or(SocketError::InvalidSocket)?;
        match option {
            SocketOption::ReceiveBuffer => match value.ok_size()? {
                0 => return Err(SocketError::InvalidArgument),
                size => socket.max_rx_buf = size,
            },
            SocketOption::SendBuffer => match value.ok_size()? {
                0 => return Err(SocketError::InvalidArgument),
                size => socket.max_tx_buf = size,
            },
            SocketOption::ReceiveTimeout => socket.options.receive_timeout = value.ok_timeout()?,
            SocketOption::SendTimeout => socket.options.send_timeout = value.ok_timeout()?,
            SocketOption::Type | SocketOption::Error | SocketOption::AcceptConnections => {
                return Err(SocketError::InvalidArgument)
            }
            SocketOption::ReuseAddress => socket.options.reuse_address = value.ok_bool()?,
            _ => {
                let protocol = socket.protocol;
                protocol.set_option(&mut socket.options.protocol, option, value)?;
            }
        }

        let protocol = socket.protocol;
        for pid in &socket.ports {
            if let Some(port) = self.ports.get_mut(pid) {
                port.config.receive_timeout = socket.options.receive_timeout;
                port.config.send_timeout = socket.options.send_timeout;
                port.config.time_to_live = socket.options.protocol.time_to_live;
                port.config.type_of_service = socket.options.protocol.type_of_service;
                protocol.allocate_port(port, socket)?;
            }
        }
        socket.wake();
        if option == SocketOption::ReceiveBuffer {
            self.restart_receives(fd);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrong_kind_is_invalid_argument() {
        assert_eq!(OptionValue::Size(3).ok_bool(), Err(SocketError::InvalidArgument));
        assert_eq!(OptionValue::U8(9).ok_u8(), Ok(9));
        assert_eq!(OptionValue::Timeout(None).ok_timeout(), Ok(None));
    }

    #[test]
    fn protocol_level_split() {
        assert!(SocketOption::NoDelay.is_protocol_level());
        assert!(!SocketOption::ReceiveBuffer.is_protocol_level());
    }
}
