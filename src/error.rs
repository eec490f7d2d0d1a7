//! Errors reported by the socket layer and by the transports it drives.

use thiserror::Error as ThisError;

/// Why a connection could not be established or was lost.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    #[error("connection refused")]
    Refused,
    #[error("connection reset")]
    Reset,
    #[error("timed out")]
    TimedOut,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("aborted")]
    Aborted,
}

/// An error returned from a socket operation.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketError {
    #[error("Invalid argument")]
    InvalidArgument,
    #[error("No service could provide the requested local address")]
    AddressUnavailable,
    #[error("Out of resources")]
    ResourceExhausted,
    #[error("The socket is not connected")]
    NotConnected,
    #[error("The socket is already connected")]
    AlreadyConnected,
    #[error("The operation would block")]
    WouldBlock,
    #[error("The operation is still in progress")]
    InProgress,
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[from] FailureKind),
    #[error("The operation was already started")]
    AlreadyStarted,
    #[error("No ports remain on the socket")]
    NoPorts,
    #[error("The operation is not supported by this protocol")]
    NotSupported,
    #[error("No socket has the given identifier")]
    InvalidSocket,
}

impl SocketError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::WouldBlock | Self::InProgress)
    }
}

/// The completion status a transport reports for an operation.
#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportError {
    #[error("Connection refused by the peer")]
    ConnectionRefused,
    #[error("Connection reset by the peer")]
    ConnectionReset,
    #[error("Operation timed out")]
    TimedOut,
    #[error("Host unreachable")]
    HostUnreachable,
    #[error("Network unreachable")]
    NetworkUnreachable,
    #[error("Operation aborted")]
    Aborted,
    #[error("The peer closed its side of the connection")]
    EndOfStream,
    #[error("Out of resources")]
    OutOfResources,
    #[error("Invalid parameter")]
    InvalidParameter,
    #[error("Unsupported operation")]
    Unsupported,
    #[error("Already started")]
    AlreadyStarted,
    #[error("Not started")]
    NotStarted,
    #[error("Address not available")]
    NoMapping,
    #[error("Device error")]
    DeviceError,
}

impl From<TransportError> for SocketError {
    fn from(value: TransportError) -> Self {
        match value {
            TransportError::ConnectionRefused => FailureKind::Refused.into(),
            TransportError::ConnectionReset => FailureKind::Reset.into(),
            TransportError::TimedOut => FailureKind::TimedOut.into(),
            TransportError::HostUnreachable => FailureKind::HostUnreachable.into(),
            TransportError::NetworkUnreachable | TransportError::DeviceError => {
                FailureKind::NetworkUnreachable.into()
            }
            TransportError::Aborted => FailureKind::Aborted.into(),
            TransportError::EndOfStream | TransportError::NotStarted => Self::NotConnected,
            TransportError::OutOfResources => Self::ResourceExhausted,
            TransportError::InvalidParameter => Self::InvalidArgument,
            TransportError::Unsupported => Self::NotSupported,
            TransportError::AlreadyStarted => Self::AlreadyStarted,
            TransportError::NoMapping => Self::AddressUnavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_status_maps_to_failure_kind() {
        assert_eq!(
            SocketError::from(TransportError::ConnectionRefused),
            SocketError::ConnectionFailed(FailureKind::Refused)
        );
        assert_eq!(
            SocketError::from(TransportError::NoMapping),
            SocketError::AddressUnavailable
        );
        assert!(SocketError::WouldBlock.is_pending());
        assert!(!SocketError::NotConnected.is_pending());
    }
}
