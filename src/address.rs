use crate::SocketError;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// The address family a socket communicates in.
///
/// ProtocolFamily::Inet - the socket utilizes IPv4
///
/// ProtocolFamily::Inet6 - the socket utilizes IPv6
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolFamily {
    Inet,
    Inet6,
}

/// SocketType::Stream - a reliable byte stream (TCP)
///
/// SocketType::Datagram - message boundaries preserved (UDP)
///
/// SocketType::Raw - whole IP payloads for a chosen protocol number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SocketType {
    Stream,
    Datagram,
    Raw,
}

/// One concrete transport family. A socket's variant decides which capability
/// table drives it and which services it can bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Variant {
    RawIp4,
    Tcp4,
    Tcp6,
    Udp4,
    Udp6,
}

impl Variant {
    /// Picks the variant for an `open` request. Returns the variant and the IP
    /// protocol number the socket carries.
    pub fn select(
        family: ProtocolFamily,
        socket_type: SocketType,
        protocol: u8,
    ) -> Result<(Self, u8), SocketError> {
        use ProtocolFamily::*;
        use SocketType::*;
        match (family, socket_type, protocol) {
            (Inet, Stream, 0 | IPPROTO_TCP) => Ok((Self::Tcp4, IPPROTO_TCP)),
            (Inet6, Stream, 0 | IPPROTO_TCP) => Ok((Self::Tcp6, IPPROTO_TCP)),
            (Inet, Datagram, 0 | IPPROTO_UDP) => Ok((Self::Udp4, IPPROTO_UDP)),
            (Inet6, Datagram, 0 | IPPROTO_UDP) => Ok((Self::Udp6, IPPROTO_UDP)),
            (Inet, Raw, p) if p != 0 => Ok((Self::RawIp4, p)),
            _ => Err(SocketError::InvalidArgument),
        }
    }

    pub fn family(self) -> ProtocolFamily {
        match self {
            Self::RawIp4 | Self::Tcp4 | Self::Udp4 => ProtocolFamily::Inet,
            Self::Tcp6 | Self::Udp6 => ProtocolFamily::Inet6,
        }
    }

    pub fn socket_type(self) -> SocketType {
        match self {
            Self::RawIp4 => SocketType::Raw,
            Self::Tcp4 | Self::Tcp6 => SocketType::Stream,
            Self::Udp4 | Self::Udp6 => SocketType::Datagram,
        }
    }

    pub fn is_connection_oriented(self) -> bool {
        self.socket_type() == SocketType::Stream
    }

    /// Whether an address belongs to this variant's family.
    pub fn accepts(self, address: &SocketAddr) -> bool {
        match self.family() {
            ProtocolFamily::Inet => address.is_ipv4(),
            ProtocolFamily::Inet6 => address.is_ipv6(),
        }
    }

    /// The unspecified address with port zero.
    pub fn wildcard(self) -> SocketAddr {
        match self.family() {
            ProtocolFamily::Inet => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            ProtocolFamily::Inet6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_variants() {
        assert_eq!(
            Variant::select(ProtocolFamily::Inet, SocketType::Stream, 0),
            Ok((Variant::Tcp4, IPPROTO_TCP))
        );
        assert_eq!(
            Variant::select(ProtocolFamily::Inet6, SocketType::Datagram, IPPROTO_UDP),
            Ok((Variant::Udp6, IPPROTO_UDP))
        );
        assert_eq!(
            Variant::select(ProtocolFamily::Inet, SocketType::Raw, 1),
            Ok((Variant::RawIp4, 1))
        );
    }

    #[test]
    fn reject_bad_combinations() {
        for (family, ty, proto) in [
            (ProtocolFamily::Inet, SocketType::Raw, 0),
            (ProtocolFamily::Inet6, SocketType::Raw, 1),
            (ProtocolFamily::Inet, SocketType::Stream, IPPROTO_UDP),
            (ProtocolFamily::Inet, SocketType::Datagram, IPPROTO_TCP),
        ] {
            assert_eq!(
                Variant::select(family, ty, proto),
                Err(SocketError::InvalidArgument)
            );
        }
    }
}
