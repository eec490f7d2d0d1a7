//! The capability tables of every supported variant.

use crate::{address::Variant, protocol::Protocol};

pub(crate) mod ip4;
pub(crate) mod tcp;
pub(crate) mod udp;

/// The table driving sockets of `variant`.
pub(crate) fn table(variant: Variant) -> &'static dyn Protocol {
    match variant {
        Variant::RawIp4 => &ip4::RAW_IP4,
        Variant::Tcp4 => &tcp::TCP4,
        Variant::Tcp6 => &tcp::TCP6,
        Variant::Udp4 => &udp::UDP4,
        Variant::Udp6 => &udp::UDP6,
    }
}
