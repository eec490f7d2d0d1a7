mod common;

use common::{addr, layer, layer_with, open_udp};
use socket_layer::{
    transport::manual::Request, Config, MessageFlags, OptionValue, ProtocolFamily, SocketError,
    SocketOption, SocketState, SocketType, TxMeta, Variant,
};

#[test]
#[tracing_test::traced_test]
fn send_to_binds_implicitly() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Udp4, 1);
    let fd = open_udp(&layer);
    let peer = addr("203.0.113.5:53");

    assert_eq!(layer.send_to(fd, b"ping", MessageFlags::empty(), peer)?, 4);
    let transport = adapters[0].transport(0);
    assert_eq!(layer.stats(fd)?.state, SocketState::Bound);
    assert_eq!(layer.local_address(fd)?, addr("10.0.0.1:49152"));
    assert_eq!(transport.pending_receives(), 1);
    assert!(transport.pending().contains(&Request::Transmit {
        data: b"ping".to_vec(),
        meta: TxMeta::Udp4 {
            remote: Some("203.0.113.5:53".parse()?),
        },
    }));

    // The implicit bind counts as a bind.
    assert_eq!(
        layer.bind(fd, addr("0.0.0.0:9")),
        Err(SocketError::InvalidArgument)
    );
    assert_eq!(
        layer.send(fd, b"nowhere", MessageFlags::empty()),
        Err(SocketError::NotConnected)
    );
    Ok(())
}

#[test]
fn datagrams_are_truncated_and_the_rest_discarded() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Udp4, 1);
    let fd = open_udp(&layer);
    layer.bind(fd, addr("0.0.0.0:5353"))?;
    let transport = adapters[0].transport(0);
    let peer = addr("203.0.113.5:9");

    assert!(transport.deliver_from(peer, b"0123456789"));
    layer.dispatch();
    assert!(transport.deliver_from(peer, b"next"));
    layer.dispatch();

    let peeked = layer.receive(fd, 4, MessageFlags::PEEK)?;
    assert_eq!(peeked.data, b"0123");
    let received = layer.receive(fd, 4, MessageFlags::empty())?;
    assert_eq!(received.data, b"0123");
    assert_eq!(received.remote, Some(peer));

    let stats = layer.stats(fd)?;
    assert_eq!(stats.rx_discarded_bytes, 6);
    assert_eq!(stats.rx_bytes, 4);
    assert_eq!(layer.receive(fd, 64, MessageFlags::empty())?.data, b"next");
    Ok(())
}

#[test]
fn connect_sets_the_default_destination() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Udp4, 1);
    let fd = open_udp(&layer);
    let peer = addr("203.0.113.5:53");

    layer.connect(fd, peer)?;
    assert_eq!(layer.stats(fd)?.state, SocketState::Connected);
    assert_eq!(layer.remote_address(fd)?, peer);

    layer.send(fd, b"query", MessageFlags::empty())?;
    let transport = adapters[0].transport(0);
    assert!(transport.pending().contains(&Request::Transmit {
        data: b"query".to_vec(),
        meta: TxMeta::Udp4 { remote: None },
    }));
    assert_eq!(
        transport.configuration().and_then(|config| config.remote),
        Some(peer)
    );
    Ok(())
}

#[test]
fn datagram_limits_are_enforced() -> anyhow::Result<()> {
    let config = Config {
        max_datagram_size: 16,
        ..Config::default()
    };
    let (layer, _adapters) = layer_with(Variant::Udp4, 1, config);
    let fd = open_udp(&layer);
    let peer = addr("203.0.113.5:53");

    assert_eq!(
        layer.send_to(fd, &[0; 17], MessageFlags::empty(), peer),
        Err(SocketError::InvalidArgument)
    );
    assert_eq!(
        layer.send_to(fd, b"x", MessageFlags::URGENT, peer),
        Err(SocketError::NotSupported)
    );
    assert_eq!(
        layer.send_to(fd, b"x", MessageFlags::empty(), addr("[2001:db8::1]:53")),
        Err(SocketError::InvalidArgument)
    );
    assert_eq!(
        layer.send_to(fd, b"x", MessageFlags::empty(), addr("203.0.113.5:0")),
        Err(SocketError::InvalidArgument)
    );
    Ok(())
}

#[test]
fn raw_sockets_carry_a_protocol_number() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::RawIp4, 1);
    assert_eq!(
        layer.open(ProtocolFamily::Inet, SocketType::Raw, 0),
        Err(SocketError::InvalidArgument)
    );
    assert_eq!(
        layer.open(ProtocolFamily::Inet6, SocketType::Raw, 1),
        Err(SocketError::InvalidArgument)
    );

    let fd = layer.open(ProtocolFamily::Inet, SocketType::Raw, 1)?;
    layer.set_option(fd, SocketOption::HeaderIncluded, OptionValue::Bool(true))?;
    layer.send_to(fd, b"echo", MessageFlags::empty(), addr("10.0.0.9:0"))?;

    let transport = adapters[0].transport(0);
    let config = transport.configuration().expect("bound raw port is configured");
    assert_eq!(config.protocol, 1);
    assert!(config.header_included);
    assert!(transport.pending().contains(&Request::Transmit {
        data: b"echo".to_vec(),
        meta: TxMeta::Ip4 {
            destination: Some("10.0.0.9".parse()?),
        },
    }));

    assert!(transport.deliver_from(addr("10.0.0.9:0"), b"reply"));
    layer.dispatch();
    let received = layer.receive(fd, 64, MessageFlags::empty())?;
    assert_eq!(received.data, b"reply");
    assert_eq!(received.remote, Some(addr("10.0.0.9:0")));
    assert_eq!(
        layer.get_option(fd, SocketOption::NoDelay),
        Err(SocketError::NotSupported)
    );
    Ok(())
}
