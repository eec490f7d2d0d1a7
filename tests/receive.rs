mod common;

use common::{addr, connected_tcp, layer, open_udp};
use socket_layer::{
    FailureKind, MessageFlags, OptionValue, PollEvents, ShutdownHow, SocketError, SocketOption,
    TransportError, Variant,
};

#[test]
#[tracing_test::traced_test]
fn receive_watermark_applies_back_pressure() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    layer.set_option(fd, SocketOption::ReceiveBuffer, OptionValue::Size(1024))?;

    assert!(transport.deliver(&[1; 600]));
    layer.dispatch();
    assert_eq!(transport.pending_receives(), 1);

    assert!(transport.deliver(&[2; 600]));
    layer.dispatch();
    assert_eq!(layer.stats(fd)?.rx_bytes, 1200);
    assert_eq!(transport.pending_receives(), 0);

    // A read that crosses the packet boundary.
    let received = layer.receive(fd, 1000, MessageFlags::empty())?;
    assert_eq!(received.data.len(), 1000);
    assert_eq!(received.data[599], 1);
    assert_eq!(received.data[600], 2);

    let stats = layer.stats(fd)?;
    assert_eq!(stats.rx_bytes, 200);
    assert_eq!(stats.rx_packets, 1);
    assert_eq!(stats.rx_packet_bytes, stats.rx_bytes);
    assert_eq!(transport.pending_receives(), 1);
    Ok(())
}

#[test]
fn peek_leaves_the_queue_untouched() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    assert!(transport.deliver(b"hello"));
    layer.dispatch();

    for _ in 0..2 {
        let peeked = layer.receive(fd, 3, MessageFlags::PEEK)?;
        assert_eq!(peeked.data, b"hel");
    }
    assert_eq!(layer.stats(fd)?.rx_bytes, 5);
    assert_eq!(layer.receive(fd, 10, MessageFlags::empty())?.data, b"hello");
    assert_eq!(
        layer.receive(fd, 10, MessageFlags::empty()),
        Err(SocketError::WouldBlock)
    );
    Ok(())
}

#[test]
fn urgent_data_has_its_own_queue() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    assert!(transport.deliver_urgent(b"!"));
    layer.dispatch();
    assert!(transport.deliver(b"data"));
    layer.dispatch();

    let events = layer.poll(fd, PollEvents::READ_NORMAL | PollEvents::READ_URGENT);
    assert!(events.contains(PollEvents::READ_NORMAL | PollEvents::READ_URGENT));
    let stats = layer.stats(fd)?;
    assert_eq!((stats.rx_bytes, stats.rx_urgent_bytes), (4, 1));

    assert_eq!(layer.receive(fd, 8, MessageFlags::URGENT)?.data, b"!");
    assert_eq!(layer.receive(fd, 8, MessageFlags::empty())?.data, b"data");

    layer.send(fd, b"?", MessageFlags::URGENT)?;
    assert_eq!(layer.stats(fd)?.tx_urgent_bytes, 1);
    assert_eq!(transport.pending_transmits(), 1);
    Ok(())
}

#[test]
fn end_of_stream_reads_as_empty() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    assert!(transport.deliver(b"last"));
    layer.dispatch();
    assert!(transport.end_of_stream());
    layer.dispatch();

    assert!(layer
        .poll(fd, PollEvents::READ_NORMAL)
        .contains(PollEvents::READ_NORMAL | PollEvents::HANG_UP));
    assert_eq!(layer.receive(fd, 16, MessageFlags::empty())?.data, b"last");
    assert!(layer.receive(fd, 16, MessageFlags::empty())?.data.is_empty());
    assert_eq!(transport.pending_receives(), 0);
    assert_eq!(
        layer.get_option(fd, SocketOption::Error)?,
        OptionValue::Error(None)
    );
    Ok(())
}

#[test]
fn receive_error_is_latched_and_reported_once() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    assert!(transport.fail_receive(TransportError::ConnectionReset));
    layer.dispatch();

    assert!(layer
        .poll(fd, PollEvents::empty())
        .contains(PollEvents::ERROR));
    assert_eq!(
        layer.receive(fd, 16, MessageFlags::PEEK),
        Err(SocketError::ConnectionFailed(FailureKind::Reset))
    );
    assert_eq!(
        layer.receive(fd, 16, MessageFlags::empty()),
        Err(SocketError::ConnectionFailed(FailureKind::Reset))
    );
    assert_eq!(
        layer.receive(fd, 16, MessageFlags::empty()),
        Err(SocketError::WouldBlock)
    );
    assert_eq!(transport.pending_receives(), 0);
    Ok(())
}

#[test]
fn error_option_returns_and_clears_the_latched_error() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    assert!(transport.fail_receive(TransportError::TimedOut));
    layer.dispatch();

    assert_eq!(
        layer.get_option(fd, SocketOption::Error)?,
        OptionValue::Error(Some(SocketError::ConnectionFailed(FailureKind::TimedOut)))
    );
    assert_eq!(
        layer.get_option(fd, SocketOption::Error)?,
        OptionValue::Error(None)
    );
    Ok(())
}

#[test]
fn shutdown_read_cancels_receives_quietly() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));

    layer.shutdown(fd, ShutdownHow::Read)?;
    assert_eq!(transport.cancelled(), 1);
    layer.dispatch();

    assert!(layer.receive(fd, 16, MessageFlags::empty())?.data.is_empty());
    assert_eq!(
        layer.get_option(fd, SocketOption::Error)?,
        OptionValue::Error(None)
    );
    assert_eq!(transport.pending_receives(), 0);
    Ok(())
}

#[test]
fn shutdown_write_stops_sends() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, _transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    layer.shutdown(fd, ShutdownHow::Write)?;
    assert_eq!(
        layer.send(fd, b"x", MessageFlags::empty()),
        Err(SocketError::NotConnected)
    );
    assert!(!layer
        .poll(fd, PollEvents::WRITE_NORMAL)
        .contains(PollEvents::WRITE_NORMAL));
    Ok(())
}

#[test]
fn transmit_watermark_blocks_sends() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    layer.set_option(fd, SocketOption::SendBuffer, OptionValue::Size(8))?;

    layer.send(fd, &[0; 8], MessageFlags::empty())?;
    assert_eq!(
        layer.send(fd, b"more", MessageFlags::empty()),
        Err(SocketError::WouldBlock)
    );
    assert!(transport.complete_transmit(Ok(())));
    layer.dispatch();
    assert_eq!(layer.send(fd, b"more", MessageFlags::empty())?, 4);
    Ok(())
}

#[test]
fn transmit_error_is_reported_by_the_next_send() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    layer.send(fd, b"doomed", MessageFlags::empty())?;
    assert!(transport.complete_transmit(Err(TransportError::ConnectionReset)));
    layer.dispatch();

    assert_eq!(layer.stats(fd)?.tx_bytes, 0);
    assert_eq!(
        layer.send(fd, b"x", MessageFlags::empty()),
        Err(SocketError::ConnectionFailed(FailureKind::Reset))
    );
    Ok(())
}

#[test]
fn datagrams_over_the_watermark_are_dropped() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Udp4, 3);
    let fd = open_udp(&layer);
    layer.bind(fd, addr("0.0.0.0:5353"))?;
    layer.set_option(fd, SocketOption::ReceiveBuffer, OptionValue::Size(1024))?;
    let transports: Vec<_> = adapters.iter().map(|a| a.transport(0)).collect();
    assert!(transports.iter().all(|t| t.pending_receives() == 1));

    let peer = addr("203.0.113.5:9");
    for transport in &transports {
        assert!(transport.deliver_from(peer, &[7; 60_000]));
        layer.dispatch();
    }
    let stats = layer.stats(fd)?;
    assert_eq!(stats.rx_bytes, 60_000);
    assert_eq!(stats.rx_packets, 1);
    assert_eq!(stats.rx_discarded_bytes, 120_000);
    assert!(transports.iter().all(|t| t.pending_receives() == 0));

    let received = layer.receive(fd, 64 * 1024, MessageFlags::empty())?;
    assert_eq!(received.data.len(), 60_000);
    assert_eq!(received.remote, Some(peer));
    assert!(transports.iter().all(|t| t.pending_receives() == 1));
    Ok(())
}

#[test]
fn zero_length_stream_receive_is_rejected() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    assert!(transport.deliver(b"hello"));
    layer.dispatch();

    assert_eq!(
        layer.receive(fd, 0, MessageFlags::empty()),
        Err(SocketError::InvalidArgument)
    );
    assert_eq!(layer.stats(fd)?.rx_bytes, 5);
    assert_eq!(layer.receive(fd, 16, MessageFlags::empty())?.data, b"hello");
    Ok(())
}
