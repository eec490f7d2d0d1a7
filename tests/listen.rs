mod common;

use common::{addr, layer, open_tcp, open_udp};
use socket_layer::{PollEvents, SocketError, SocketState, TransportError, Variant};

#[test]
#[tracing_test::traced_test]
fn accepted_connections_come_out_in_arrival_order() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let fd = open_tcp(&layer);
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 4)?;
    assert_eq!(layer.stats(fd)?.state, SocketState::Listening);

    let listener = adapters[0].transport(0);
    assert!(listener.has_pending_accept());
    assert_eq!(layer.accept(fd), Err(SocketError::WouldBlock));

    let first_peer = addr("198.51.100.1:5000");
    let second_peer = addr("198.51.100.2:6000");
    assert!(listener.accept_connection(first_peer).is_some());
    layer.dispatch();
    assert!(listener.has_pending_accept());
    assert!(listener.accept_connection(second_peer).is_some());
    layer.dispatch();

    assert_eq!(layer.stats(fd)?.backlog, 2);
    assert!(layer
        .poll(fd, PollEvents::READ_NORMAL)
        .contains(PollEvents::READ_NORMAL));

    let first = layer.accept(fd)?;
    let second = layer.accept(fd)?;
    assert_eq!(layer.remote_address(first)?, first_peer);
    assert_eq!(layer.remote_address(second)?, second_peer);
    assert_eq!(layer.local_address(first)?, addr("10.0.0.1:8080"));
    assert_eq!(layer.stats(first)?.state, SocketState::Connected);
    assert_eq!(layer.accept(fd), Err(SocketError::WouldBlock));
    Ok(())
}

#[test]
fn accepted_connection_receives_immediately() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let fd = open_tcp(&layer);
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 1)?;
    let child = adapters[0]
        .transport(0)
        .accept_connection(addr("198.51.100.1:5000"))
        .expect("an accept should be pending");
    layer.dispatch();
    assert_eq!(child.pending_receives(), 1);
    assert!(child.deliver(b"early"));
    layer.dispatch();

    let accepted = layer.accept(fd)?;
    let received = layer.receive(accepted, 16, Default::default())?;
    assert_eq!(received.data, b"early");
    Ok(())
}

#[test]
fn full_backlog_refuses_the_surplus_connection() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let fd = open_tcp(&layer);
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 1)?;
    let listener = adapters[0].transport(0);

    let kept = listener
        .accept_connection(addr("198.51.100.1:5000"))
        .expect("an accept should be pending");
    layer.dispatch();
    let refused = listener
        .accept_connection(addr("198.51.100.2:5000"))
        .expect("the accept should be re-posted");
    layer.dispatch();

    assert!(refused.is_closed());
    assert!(!kept.is_closed());
    assert_eq!(layer.stats(fd)?.backlog, 1);
    assert!(listener.has_pending_accept());
    Ok(())
}

#[test]
fn zero_backlog_uses_the_ceiling() -> anyhow::Result<()> {
    let (layer, _adapters) = layer(Variant::Tcp4, 1);
    let fd = open_tcp(&layer);
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 0)?;
    assert_eq!(layer.stats(fd)?.max_backlog, layer.config().max_backlog);
    Ok(())
}

#[test]
fn listen_requires_a_bound_stream_socket() -> anyhow::Result<()> {
    let (layer, _adapters) = layer(Variant::Tcp4, 1);
    let fd = open_tcp(&layer);
    assert_eq!(layer.listen(fd, 1), Err(SocketError::InvalidArgument));
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 1)?;
    assert_eq!(layer.listen(fd, 1), Err(SocketError::AlreadyStarted));

    let udp = open_udp(&layer);
    assert_eq!(layer.listen(udp, 1), Err(SocketError::NotSupported));
    Ok(())
}

#[test]
fn failed_accept_on_the_last_port_leaves_no_ports() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let fd = open_tcp(&layer);
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 1)?;

    assert!(adapters[0].transport(0).fail_accept(TransportError::DeviceError));
    layer.dispatch();

    assert_eq!(layer.stats(fd)?.state, SocketState::NoPortsAvailable);
    assert_eq!(layer.accept(fd), Err(SocketError::NoPorts));
    assert!(layer
        .poll(fd, PollEvents::empty())
        .contains(PollEvents::HANG_UP));
    Ok(())
}

#[test]
fn closing_a_listener_closes_unaccepted_connections() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let fd = open_tcp(&layer);
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 2)?;
    let child = adapters[0]
        .transport(0)
        .accept_connection(addr("198.51.100.1:5000"))
        .expect("an accept should be pending");
    layer.dispatch();

    assert_eq!(layer.close(fd), Err(SocketError::InProgress));
    layer.dispatch();
    assert!(child.is_closed());
    assert_eq!(layer.close_poll(fd), Ok(()));
    assert_eq!(layer.stats(fd).err(), Some(SocketError::InvalidSocket));
    Ok(())
}
