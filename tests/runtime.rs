mod common;

use common::{addr, connected_tcp, layer, open_tcp};
use socket_layer::{
    MessageFlags, OptionValue, PollEvents, Shutdown, SocketError, SocketOption, SocketState,
    Variant,
};
use std::{sync::Arc, time::Duration};
use tokio::time::timeout;

const LIMIT: Duration = Duration::from_secs(5);

#[tokio::test]
#[tracing_test::traced_test]
async fn run_dispatches_until_shutdown() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let layer = Arc::new(layer);
    let shutdown = Shutdown::new();
    let runner = tokio::spawn(Arc::clone(&layer).run(shutdown.clone()));

    let fd = open_tcp(&layer);
    let remote = addr("192.0.2.7:80");
    assert_eq!(layer.connect(fd, remote), Err(SocketError::InProgress));
    let transport = adapters[0].last();
    assert!(transport.complete_connect(Ok(())));
    timeout(LIMIT, layer.connect_wait(fd, remote)).await??;

    let receiver = {
        let layer = Arc::clone(&layer);
        tokio::spawn(async move { layer.receive_wait(fd, 64, MessageFlags::empty()).await })
    };
    tokio::task::yield_now().await;
    assert!(transport.deliver(b"hello"));
    let received = timeout(LIMIT, receiver).await???;
    assert_eq!(received.data, b"hello");

    shutdown.shut_down();
    timeout(LIMIT, runner).await??;
    assert!(transport.is_closed());
    assert_eq!(layer.stats(fd), Err(SocketError::InvalidSocket));
    assert!(logs_contain("shutting down"));
    Ok(())
}

#[tokio::test]
async fn accept_wait_returns_the_next_connection() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let layer = Arc::new(layer);
    let fd = open_tcp(&layer);
    layer.bind(fd, addr("0.0.0.0:8080"))?;
    layer.listen(fd, 4)?;
    let listener = adapters[0].transport(0);

    let acceptor = {
        let layer = Arc::clone(&layer);
        tokio::spawn(async move { layer.accept_wait(fd).await })
    };
    tokio::task::yield_now().await;
    assert!(listener
        .accept_connection(addr("192.0.2.9:4000"))
        .is_some());
    let child = timeout(LIMIT, acceptor).await???;

    assert_eq!(layer.stats(child)?.state, SocketState::Connected);
    assert_eq!(layer.remote_address(child)?, addr("192.0.2.9:4000"));
    assert!(listener.has_pending_accept());
    Ok(())
}

#[tokio::test]
async fn wait_reports_requested_readiness() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));

    let events = timeout(LIMIT, layer.wait(fd, PollEvents::WRITE_NORMAL)).await?;
    assert_eq!(events, PollEvents::WRITE_NORMAL);

    assert!(transport.deliver(b"x"));
    let events = timeout(LIMIT, layer.wait(fd, PollEvents::READ_NORMAL)).await?;
    assert_eq!(events, PollEvents::READ_NORMAL);
    Ok(())
}

#[tokio::test]
async fn receive_wait_gives_up_after_the_timeout() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    let (fd, _transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));
    layer.set_option(
        fd,
        SocketOption::ReceiveTimeout,
        OptionValue::Timeout(Some(Duration::from_millis(20))),
    )?;

    let result = timeout(LIMIT, layer.receive_wait(fd, 16, MessageFlags::empty())).await?;
    assert_eq!(result, Err(SocketError::WouldBlock));
    Ok(())
}

#[tokio::test]
async fn close_wait_finishes_once_the_transport_closes() -> anyhow::Result<()> {
    let (layer, adapters) = layer(Variant::Tcp4, 1);
    adapters[0].handle.set_auto_close(false);
    let layer = Arc::new(layer);
    let (fd, transport) = connected_tcp(&layer, &adapters[0], addr("192.0.2.7:80"));

    assert_eq!(layer.close(fd), Err(SocketError::InProgress));
    let closer = {
        let layer = Arc::clone(&layer);
        tokio::spawn(async move { layer.close_wait(fd).await })
    };
    tokio::task::yield_now().await;
    assert!(!closer.is_finished());
    assert!(transport.complete_close());
    timeout(LIMIT, closer).await???;
    assert_eq!(layer.stats(fd), Err(SocketError::InvalidSocket));
    Ok(())
}

#[test]
fn poll_transports_reaches_every_port() {
    let (layer, adapters) = layer(Variant::Udp4, 2);
    let fd = common::open_udp(&layer);
    layer
        .bind(fd, addr("0.0.0.0:5353"))
        .expect("wildcard bind should attach both adapters");
    layer.poll_transports();
    layer.poll_transports();
    for adapter in &adapters {
        assert_eq!(adapter.transport(0).polls(), 2);
    }
}
