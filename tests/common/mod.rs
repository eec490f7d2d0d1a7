#![allow(dead_code)]

use socket_layer::{
    transport::manual::{AdapterHandle, ManualAdapter, ManualHandle},
    Config, ProtocolFamily, ServiceId, SocketId, SocketLayer, SocketType, Variant,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub const ADAPTERS: [IpAddr; 3] = [
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3)),
];

pub fn addr(text: &str) -> SocketAddr {
    text.parse().expect("test address should parse")
}

pub struct Adapter {
    pub service: ServiceId,
    pub handle: AdapterHandle,
}

impl Adapter {
    /// The `index`th transport this adapter created.
    pub fn transport(&self, index: usize) -> ManualHandle {
        self.handle
            .transport(index)
            .expect("the adapter should have created the transport")
    }

    pub fn last(&self) -> ManualHandle {
        self.handle.last().expect("the adapter should have created a transport")
    }
}

/// A layer with one service of `variant` per adapter address.
pub fn layer_with(variant: Variant, adapters: usize, config: Config) -> (SocketLayer, Vec<Adapter>) {
    let layer = SocketLayer::new(config);
    let adapters = ADAPTERS[..adapters]
        .iter()
        .enumerate()
        .map(|(i, address)| {
            let (factory, handle) = ManualAdapter::new(*address);
            let service = layer.register_service(format!("eth{i}"), *address, variant, factory);
            Adapter { service, handle }
        })
        .collect();
    (layer, adapters)
}

pub fn layer(variant: Variant, adapters: usize) -> (SocketLayer, Vec<Adapter>) {
    layer_with(variant, adapters, Config::default())
}

pub fn open_tcp(layer: &SocketLayer) -> SocketId {
    layer
        .open(ProtocolFamily::Inet, SocketType::Stream, 0)
        .expect("stream socket should open")
}

pub fn open_udp(layer: &SocketLayer) -> SocketId {
    layer
        .open(ProtocolFamily::Inet, SocketType::Datagram, 0)
        .expect("datagram socket should open")
}

/// Opens a stream socket and connects it through the first adapter.
pub fn connected_tcp(layer: &SocketLayer, adapter: &Adapter, remote: SocketAddr) -> (SocketId, ManualHandle) {
    let fd = open_tcp(layer);
    assert_eq!(
        layer.connect(fd, remote),
        Err(socket_layer::SocketError::InProgress)
    );
    let transport = adapter.last();
    assert!(transport.complete_connect(Ok(())));
    layer.dispatch();
    assert_eq!(layer.connect(fd, remote), Ok(()));
    (fd, transport)
}
