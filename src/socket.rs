//! Sockets and the operations that move them between states.
//!
//! A socket fans every operation out to its ports through the capability
//! table of its variant. Stream connects race the ports one at a time: the
//! first port to connect wins and the others are closed.

use crate::{
    address::{ProtocolFamily, SocketType, Variant},
    config::Config,
    error::TransportError,
    flags::PollEvents,
    id::{PortId, ServiceId, SocketId, Token},
    io::PacketQueue,
    layer::LayerState,
    logging::{latched_error_event, socket_state_event},
    options::SocketOptions,
    packet::Packet,
    port::{ConnectStatus, PortState},
    protocol::{Accounting, ConnectStart, Protocol},
    protocols,
    queue::{start_receive, start_transmit},
    transport::{Event, Transport},
    SocketError,
};
use std::{collections::VecDeque, net::SocketAddr, sync::Arc};
use tokio::sync::Notify;

/// Free receive packets a socket keeps for reuse.
const RX_POOL_LIMIT: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketState {
    Unconfigured,
    Bound,
    Listening,
    /// Every port the socket had is gone.
    NoPortsAvailable,
    Connecting,
    Connected,
    Closed,
}

/// Which directions `shutdown` disables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownHow {
    Read,
    Write,
    Both,
}

impl ShutdownHow {
    fn read(self) -> bool {
        matches!(self, Self::Read | Self::Both)
    }

    fn write(self) -> bool {
        matches!(self, Self::Write | Self::Both)
    }
}

/// A snapshot of a socket's queues and ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketStats {
    pub state: SocketState,
    pub variant: Variant,
    pub rx_bytes: usize,
    pub rx_urgent_bytes: usize,
    pub tx_bytes: usize,
    pub tx_urgent_bytes: usize,
    /// Bytes dropped unread: truncated datagrams, datagrams that arrived over
    /// the receive watermark and data queued at close.
    pub rx_discarded_bytes: usize,
    pub rx_packets: usize,
    /// Sum of the unread bytes of every packet on the normal receive queue.
    pub rx_packet_bytes: usize,
    pub backlog: usize,
    pub max_backlog: usize,
    pub ports: Vec<PortState>,
    pub rx_error: Option<SocketError>,
    pub tx_error: Option<SocketError>,
    pub rx_eof: bool,
}

pub(crate) struct Socket {
    pub id: SocketId,
    pub variant: Variant,
    pub protocol: &'static dyn Protocol,
    pub ip_protocol: u8,
    pub state: SocketState,
    pub ports: Vec<PortId>,
    pub bound: Option<SocketAddr>,
    /// `bound` came from `bind` rather than an implicit wildcard bind.
    pub bound_explicitly: bool,
    pub options: SocketOptions,

    pub rx: PacketQueue,
    pub rx_urgent: PacketQueue,
    pub tx: PacketQueue,
    pub tx_urgent: PacketQueue,
    /// Transmit bytes queued or in flight.
    pub tx_bytes: usize,
    pub tx_urgent_bytes: usize,
    pub rx_discarded: usize,
    pub rx_pool: Vec<Packet>,
    pub rx_packet_size: usize,
    pub max_rx_buf: usize,
    pub max_tx_buf: usize,

    pub rx_error: Option<SocketError>,
    pub tx_error: Option<SocketError>,
    pub rx_disabled: bool,
    pub tx_disabled: bool,
    pub rx_eof: bool,

    pub connect_error: Option<SocketError>,
    pub connect_result: Option<Result<(), SocketError>>,

    pub backlog: VecDeque<SocketId>,
    pub max_backlog: usize,
    /// The listener whose backlog holds this socket.
    pub listener: Option<SocketId>,
    pub accept_wait: Option<Arc<Notify>>,
    pub readiness: Arc<Notify>,

    pub closing: bool,
    /// Drop the record as soon as the close finishes. Set for connections no
    /// caller ever accepted.
    pub release_when_closed: bool,
}

impl Socket {
    pub fn new(
        id: SocketId,
        variant: Variant,
        protocol: &'static dyn Protocol,
        ip_protocol: u8,
        config: &Config,
    ) -> Self {
        Self {
            id,
            variant,
            protocol,
            ip_protocol,
            state: SocketState::Unconfigured,
            ports: Vec::new(),
            bound: None,
            bound_explicitly: false,
            options: SocketOptions::default(),
            rx: PacketQueue::default(),
            rx_urgent: PacketQueue::default(),
            tx: PacketQueue::default(),
            tx_urgent: PacketQueue::default(),
            tx_bytes: 0,
            tx_urgent_bytes: 0,
            rx_discarded: 0,
            rx_pool: Vec::new(),
            rx_packet_size: config.rx_packet_size,
            max_rx_buf: config.max_rx_buf,
            max_tx_buf: config.max_tx_buf,
            rx_error: None,
            tx_error: None,
            rx_disabled: false,
            tx_disabled: false,
            rx_eof: false,
            connect_error: None,
            connect_result: None,
            backlog: VecDeque::new(),
            max_backlog: 0,
            listener: None,
            accept_wait: None,
            readiness: Arc::new(Notify::new()),
            closing: false,
            release_when_closed: false,
        }
    }

    pub fn set_state(&mut self, to: SocketState) {
        if self.state != to {
            socket_state_event(self.id, self.state, to);
            self.state = to;
        }
    }

    /// Wakes tasks waiting on this socket's readiness.
    pub fn wake(&self) {
        self.readiness.notify_waiters();
    }

    pub fn recycle_rx(&mut self, packet: Packet) {
        if packet.capacity() >= self.rx_packet_size && self.rx_pool.len() < RX_POOL_LIMIT {
            self.rx_pool.push(packet);
        }
    }

    /// Records a receive error unless one is already latched.
    pub fn latch_rx_error(&mut self, error: SocketError) {
        if self.rx_error.is_none() {
            latched_error_event(self.id, "rx", error);
            self.rx_error = Some(error);
        }
    }

    /// Records a transmit error unless one is already latched.
    pub fn latch_tx_error(&mut self, error: SocketError) {
        if self.tx_error.is_none() {
            latched_error_event(self.id, "tx", error);
            self.tx_error = Some(error);
        }
    }

    /// Current readiness, filtered by `interest`.
    pub fn readiness(&self, interest: PollEvents) -> PollEvents {
        let mut events = PollEvents::empty();
        let readable = !self.rx.is_empty()
            || self.rx_eof
            || self.rx_disabled
            || (self.state == SocketState::Listening && !self.backlog.is_empty());
        if readable {
            events |= PollEvents::READ_NORMAL;
        }
        if !self.rx_urgent.is_empty() {
            events |= PollEvents::READ_URGENT;
        }
        let usable = match self.state {
            SocketState::Connected => true,
            SocketState::Unconfigured | SocketState::Bound => !self.variant.is_connection_oriented(),
            _ => false,
        };
        if usable && !self.closing && !self.tx_disabled && self.tx_bytes < self.max_tx_buf {
            events |= PollEvents::WRITE_NORMAL;
        }
        if self.rx_error.is_some() || self.tx_error.is_some() {
            events |= PollEvents::ERROR;
        }
        let orphaned = self.state == SocketState::NoPortsAvailable
            || (self.state == SocketState::Connected && self.ports.is_empty());
        if self.rx_eof || orphaned {
            events |= PollEvents::HANG_UP;
        }
        events & (interest | PollEvents::ALWAYS)
    }

    pub fn stats(&self, ports: Vec<PortState>) -> SocketStats {
        SocketStats {
            state: self.state,
            variant: self.variant,
            rx_bytes: self.rx.bytes(),
            rx_urgent_bytes: self.rx_urgent.bytes(),
            tx_bytes: self.tx_bytes,
            tx_urgent_bytes: self.tx_urgent_bytes,
            rx_discarded_bytes: self.rx_discarded,
            rx_packets: self.rx.len(),
            rx_packet_bytes: self.rx.iter().map(Packet::valid_bytes).sum(),
            backlog: self.backlog.len(),
            max_backlog: self.max_backlog,
            ports,
            rx_error: self.rx_error,
            tx_error: self.tx_error,
            rx_eof: self.rx_eof,
        }
    }
}

impl LayerState {
    pub(crate) fn open(
        &mut self,
        family: ProtocolFamily,
        socket_type: SocketType,
        protocol: u8,
    ) -> Result<SocketId, SocketError> {
        let (variant, ip_protocol) = Variant::select(family, socket_type, protocol)?;
        let id = SocketId::new(self.socket_ids.next());
        let socket = Socket::new(
            id,
            variant,
            protocols::table(variant),
            ip_protocol,
            &self.config,
        );
        self.sockets.insert(id, socket);
        tracing::debug!(target: "SOCKET", socket = %id, variant = ?variant, "opened");
        Ok(id)
    }

    /// A socket that is not closing.
    fn active_socket(&self, fd: SocketId) -> Result<&Socket, SocketError> {
        match self.sockets.get(&fd) {
            Some(socket) if !socket.closing => Ok(socket),
            _ => Err(SocketError::InvalidSocket),
        }
    }

    pub(crate) fn bind(&mut self, fd: SocketId, local: SocketAddr) -> Result<(), SocketError> {
        if self.active_socket(fd)?.state != SocketState::Unconfigured {
            return Err(SocketError::InvalidArgument);
        }
        self.bind_ports(fd, local)?;
        self.socket_mut(fd)?.bound_explicitly = true;
        Ok(())
    }

    /// Binds an unbound socket to the unspecified address of its family.
    pub(crate) fn bind_wildcard(&mut self, fd: SocketId) -> Result<(), SocketError> {
        let wildcard = self.active_socket(fd)?.variant.wildcard();
        self.bind_ports(fd, wildcard)
    }

    /// Attaches one port per matching service. Succeeds when at least one
    /// port could be configured.
    fn bind_ports(&mut self, fd: SocketId, local: SocketAddr) -> Result<(), SocketError> {
        let socket = self.active_socket(fd)?;
        let protocol = socket.protocol;
        let variant = socket.variant;
        protocol.verify_local_address(&local)?;

        let services = self.services.matching(variant, local.ip());
        let mut last_error = SocketError::AddressUnavailable;
        let mut bound = 0;
        for service in services {
            match self.attach_port(fd, service, local) {
                Ok(_) => bound += 1,
                Err(e) => last_error = e,
            }
        }
        if bound == 0 {
            return Err(last_error);
        }
        let socket = self.socket_mut(fd)?;
        socket.bound = Some(local);
        socket.set_state(SocketState::Bound);
        Ok(())
    }

    fn attach_port(
        &mut self,
        fd: SocketId,
        service: ServiceId,
        local: SocketAddr,
    ) -> Result<PortId, SocketError> {
        let pid = self.allocate_port(fd, service, None, local)?;
        let mut cx = self.port_cx(pid).ok_or(SocketError::InvalidArgument)?;
        match cx.port.configure() {
            Ok(()) => {
                if !cx.socket.variant.is_connection_oriented() {
                    cx.port.established = true;
                    start_receive(&mut cx);
                }
                Ok(pid)
            }
            Err(e) => {
                tracing::warn!(target: "SOCKET", socket = %fd, port = %pid, error = %e, "configure failed");
                self.port_abort(pid);
                Err(e)
            }
        }
    }

    /// Ports of the socket that are not closing.
    pub(crate) fn live_ports(&self, fd: SocketId) -> Vec<PortId> {
        let Some(socket) = self.sockets.get(&fd) else {
            return Vec::new();
        };
        socket
            .ports
            .iter()
            .copied()
            .filter(|pid| self.ports.get(pid).is_some_and(|port| !port.is_closing()))
            .collect()
    }

    pub(crate) fn listen(&mut self, fd: SocketId, backlog: usize) -> Result<(), SocketError> {
        let socket = self.active_socket(fd)?;
        if !socket.variant.is_connection_oriented() {
            return Err(SocketError::NotSupported);
        }
        match socket.state {
            SocketState::Bound => {}
            SocketState::Listening => return Err(SocketError::AlreadyStarted),
            _ => return Err(SocketError::InvalidArgument),
        }
        let max_backlog = self.config.clamp_backlog(backlog);
        let socket = self.socket_mut(fd)?;
        socket.max_backlog = max_backlog;
        socket.accept_wait = Some(Arc::new(Notify::new()));

        let mut listening = 0;
        let mut last_error = SocketError::NoPorts;
        for pid in self.live_ports(fd) {
            let Some(mut cx) = self.port_cx(pid) else {
                continue;
            };
            let protocol = cx.socket.protocol;
            match protocol.listen(&mut cx) {
                Ok(()) => listening += 1,
                Err(e) => {
                    tracing::warn!(target: "SOCKET", socket = %fd, port = %pid, error = %e, "listen failed");
                    last_error = e;
                    self.port_abort(pid);
                }
            }
        }

        let socket = self.socket_mut(fd)?;
        if listening == 0 {
            socket.accept_wait = None;
            socket.bound = None;
            socket.bound_explicitly = false;
            socket.set_state(SocketState::Unconfigured);
            return Err(last_error);
        }
        socket.set_state(SocketState::Listening);
        Ok(())
    }

    /// Closes a transport that no port will own.
    pub(crate) fn reject(&mut self, mut transport: Box<dyn Transport>) {
        let token = self.tokens.issue_unowned();
        transport.attach(self.sink.clone());
        if let Err(e) = transport.close(token, true) {
            tracing::debug!(target: "SOCKET", error = %e, "rejected transport failed to close");
        }
    }

    pub(crate) fn accept_complete(
        &mut self,
        pid: PortId,
        token: Token,
        outcome: Result<Event, TransportError>,
    ) {
        let Some(port) = self.ports.get_mut(&pid) else {
            if let Ok(Event::Accepted { transport, .. }) = outcome {
                self.reject(transport);
            }
            return;
        };
        if port.accept_token == Some(token) {
            port.accept_token = None;
        }
        let fd = port.socket;
        let closing = port.is_closing();
        let service = port.service;
        let listening = !closing
            && self
                .sockets
                .get(&fd)
                .is_some_and(|s| s.state == SocketState::Listening && !s.closing);

        match outcome {
            Ok(Event::Accepted { transport, remote }) => {
                if !listening {
                    self.reject(transport);
                    if closing {
                        self.port_close_advance(pid);
                    }
                    return;
                }
                let full = self
                    .sockets
                    .get(&fd)
                    .is_some_and(|s| s.backlog.len() >= s.max_backlog);
                if full {
                    tracing::info!(target: "SOCKET", socket = %fd, remote = %remote, "backlog full, connection refused");
                    self.reject(transport);
                } else {
                    match self.spawn_child(fd, pid, service, transport) {
                        Ok(child) => {
                            if let Some(socket) = self.sockets.get_mut(&fd) {
                                socket.backlog.push_back(child);
                                if let Some(wait) = &socket.accept_wait {
                                    wait.notify_waiters();
                                }
                                socket.wake();
                            }
                        }
                        Err(e) => {
                            tracing::warn!(target: "SOCKET", socket = %fd, error = %e, "could not set up accepted connection")
                        }
                    }
                }
            }
            Ok(other) => {
                tracing::warn!(target: "DISPATCH", port = %pid, event = ?other, "unexpected event for an accept");
            }
            Err(e) => {
                if closing {
                    self.port_close_advance(pid);
                    return;
                }
                tracing::warn!(target: "SOCKET", socket = %fd, port = %pid, error = %e, "accept failed");
                self.port_abort(pid);
                if self.live_ports(fd).is_empty() {
                    if let Some(socket) = self.sockets.get_mut(&fd) {
                        if socket.state == SocketState::Listening {
                            socket.set_state(SocketState::NoPortsAvailable);
                        }
                        if let Some(wait) = &socket.accept_wait {
                            wait.notify_waiters();
                        }
                        socket.wake();
                    }
                }
                return;
            }
        }

        let Some(mut cx) = self.port_cx(pid) else {
            return;
        };
        let protocol = cx.socket.protocol;
        if let Err(e) = protocol.listen(&mut cx) {
            tracing::warn!(target: "SOCKET", socket = %fd, port = %pid, error = %e, "could not re-post accept");
            self.port_abort(pid);
        }
    }

    /// Wraps an accepted transport in a new socket queued on `listener`.
    fn spawn_child(
        &mut self,
        listener: SocketId,
        listen_port: PortId,
        service: ServiceId,
        transport: Box<dyn Transport>,
    ) -> Result<SocketId, SocketError> {
        let parent = self.sockets.get(&listener).ok_or(SocketError::InvalidSocket)?;
        let local = self
            .ports
            .get(&listen_port)
            .map(|port| parent.protocol.local_address(port))
            .unwrap_or_else(|| parent.variant.wildcard());
        let id = SocketId::new(self.socket_ids.next());
        let mut child = Socket::new(
            id,
            parent.variant,
            parent.protocol,
            parent.ip_protocol,
            &self.config,
        );
        child.options = parent.options;
        child.max_rx_buf = parent.max_rx_buf;
        child.max_tx_buf = parent.max_tx_buf;
        child.listener = Some(listener);
        child.release_when_closed = true;
        child.bound = Some(local);
        child.set_state(SocketState::Connecting);
        self.sockets.insert(id, child);

        let pid = match self.allocate_port(id, service, Some(transport), local) {
            Ok(pid) => pid,
            Err(e) => {
                self.sockets.remove(&id);
                return Err(e);
            }
        };
        let mut cx = self.port_cx(pid).ok_or(SocketError::InvalidArgument)?;
        cx.port.configured = true;
        cx.port.established = true;
        cx.port.connect = ConnectStatus::Connected;
        let protocol = cx.socket.protocol;
        protocol.accept(cx.port)?;
        start_receive(&mut cx);
        Ok(id)
    }

    pub(crate) fn accept(&mut self, fd: SocketId) -> Result<SocketId, SocketError> {
        let socket = self
            .sockets
            .get_mut(&fd)
            .filter(|s| !s.closing)
            .ok_or(SocketError::InvalidSocket)?;
        match socket.state {
            SocketState::Listening => {}
            SocketState::NoPortsAvailable => return Err(SocketError::NoPorts),
            _ => return Err(SocketError::InvalidArgument),
        }
        if let Some(child) = socket.backlog.pop_front() {
            let protocol = socket.protocol;
            let socket = self.socket_mut(child)?;
            socket.listener = None;
            socket.release_when_closed = false;
            if socket.ports.is_empty() {
                socket.set_state(SocketState::NoPortsAvailable);
            } else {
                socket.set_state(SocketState::Connected);
            }
            for pid in socket.ports.clone() {
                if let Some(port) = self.ports.get_mut(&pid) {
                    protocol.accept(port)?;
                }
            }
            tracing::debug!(target: "SOCKET", socket = %fd, child = %child, "accepted");
            return Ok(child);
        }
        if self.live_ports(fd).is_empty() {
            self.socket_mut(fd)?.set_state(SocketState::NoPortsAvailable);
            return Err(SocketError::NoPorts);
        }
        Err(SocketError::WouldBlock)
    }

    pub(crate) fn connect(&mut self, fd: SocketId, remote: SocketAddr) -> Result<(), SocketError> {
        let socket = self
            .sockets
            .get_mut(&fd)
            .filter(|s| !s.closing)
            .ok_or(SocketError::InvalidSocket)?;
        let variant = socket.variant;
        if !variant.accepts(&remote) {
            return Err(SocketError::InvalidArgument);
        }
        if !variant.is_connection_oriented() {
            return self.connect_datagram(fd, remote);
        }
        match socket.state {
            SocketState::Connecting => return self.poll_connect(fd),
            SocketState::Connected => {
                return socket
                    .connect_result
                    .take()
                    .unwrap_or(Err(SocketError::AlreadyConnected))
            }
            SocketState::Listening => return Err(SocketError::InvalidArgument),
            SocketState::NoPortsAvailable => return Err(SocketError::NoPorts),
            SocketState::Closed => return Err(SocketError::InvalidSocket),
            SocketState::Unconfigured | SocketState::Bound => {}
        }
        if let Some(result) = socket.connect_result.take() {
            return result;
        }
        let rebind = socket.bound.filter(|_| socket.bound_explicitly);

        if self.live_ports(fd).is_empty() {
            match rebind {
                Some(local) => self.bind_ports(fd, local)?,
                None => self.bind_wildcard(fd)?,
            }
        }
        let ports = self.live_ports(fd);
        for &pid in &ports {
            let cx = self.port_cx(pid).ok_or(SocketError::InvalidArgument)?;
            let protocol = cx.socket.protocol;
            protocol.set_remote_address(cx.port, remote)?;
            cx.port.connect = ConnectStatus::Idle;
        }
        let socket = self.socket_mut(fd)?;
        socket.connect_error = None;
        socket.set_state(SocketState::Connecting);
        self.connect_next(fd);
        self.poll_connect(fd)
    }

    /// Datagram and raw connects only set the default destination.
    fn connect_datagram(&mut self, fd: SocketId, remote: SocketAddr) -> Result<(), SocketError> {
        if self.live_ports(fd).is_empty() {
            self.bind_wildcard(fd)?;
        }
        let mut connected = 0;
        let mut last_error = SocketError::NoPorts;
        for pid in self.live_ports(fd) {
            let Some(mut cx) = self.port_cx(pid) else {
                continue;
            };
            let protocol = cx.socket.protocol;
            let result = protocol
                .set_remote_address(cx.port, remote)
                .and_then(|()| protocol.start_connect(&mut cx));
            match result {
                Ok(_) => {
                    start_receive(&mut cx);
                    connected += 1;
                }
                Err(e) => last_error = e,
            }
        }
        if connected == 0 {
            return Err(last_error);
        }
        let socket = self.socket_mut(fd)?;
        socket.set_state(SocketState::Connected);
        socket.wake();
        Ok(())
    }

    /// Starts a connect on the next untried port. Settles the race as failed
    /// when none is left.
    pub(crate) fn connect_next(&mut self, fd: SocketId) {
        loop {
            let candidate = self.live_ports(fd).into_iter().find(|pid| {
                self.ports
                    .get(pid)
                    .is_some_and(|port| port.connect == ConnectStatus::Idle)
            });
            let Some(pid) = candidate else {
                if let Some(socket) = self.sockets.get_mut(&fd) {
                    if socket.state == SocketState::Connecting {
                        let error = socket
                            .connect_error
                            .take()
                            .unwrap_or(SocketError::NoPorts);
                        socket.connect_result = Some(Err(error));
                        if socket.bound_explicitly {
                            socket.set_state(SocketState::Bound);
                        } else {
                            socket.bound = None;
                            socket.set_state(SocketState::Unconfigured);
                        }
                        socket.wake();
                    }
                }
                return;
            };
            let Some(mut cx) = self.port_cx(pid) else {
                return;
            };
            let protocol = cx.socket.protocol;
            match protocol.start_connect(&mut cx) {
                Ok(ConnectStart::Pending) => return,
                Ok(ConnectStart::Complete) => {
                    self.connect_won(fd, pid);
                    return;
                }
                Err(e) => {
                    tracing::debug!(target: "SOCKET", socket = %fd, port = %pid, error = %e, "connect attempt failed");
                    cx.port.connect = ConnectStatus::Failed(e);
                    cx.socket.connect_error = Some(e);
                    self.port_abort(pid);
                }
            }
        }
    }

    /// Keeps `winner` and closes every other port.
    fn connect_won(&mut self, fd: SocketId, winner: PortId) {
        for pid in self.live_ports(fd) {
            if pid != winner {
                self.port_abort(pid);
            }
        }
        let Some(mut cx) = self.port_cx(winner) else {
            return;
        };
        cx.port.connect = ConnectStatus::Connected;
        cx.port.established = true;
        cx.socket.connect_error = None;
        cx.socket.connect_result = Some(Ok(()));
        cx.socket.set_state(SocketState::Connected);
        start_receive(&mut cx);
        start_transmit(&mut cx, false);
        start_transmit(&mut cx, true);
        cx.socket.wake();
    }

    pub(crate) fn connect_complete(
        &mut self,
        pid: PortId,
        token: Token,
        outcome: Result<Event, TransportError>,
    ) {
        let Some(port) = self.ports.get_mut(&pid) else {
            return;
        };
        if port.connect_token != Some(token) {
            tracing::debug!(target: "DISPATCH", port = %pid, token = %token, "stale connect completion");
            return;
        }
        port.connect_token = None;
        let fd = port.socket;
        let error = match outcome {
            Ok(Event::Connected) => {
                self.connect_won(fd, pid);
                return;
            }
            Ok(other) => {
                tracing::warn!(target: "DISPATCH", port = %pid, event = ?other, "unexpected event for a connect");
                SocketError::InvalidArgument
            }
            Err(e) => SocketError::from(e),
        };
        port.connect = ConnectStatus::Failed(error);
        tracing::debug!(target: "SOCKET", socket = %fd, port = %pid, error = %error, "connect attempt failed");
        if let Some(socket) = self.sockets.get_mut(&fd) {
            socket.connect_error = Some(error);
        }
        self.port_abort(pid);
        if self
            .sockets
            .get(&fd)
            .is_some_and(|s| s.state == SocketState::Connecting)
        {
            self.connect_next(fd);
        }
    }

    pub(crate) fn poll_connect(&mut self, fd: SocketId) -> Result<(), SocketError> {
        let socket = self.sockets.get_mut(&fd).ok_or(SocketError::InvalidSocket)?;
        match socket.state {
            SocketState::Connecting => {
                let pending = socket
                    .ports
                    .iter()
                    .filter_map(|pid| self.ports.get(pid))
                    .find(|port| port.connect == ConnectStatus::Pending);
                match pending {
                    Some(port) => socket.protocol.poll_connect(port),
                    None => Err(SocketError::InProgress),
                }
            }
            SocketState::Connected => socket
                .connect_result
                .take()
                .unwrap_or(Err(SocketError::AlreadyConnected)),
            _ => socket
                .connect_result
                .take()
                .unwrap_or(Err(SocketError::NotConnected)),
        }
    }

    pub(crate) fn shutdown(&mut self, fd: SocketId, how: ShutdownHow) -> Result<(), SocketError> {
        let socket = self
            .sockets
            .get_mut(&fd)
            .filter(|s| !s.closing)
            .ok_or(SocketError::InvalidSocket)?;
        if socket.state != SocketState::Connected {
            return Err(SocketError::NotConnected);
        }
        if how.write() {
            socket.tx_disabled = true;
        }
        if how.read() {
            socket.rx_disabled = true;
        }
        socket.wake();
        if how.read() {
            self.cancel_receives(fd);
        }
        Ok(())
    }

    /// Starts closing every port of the socket. Returns `Ok` if the socket is
    /// already released and `InProgress` otherwise.
    pub(crate) fn close(&mut self, fd: SocketId, now: bool) -> Result<(), SocketError> {
        let socket = self.socket_mut(fd)?;
        if socket.closing {
            return Err(SocketError::AlreadyStarted);
        }
        socket.closing = true;
        socket.set_state(SocketState::Closed);
        let backlog: Vec<_> = socket.backlog.drain(..).collect();
        if let Some(wait) = socket.accept_wait.take() {
            wait.notify_waiters();
        }
        if now {
            let protocol = socket.protocol;
            for packet in socket.tx.drain() {
                protocol.free_packet(socket, packet, Accounting::Tx);
            }
            for packet in socket.tx_urgent.drain() {
                protocol.free_packet(socket, packet, Accounting::TxUrgent);
            }
        }
        let ports = socket.ports.clone();
        socket.wake();
        tracing::debug!(target: "SOCKET", socket = %fd, now, "close started");

        for child in backlog {
            if let Some(socket) = self.sockets.get_mut(&child) {
                socket.listener = None;
                socket.release_when_closed = true;
            }
            let _ = self.close(child, true);
        }
        for pid in ports {
            match self.port_close_start(pid, now) {
                Ok(_) | Err(SocketError::AlreadyStarted) => {}
                Err(e) => tracing::warn!(target: "PORT", port = %pid, error = %e, "could not start close"),
            }
        }
        self.close_poll(fd)
    }

    /// Releases a closing socket whose ports are all gone.
    pub(crate) fn close_poll(&mut self, fd: SocketId) -> Result<(), SocketError> {
        let socket = self.sockets.get(&fd).ok_or(SocketError::InvalidSocket)?;
        if !socket.closing {
            return Err(SocketError::InvalidArgument);
        }
        if !socket.ports.is_empty() {
            return Err(SocketError::InProgress);
        }
        self.release_socket(fd);
        Ok(())
    }

    /// The last port of a closing socket was released.
    pub(crate) fn finish_socket_close(&mut self, fd: SocketId) {
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        socket.wake();
        if socket.release_when_closed {
            self.release_socket(fd);
        }
    }

    fn release_socket(&mut self, fd: SocketId) {
        let Some(mut socket) = self.sockets.remove(&fd) else {
            return;
        };
        let protocol = socket.protocol;
        for packet in socket.rx.drain() {
            protocol.free_packet(&mut socket, packet, Accounting::Rx);
        }
        for packet in socket.rx_urgent.drain() {
            protocol.free_packet(&mut socket, packet, Accounting::Rx);
        }
        if let Some(listener) = socket.listener {
            if let Some(parent) = self.sockets.get_mut(&listener) {
                parent.backlog.retain(|child| *child != fd);
            }
        }
        socket.wake();
        tracing::debug!(target: "SOCKET", socket = %fd, "released");
    }

    pub(crate) fn local_address(&self, fd: SocketId) -> Result<SocketAddr, SocketError> {
        let socket = self.sockets.get(&fd).ok_or(SocketError::InvalidSocket)?;
        let port = self
            .live_ports(fd)
            .first()
            .and_then(|pid| self.ports.get(pid));
        Ok(match port {
            Some(port) => socket.protocol.local_address(port),
            None => socket.bound.unwrap_or_else(|| socket.variant.wildcard()),
        })
    }

    pub(crate) fn remote_address(&self, fd: SocketId) -> Result<SocketAddr, SocketError> {
        let socket = self.sockets.get(&fd).ok_or(SocketError::InvalidSocket)?;
        if socket.state != SocketState::Connected {
            return Err(SocketError::NotConnected);
        }
        self.live_ports(fd)
            .iter()
            .filter_map(|pid| self.ports.get(pid))
            .find(|port| port.established)
            .and_then(|port| socket.protocol.remote_address(port))
            .ok_or(SocketError::NotConnected)
    }

    pub(crate) fn poll(&self, fd: SocketId, interest: PollEvents) -> PollEvents {
        match self.sockets.get(&fd) {
            Some(socket) => socket.readiness(interest),
            None => PollEvents::INVALID,
        }
    }

    pub(crate) fn stats(&self, fd: SocketId) -> Result<SocketStats, SocketError> {
        let socket = self.sockets.get(&fd).ok_or(SocketError::InvalidSocket)?;
        let ports = socket
            .ports
            .iter()
            .filter_map(|pid| self.ports.get(pid))
            .map(|port| port.state)
            .collect();
        Ok(socket.stats(ports))
    }
}
