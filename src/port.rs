//! Ports and their close sequence.
//!
//! A port binds one socket to one service. It owns the transport instance and
//! the IO slots of operations in flight on it. Closing a port runs four forward
//! steps, each of which may have to wait for the transport:
//!
//! 1. `CloseStarted`: record whether the close is immediate.
//! 2. `CloseTransmitDone`: once transmits drained (or the close is immediate,
//!    or a transmit error is latched), ask the transport to close.
//! 3. `CloseDone`: the transport confirmed. Cancel any outstanding receive.
//! 4. `CloseReceiveDone`: nothing is in flight. Release the port.

use crate::{
    config::Config,
    id::{PortId, ServiceId, SocketId, Token},
    io::{IoQueue, Operation, TokenTable},
    layer::LayerState,
    logging::port_state_event,
    protocol::{Accounting, CloseOp},
    socket::{Socket, SocketState},
    transport::{Transport, TransportConfig},
    SocketError,
};
use std::net::SocketAddr;

/// Where a port is in its life. Once `CloseStarted` is reached the state
/// only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PortState {
    Allocated,
    Open,
    /// A receive failed; the port no longer receives.
    ReceiveError,
    CloseStarted,
    CloseTransmitDone,
    CloseDone,
    CloseReceiveDone,
}

/// Progress of one port's connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectStatus {
    Idle,
    Pending,
    Connected,
    Failed(SocketError),
}

/// Whether a close step finished the sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseProgress {
    Pending,
    Done,
}

pub(crate) struct Port {
    pub id: PortId,
    pub socket: SocketId,
    pub service: ServiceId,
    pub state: PortState,
    pub transport: Box<dyn Transport>,
    pub config: TransportConfig,
    pub configured: bool,
    /// Data may flow: a stream port is connected or accepted, a datagram port
    /// is configured.
    pub established: bool,
    pub listening: bool,
    pub connect: ConnectStatus,
    pub connect_token: Option<Token>,
    pub accept_token: Option<Token>,
    pub close_now: bool,
    pub close_token: Option<Token>,
    pub rx_cancelled: bool,
    pub rx: IoQueue,
    pub tx: IoQueue,
    pub tx_urgent: IoQueue,
}

impl Port {
    pub fn new(
        id: PortId,
        socket: SocketId,
        service: ServiceId,
        transport: Box<dyn Transport>,
        config: TransportConfig,
    ) -> Self {
        Self {
            id,
            socket,
            service,
            state: PortState::Allocated,
            transport,
            config,
            configured: false,
            established: false,
            listening: false,
            connect: ConnectStatus::Idle,
            connect_token: None,
            accept_token: None,
            close_now: false,
            close_token: None,
            rx_cancelled: false,
            rx: IoQueue::new(1),
            tx: IoQueue::new(1),
            tx_urgent: IoQueue::new(1),
        }
    }

    pub fn set_state(&mut self, to: PortState) {
        debug_assert!(
            self.state < PortState::CloseStarted || to > self.state,
            "port close state may only move forward"
        );
        port_state_event(self.id, self.socket, self.state, to);
        self.state = to;
    }

    pub fn is_closing(&self) -> bool {
        self.state >= PortState::CloseStarted
    }

    /// Pushes the current configuration to the transport.
    pub fn configure(&mut self) -> Result<(), SocketError> {
        self.transport.configure(Some(&self.config))?;
        self.configured = true;
        Ok(())
    }

    pub fn tx_queue(&mut self, urgent: bool) -> &mut IoQueue {
        if urgent {
            &mut self.tx_urgent
        } else {
            &mut self.tx
        }
    }

    pub fn tx_idle(&self) -> bool {
        self.tx.is_idle() && self.tx_urgent.is_idle()
    }
}

/// A port borrowed together with its socket.
pub(crate) struct PortCx<'a> {
    pub port: &'a mut Port,
    pub socket: &'a mut Socket,
    pub tokens: &'a mut TokenTable,
    pub config: &'a Config,
}

/// The configuration a new port of `socket` starts from.
pub(crate) fn base_config(socket: &Socket, local: SocketAddr) -> TransportConfig {
    TransportConfig {
        local,
        remote: None,
        passive: false,
        protocol: socket.ip_protocol,
        time_to_live: socket.options.protocol.time_to_live,
        type_of_service: socket.options.protocol.type_of_service,
        no_delay: false,
        header_included: false,
        receive_timeout: socket.options.receive_timeout,
        send_timeout: socket.options.send_timeout,
    }
}

impl LayerState {
    /// Creates a port for `socket` on `service`. A transport is created from
    /// the service unless one is supplied, as for accepted connections.
    pub(crate) fn allocate_port(
        &mut self,
        fd: SocketId,
        service: ServiceId,
        transport: Option<Box<dyn Transport>>,
        local: SocketAddr,
    ) -> Result<PortId, SocketError> {
        let socket = self.sockets.get(&fd).ok_or(SocketError::InvalidSocket)?;
        let mut transport = match transport {
            Some(transport) => transport,
            None => self.services.create_transport(service)?,
        };
        transport.attach(self.sink.clone());

        let id = PortId::new(self.port_ids.next());
        let mut port = Port::new(id, fd, service, transport, base_config(socket, local));
        let protocol = socket.protocol;
        protocol.allocate_port(&mut port, socket)?;
        protocol.set_local_address(&mut port, local)?;
        port.set_state(PortState::Open);

        self.services.attach(service, id);
        self.ports.insert(id, port);
        if let Some(socket) = self.sockets.get_mut(&fd) {
            socket.ports.push(id);
        }
        Ok(id)
    }

    /// Enters `CloseStarted` and drives the sequence as far as it can go
    /// without waiting.
    pub(crate) fn port_close_start(
        &mut self,
        pid: PortId,
        now: bool,
    ) -> Result<CloseProgress, SocketError> {
        let port = self
            .ports
            .get_mut(&pid)
            .ok_or(SocketError::InvalidArgument)?;
        if port.is_closing() {
            return Err(SocketError::AlreadyStarted);
        }
        port.close_now = now;
        port.set_state(PortState::CloseStarted);
        for token in [port.accept_token.take(), port.connect_token.take()]
            .into_iter()
            .flatten()
        {
            // The aborted completion still arrives and is dropped as closing.
            let _ = port.transport.cancel(token);
        }
        self.port_close_tx_done(pid)
    }

    pub(crate) fn port_close_tx_done(&mut self, pid: PortId) -> Result<CloseProgress, SocketError> {
        let mut cx = self.port_cx(pid).ok_or(SocketError::InvalidArgument)?;
        match cx.port.state {
            PortState::CloseStarted => {}
            state if state > PortState::CloseStarted => return Err(SocketError::AlreadyStarted),
            _ => return Err(SocketError::InvalidArgument),
        }
        let socket_drained = cx.socket.tx.is_empty() && cx.socket.tx_urgent.is_empty();
        let drained = cx.port.tx_idle() && (socket_drained || !cx.port.established);
        if !(cx.port.close_now || cx.socket.tx_error.is_some() || drained) {
            return Ok(CloseProgress::Pending);
        }
        cx.port.set_state(PortState::CloseTransmitDone);

        let protocol = cx.socket.protocol;
        if protocol.is_configured(cx.port) {
            let token = cx.tokens.issue(pid, Operation::Close);
            match protocol.close_port_op(&mut cx, token) {
                Ok(CloseOp::Pending) => {
                    cx.port.close_token = Some(token);
                    return Ok(CloseProgress::Pending);
                }
                Ok(CloseOp::Complete) => {
                    cx.tokens.retire(token);
                }
                Err(e) => {
                    cx.tokens.retire(token);
                    tracing::warn!(target: "PORT", port = %pid, error = %e, "transport close failed");
                }
            }
        }
        self.port_close_complete(pid)
    }

    /// The transport finished closing, or never had to.
    pub(crate) fn port_close_complete(&mut self, pid: PortId) -> Result<CloseProgress, SocketError> {
        let port = self
            .ports
            .get_mut(&pid)
            .ok_or(SocketError::InvalidArgument)?;
        match port.state {
            PortState::CloseTransmitDone => {}
            state if state > PortState::CloseTransmitDone => {
                return Err(SocketError::AlreadyStarted)
            }
            _ => return Err(SocketError::InvalidArgument),
        }
        port.close_token = None;
        port.configured = false;
        port.established = false;
        port.listening = false;
        port.set_state(PortState::CloseDone);
        self.port_close_done(pid)
    }

    pub(crate) fn port_close_done(&mut self, pid: PortId) -> Result<CloseProgress, SocketError> {
        let port = self
            .ports
            .get_mut(&pid)
            .ok_or(SocketError::InvalidArgument)?;
        match port.state {
            PortState::CloseDone => {}
            state if state > PortState::CloseDone => return Err(SocketError::AlreadyStarted),
            _ => return Err(SocketError::InvalidArgument),
        }
        if !port.rx.is_idle() {
            if !port.rx_cancelled {
                port.rx_cancelled = true;
                for token in port.rx.tokens() {
                    let _ = port.transport.cancel(token);
                }
            }
            return Ok(CloseProgress::Pending);
        }
        if !port.tx_idle() {
            return Ok(CloseProgress::Pending);
        }
        self.port_close_rx_done(pid)
    }

    pub(crate) fn port_close_rx_done(&mut self, pid: PortId) -> Result<CloseProgress, SocketError> {
        let port = self
            .ports
            .get_mut(&pid)
            .ok_or(SocketError::InvalidArgument)?;
        if port.state != PortState::CloseDone {
            return Err(SocketError::AlreadyStarted);
        }
        port.set_state(PortState::CloseReceiveDone);
        self.release_port(pid);
        Ok(CloseProgress::Done)
    }

    /// Re-evaluates a closing port after one of its operations completed.
    pub(crate) fn port_close_advance(&mut self, pid: PortId) {
        let Some(port) = self.ports.get(&pid) else {
            return;
        };
        let result = match port.state {
            PortState::CloseStarted => self.port_close_tx_done(pid),
            PortState::CloseDone => self.port_close_done(pid),
            _ => return,
        };
        if let Err(e) = result {
            tracing::warn!(target: "PORT", port = %pid, error = %e, "close sequence stalled");
        }
    }

    /// Starts an immediate close, ignoring a close already under way.
    pub(crate) fn port_abort(&mut self, pid: PortId) {
        match self.port_close_start(pid, true) {
            Ok(_) | Err(SocketError::AlreadyStarted) => {}
            Err(e) => tracing::warn!(target: "PORT", port = %pid, error = %e, "could not close port"),
        }
    }

    /// Detaches a fully closed port from its socket and service and frees it.
    fn release_port(&mut self, pid: PortId) {
        let Some(mut port) = self.ports.remove(&pid) else {
            return;
        };
        self.tokens.retire_port(pid);
        self.services.detach(port.service, pid);

        let fd = port.socket;
        let Some(socket) = self.sockets.get_mut(&fd) else {
            return;
        };
        let protocol = socket.protocol;
        protocol.close_port(&mut port);
        for mut packet in port.rx.take_all() {
            packet.recycle();
            socket.recycle_rx(packet);
        }
        for packet in port.tx.take_all() {
            protocol.free_packet(socket, packet, Accounting::Tx);
        }
        for packet in port.tx_urgent.take_all() {
            protocol.free_packet(socket, packet, Accounting::TxUrgent);
        }
        socket.ports.retain(|p| *p != pid);
        tracing::debug!(target: "PORT", port = %pid, socket = %fd, "released");

        if socket.ports.is_empty() {
            if socket.closing {
                self.finish_socket_close(fd);
                return;
            }
            // A bound socket whose connect failed keeps its address for the
            // next attempt.
            let connect_failed = matches!(port.connect, ConnectStatus::Failed(_));
            let orphaned = match socket.state {
                SocketState::Bound => !connect_failed,
                SocketState::Listening | SocketState::Connected => true,
                _ => false,
            };
            if orphaned {
                socket.set_state(SocketState::NoPortsAvailable);
            }
        }
        socket.wake();
    }
}
