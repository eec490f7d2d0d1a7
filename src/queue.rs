//! The receive and transmit queue engine.
//!
//! Receive: each open port keeps at most one receive posted. A completed
//! receive is queued on the socket (urgent or normal) and the next receive is
//! posted only while the socket buffers less than its receive watermark.
//! Datagrams that complete once the watermark is reached are dropped.
//! Consuming data below the watermark posts receives again.
//!
//! Transmit: `send` queues a packet on the socket and starts it on the
//! transmitting port if that port has no transmit in flight. Each transmit
//! completion starts the next queued packet.

use crate::{
    error::TransportError,
    flags::MessageFlags,
    id::{PortId, SocketId, Token},
    io::Operation,
    layer::LayerState,
    packet::{Packet, PacketState},
    port::{PortCx, PortState},
    protocol::Accounting,
    socket::{Socket, SocketState},
    transport::Event,
    SocketError,
};
use std::net::SocketAddr;

/// Data returned by `receive`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceivedData {
    pub data: Vec<u8>,
    /// The sender, for datagram and raw sockets.
    pub remote: Option<SocketAddr>,
}

/// Copies up to `len` bytes across packet boundaries. Partially read packets
/// keep their remainder at the head of the queue.
pub(crate) fn receive_stream(
    socket: &mut Socket,
    flags: MessageFlags,
    len: usize,
) -> Option<ReceivedData> {
    let queue = if flags.contains(MessageFlags::URGENT) {
        &mut socket.rx_urgent
    } else {
        &mut socket.rx
    };
    if queue.is_empty() {
        return None;
    }
    let mut data = Vec::with_capacity(len.min(queue.bytes()));
    if flags.contains(MessageFlags::PEEK) {
        for packet in queue.iter() {
            let want = len - data.len();
            if want == 0 {
                break;
            }
            let chunk = packet.data();
            data.extend_from_slice(&chunk[..want.min(chunk.len())]);
        }
        return Some(ReceivedData { data, remote: None });
    }

    let mut emptied = Vec::new();
    while data.len() < len {
        let Some(head) = queue.front() else {
            break;
        };
        let take = (len - data.len()).min(head.valid_bytes());
        data.extend_from_slice(&head.data()[..take]);
        let (_, empty) = queue.consume_front(take);
        if empty {
            emptied.extend(queue.get());
        }
    }
    for mut packet in emptied {
        packet.recycle();
        socket.recycle_rx(packet);
    }
    Some(ReceivedData { data, remote: None })
}

/// Returns one whole datagram, truncated to `len`. The unread remainder is
/// discarded.
pub(crate) fn receive_datagram(
    socket: &mut Socket,
    flags: MessageFlags,
    len: usize,
) -> Option<ReceivedData> {
    if flags.contains(MessageFlags::PEEK) {
        let packet = socket.rx.front()?;
        let take = len.min(packet.valid_bytes());
        return Some(ReceivedData {
            data: packet.data()[..take].to_vec(),
            remote: packet.rx_meta().and_then(|meta| meta.remote()),
        });
    }

    let mut packet = socket.rx.get()?;
    let take = len.min(packet.valid_bytes());
    let received = ReceivedData {
        data: packet.data()[..take].to_vec(),
        remote: packet.rx_meta().and_then(|meta| meta.remote()),
    };
    packet.consume(take);
    let skipped = packet.valid_bytes();
    if skipped > 0 {
        tracing::trace!(target: "SOCKET", socket = %socket.id, skipped, "datagram truncated");
    }
    let protocol = socket.protocol;
    protocol.free_packet(socket, packet, Accounting::Rx);
    Some(received)
}

/// Posts a receive on the port unless one is pending, the port cannot
/// receive, or the socket is at its receive watermark.
pub(crate) fn start_receive(cx: &mut PortCx<'_>) {
    let PortCx {
        port,
        socket,
        tokens,
        config,
    } = cx;
    if port.state != PortState::Open
        || !port.established
        || !socket.protocol.is_configured(port)
        || socket.rx_disabled
        || socket.rx_eof
        || socket.rx.bytes() >= socket.max_rx_buf
        || !port.rx.has_free_slot()
    {
        return;
    }
    let packet = socket
        .rx_pool
        .pop()
        .unwrap_or_else(|| Packet::with_capacity(config.rx_packet_size));
    let token = tokens.issue(port.id, Operation::Receive);
    match socket
        .protocol
        .start_receive(port, token, config.rx_packet_size)
    {
        Ok(()) => {
            if let Err(packet) = port.rx.start(token, packet) {
                socket.recycle_rx(packet);
            }
        }
        Err(e) => {
            tokens.retire(token);
            socket.recycle_rx(packet);
            socket.latch_rx_error(e.into());
            port.set_state(PortState::ReceiveError);
        }
    }
}

/// Starts the head of the socket's normal or urgent transmit queue on this
/// port if nothing is in flight there.
pub(crate) fn start_transmit(cx: &mut PortCx<'_>, urgent: bool) {
    let PortCx {
        port,
        socket,
        tokens,
        ..
    } = cx;
    let may_send = match port.state {
        PortState::Open | PortState::ReceiveError => true,
        PortState::CloseStarted => !port.close_now,
        _ => false,
    };
    if !may_send || !port.established || socket.tx_error.is_some() {
        return;
    }
    if !port.tx_queue(urgent).is_idle() {
        return;
    }
    let queue = if urgent {
        &mut socket.tx_urgent
    } else {
        &mut socket.tx
    };
    let Some(packet) = queue.get() else {
        return;
    };
    let (op, accounting) = if urgent {
        (Operation::TransmitUrgent, Accounting::TxUrgent)
    } else {
        (Operation::Transmit, Accounting::Tx)
    };
    let protocol = socket.protocol;
    let Some(meta) = packet.tx_meta() else {
        protocol.free_packet(socket, packet, accounting);
        return;
    };
    let token = tokens.issue(port.id, op);
    match port.transport.transmit(token, packet.data(), &meta) {
        Ok(()) => {
            if let Err(packet) = port.tx_queue(urgent).start(token, packet) {
                queue.put_front(packet);
            }
        }
        Err(e) => {
            tokens.retire(token);
            protocol.free_packet(socket, packet, accounting);
            socket.latch_tx_error(e.into());
        }
    }
}

impl LayerState {
    pub(crate) fn receive_complete(
        &mut self,
        pid: PortId,
        token: Token,
        outcome: Result<Event, TransportError>,
    ) {
        let Some(mut cx) = self.port_cx(pid) else {
            return;
        };
        let Some(mut packet) = cx.port.rx.complete(token) else {
            tracing::debug!(target: "DISPATCH", port = %pid, token = %token, "no receive slot for token");
            return;
        };
        let closing = cx.port.is_closing();
        let protocol = cx.socket.protocol;
        let outcome = match outcome {
            Ok(Event::Received(inbound)) => protocol
                .on_receive_complete(cx.port, &inbound)
                .map(|meta| (inbound, meta)),
            Ok(other) => {
                tracing::warn!(target: "DISPATCH", port = %pid, event = ?other, "unexpected event for a receive");
                Err(TransportError::InvalidParameter)
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((inbound, meta)) if !closing && !cx.socket.rx_disabled => {
                let stream = protocol.variant().is_connection_oriented();
                if inbound.data.is_empty() && stream {
                    packet.recycle();
                    cx.socket.recycle_rx(packet);
                } else if !stream && cx.socket.rx.bytes() >= cx.socket.max_rx_buf {
                    // Receives posted on other ports may land after the
                    // watermark was reached.
                    packet.fill(&inbound.data, meta);
                    tracing::trace!(target: "SOCKET", socket = %cx.socket.id, bytes = inbound.data.len(), "datagram dropped at receive watermark");
                    protocol.free_packet(cx.socket, packet, Accounting::Rx);
                } else {
                    packet.fill(&inbound.data, meta);
                    let urgent = meta.is_urgent() && protocol.supports_urgent();
                    packet.transition(PacketState::Queued);
                    if urgent {
                        cx.socket.rx_urgent.put(packet);
                    } else {
                        cx.socket.rx.put(packet);
                    }
                    cx.socket.wake();
                }
                start_receive(&mut cx);
            }
            Ok(_) => {
                packet.recycle();
                cx.socket.recycle_rx(packet);
            }
            Err(TransportError::EndOfStream) => {
                packet.recycle();
                cx.socket.recycle_rx(packet);
                cx.socket.rx_eof = true;
                if !closing {
                    cx.port.set_state(PortState::ReceiveError);
                }
                cx.socket.wake();
            }
            Err(e) => {
                packet.recycle();
                cx.socket.recycle_rx(packet);
                let cancelled = e == TransportError::Aborted
                    && (cx.socket.rx_disabled || cx.port.rx_cancelled);
                if !closing && !cancelled {
                    cx.socket.latch_rx_error(e.into());
                    cx.port.set_state(PortState::ReceiveError);
                }
                cx.socket.wake();
            }
        }
        if closing {
            self.port_close_advance(pid);
        }
    }

    pub(crate) fn transmit_complete(
        &mut self,
        pid: PortId,
        token: Token,
        urgent: bool,
        outcome: Result<Event, TransportError>,
    ) {
        let Some(mut cx) = self.port_cx(pid) else {
            return;
        };
        let Some(mut packet) = cx.port.tx_queue(urgent).complete(token) else {
            tracing::debug!(target: "DISPATCH", port = %pid, token = %token, "no transmit slot for token");
            return;
        };
        packet.transition(PacketState::Free);
        let protocol = cx.socket.protocol;
        if urgent {
            protocol.on_urgent_transmit_complete(cx.socket, packet);
        } else {
            protocol.on_transmit_complete(cx.socket, packet);
        }
        let closing = cx.port.is_closing();
        match outcome {
            Ok(Event::Transmitted) => {}
            Ok(other) => {
                tracing::warn!(target: "DISPATCH", port = %pid, event = ?other, "unexpected event for a transmit");
                cx.socket.latch_tx_error(SocketError::InvalidArgument);
            }
            Err(TransportError::Aborted) if closing => {}
            Err(e) => cx.socket.latch_tx_error(e.into()),
        }
        cx.socket.wake();
        start_transmit(&mut cx, urgent);
        let settled = (cx.socket.tx.is_empty() && cx.socket.tx_urgent.is_empty())
            || cx.socket.tx_error.is_some();
        let ports = cx.socket.ports.clone();
        if closing {
            self.port_close_advance(pid);
        }
        // Ports that never transmitted wait in CloseStarted for the socket
        // queues to drain.
        if settled {
            for other in ports.into_iter().filter(|other| *other != pid) {
                self.port_close_advance(other);
            }
        }
    }

    /// The port that carries a socket's transmit queues.
    pub(crate) fn transmit_port(&self, fd: SocketId) -> Option<PortId> {
        let socket = self.sockets.get(&fd)?;
        socket.ports.iter().copied().find(|pid| {
            self.ports.get(pid).is_some_and(|port| {
                port.established
                    && (port.state < PortState::CloseStarted
                        || (port.state == PortState::CloseStarted && !port.close_now))
            })
        })
    }

    pub(crate) fn restart_receives(&mut self, fd: SocketId) {
        let ports = match self.sockets.get(&fd) {
            Some(socket) => socket.ports.clone(),
            None => return,
        };
        for pid in ports {
            if let Some(mut cx) = self.port_cx(pid) {
                start_receive(&mut cx);
            }
        }
    }

    pub(crate) fn cancel_receives(&mut self, fd: SocketId) {
        let ports = match self.sockets.get(&fd) {
            Some(socket) => socket.ports.clone(),
            None => return,
        };
        for pid in ports {
            if let Some(port) = self.ports.get_mut(&pid) {
                for token in port.rx.tokens() {
                    let _ = port.transport.cancel(token);
                }
            }
        }
    }

    pub(crate) fn send(
        &mut self,
        fd: SocketId,
        data: &[u8],
        flags: MessageFlags,
        to: Option<SocketAddr>,
    ) -> Result<usize, SocketError> {
        let socket = self.sockets.get_mut(&fd).ok_or(SocketError::InvalidSocket)?;
        if socket.closing {
            return Err(SocketError::NotConnected);
        }
        if let Some(error) = socket.tx_error.take() {
            return Err(error);
        }
        if socket.tx_disabled || socket.state == SocketState::Listening {
            return Err(SocketError::NotConnected);
        }
        let urgent = flags.contains(MessageFlags::URGENT);
        let protocol = socket.protocol;
        if urgent && !protocol.supports_urgent() {
            return Err(SocketError::NotSupported);
        }

        let variant = socket.variant;
        if variant.is_connection_oriented() {
            if socket.state != SocketState::Connected {
                return Err(SocketError::NotConnected);
            }
            if to.is_some() {
                return Err(SocketError::AlreadyConnected);
            }
        } else {
            if data.len() > self.config.max_datagram_size {
                return Err(SocketError::InvalidArgument);
            }
            if to.is_none() && socket.state != SocketState::Connected {
                return Err(SocketError::NotConnected);
            }
            if let Some(to) = to {
                if !variant.accepts(&to) {
                    return Err(SocketError::InvalidArgument);
                }
            }
            if socket.ports.is_empty() {
                self.bind_wildcard(fd)?;
            }
        }

        let socket = self.sockets.get_mut(&fd).ok_or(SocketError::InvalidSocket)?;
        let queued = if urgent {
            socket.tx_urgent_bytes
        } else {
            socket.tx_bytes
        };
        if queued >= socket.max_tx_buf {
            return Err(SocketError::WouldBlock);
        }
        if data.is_empty() && variant.is_connection_oriented() {
            return Ok(0);
        }
        let packet = protocol.transmit(socket, data, urgent, to)?;
        if urgent {
            socket.tx_urgent_bytes += data.len();
            socket.tx_urgent.put(packet);
        } else {
            socket.tx_bytes += data.len();
            socket.tx.put(packet);
        }

        if let Some(pid) = self.transmit_port(fd) {
            if let Some(mut cx) = self.port_cx(pid) {
                start_transmit(&mut cx, urgent);
            }
        }
        Ok(data.len())
    }

    pub(crate) fn receive(
        &mut self,
        fd: SocketId,
        flags: MessageFlags,
        len: usize,
    ) -> Result<ReceivedData, SocketError> {
        let socket = self.sockets.get_mut(&fd).ok_or(SocketError::InvalidSocket)?;
        if socket.closing || socket.state == SocketState::Listening {
            return Err(SocketError::NotConnected);
        }
        let protocol = socket.protocol;
        if flags.contains(MessageFlags::URGENT) && !protocol.supports_urgent() {
            return Err(SocketError::NotSupported);
        }
        let variant = socket.variant;
        // An empty stream read would be indistinguishable from end of stream.
        if len == 0 && variant.is_connection_oriented() {
            return Err(SocketError::InvalidArgument);
        }
        if !variant.is_connection_oriented() && socket.ports.is_empty() {
            self.bind_wildcard(fd)?;
        }

        let socket = self.sockets.get_mut(&fd).ok_or(SocketError::InvalidSocket)?;
        let peek = flags.contains(MessageFlags::PEEK);
        if let Some(received) = protocol.receive(socket, flags, len)? {
            if !peek && socket.rx.bytes() < socket.max_rx_buf {
                self.restart_receives(fd);
            }
            return Ok(received);
        }

        let latched = if peek {
            socket.rx_error
        } else {
            socket.rx_error.take()
        };
        if let Some(error) = latched {
            return Err(error);
        }
        if socket.rx_eof || socket.rx_disabled {
            return Ok(ReceivedData::default());
        }
        if variant.is_connection_oriented() && socket.state != SocketState::Connected {
            return Err(SocketError::NotConnected);
        }
        Err(SocketError::WouldBlock)
    }
}
