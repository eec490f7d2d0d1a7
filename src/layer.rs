//! The socket layer.
//!
//! All sockets, ports and services live behind one lock. Transports never
//! call back into the layer; they queue completions in a [`CompletionSink`]
//! and [`SocketLayer::dispatch`] routes them to their ports by token. That
//! keeps every state change inside the same critical section as the API call
//! or dispatch that caused it.

use crate::{
    address::{ProtocolFamily, SocketType, Variant},
    config::Config,
    error::TransportError,
    flags::{MessageFlags, PollEvents},
    id::{IdCounter, PortId, ServiceId, SocketId, Token},
    io::{Operation, TokenTable},
    logging::dropped_completion_event,
    options::{OptionValue, SocketOption},
    port::{Port, PortCx},
    queue::ReceivedData,
    service::{ServiceInfo, ServiceRegistry},
    shutdown::Shutdown,
    socket::{ShutdownHow, Socket, SocketStats},
    transport::{Completion, CompletionSink, Event, TransportFactory},
    SocketError,
};
use rustc_hash::FxHashMap;
use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    task::Poll,
    time::Duration,
};
use tokio::{
    sync::Notify,
    time::{interval, timeout, MissedTickBehavior},
};

pub(crate) struct LayerState {
    pub config: Config,
    pub sink: CompletionSink,
    pub sockets: FxHashMap<SocketId, Socket>,
    pub ports: FxHashMap<PortId, Port>,
    pub services: ServiceRegistry,
    pub tokens: TokenTable,
    pub socket_ids: IdCounter,
    pub port_ids: IdCounter,
}

impl LayerState {
    fn new(config: Config, sink: CompletionSink) -> Self {
        Self {
            config,
            sink,
            sockets: FxHashMap::default(),
            ports: FxHashMap::default(),
            services: ServiceRegistry::default(),
            tokens: TokenTable::default(),
            socket_ids: IdCounter::default(),
            port_ids: IdCounter::default(),
        }
    }

    pub(crate) fn socket_mut(&mut self, fd: SocketId) -> Result<&mut Socket, SocketError> {
        self.sockets.get_mut(&fd).ok_or(SocketError::InvalidSocket)
    }

    /// Borrows a port together with its socket.
    pub(crate) fn port_cx(&mut self, pid: PortId) -> Option<PortCx<'_>> {
        let port = self.ports.get_mut(&pid)?;
        let socket = self.sockets.get_mut(&port.socket)?;
        Some(PortCx {
            port,
            socket,
            tokens: &mut self.tokens,
            config: &self.config,
        })
    }

    fn complete(&mut self, completion: Completion) {
        let Completion { token, outcome } = completion;
        let Some((pid, operation)) = self.tokens.retire(token) else {
            dropped_completion_event(token, "unknown token");
            if let Ok(Event::Accepted { transport, .. }) = outcome {
                self.reject(transport);
            }
            return;
        };
        match operation {
            Operation::Connect => self.connect_complete(pid, token, outcome),
            Operation::Accept => self.accept_complete(pid, token, outcome),
            Operation::Receive => self.receive_complete(pid, token, outcome),
            Operation::Transmit => self.transmit_complete(pid, token, false, outcome),
            Operation::TransmitUrgent => self.transmit_complete(pid, token, true, outcome),
            Operation::Close => self.close_complete(pid, token, outcome),
        }
    }

    fn close_complete(&mut self, pid: PortId, token: Token, outcome: Result<Event, TransportError>) {
        let Some(port) = self.ports.get(&pid) else {
            return;
        };
        if port.close_token != Some(token) {
            dropped_completion_event(token, "stale close");
            return;
        }
        if let Err(e) = outcome {
            tracing::debug!(target: "PORT", port = %pid, error = %e, "transport closed with an error");
        }
        if let Err(e) = self.port_close_complete(pid) {
            tracing::warn!(target: "PORT", port = %pid, error = %e, "close completion out of order");
        }
    }

    fn poll_transports(&mut self) {
        for port in self.ports.values_mut() {
            if let Err(e) = port.transport.poll() {
                tracing::debug!(target: "PORT", port = %port.id, error = %e, "transport poll failed");
            }
        }
    }

    /// Closes every socket immediately. Sockets are released as soon as
    /// their ports are.
    fn shut_down(&mut self) {
        let mut fds: Vec<_> = self.sockets.keys().copied().collect();
        fds.sort();
        for fd in fds {
            let closing = match self.sockets.get_mut(&fd) {
                Some(socket) => {
                    socket.release_when_closed = true;
                    socket.closing
                }
                None => continue,
            };
            let result = if closing {
                self.close_poll(fd)
            } else {
                self.close(fd, true)
            };
            match result {
                Ok(()) => {}
                Err(e) if e.is_pending() => {}
                Err(e) => {
                    tracing::warn!(target: "SOCKET", socket = %fd, error = %e, "close at shutdown failed")
                }
            }
        }
    }
}

/// A BSD-style socket layer over a set of registered transport services.
///
/// Every call returns without waiting. Operations that cannot finish yet
/// report [`SocketError::WouldBlock`] or [`SocketError::InProgress`], and the
/// `*_wait` methods wrap them in futures.
pub struct SocketLayer {
    state: Mutex<LayerState>,
    sink: CompletionSink,
}

impl SocketLayer {
    pub fn new(config: Config) -> Self {
        let sink = CompletionSink::new();
        Self {
            state: Mutex::new(LayerState::new(config, sink.clone())),
            sink,
        }
    }

    pub fn new_shared(config: Config) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    fn lock(&self) -> MutexGuard<'_, LayerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> Config {
        self.lock().config.clone()
    }

    /// Makes a transport factory available to sockets of `variant` bound to
    /// `address` or to the unspecified address.
    pub fn register_service(
        &self,
        name: impl Into<String>,
        address: IpAddr,
        variant: Variant,
        factory: impl TransportFactory + 'static,
    ) -> ServiceId {
        self.lock()
            .services
            .register(name, address, variant, Box::new(factory))
    }

    /// Removes a service. Its ports are closed immediately and the service
    /// disappears once they are released.
    pub fn unregister_service(&self, id: ServiceId) -> Result<(), SocketError> {
        self.lock().unregister_service(id)
    }

    pub fn services(&self) -> Vec<ServiceInfo> {
        self.lock().services.info()
    }

    pub fn open(
        &self,
        family: ProtocolFamily,
        socket_type: SocketType,
        protocol: u8,
    ) -> Result<SocketId, SocketError> {
        self.lock().open(family, socket_type, protocol)
    }

    /// Binds to `local`, attaching one port per matching service.
    pub fn bind(&self, fd: SocketId, local: SocketAddr) -> Result<(), SocketError> {
        self.lock().bind(fd, local)
    }

    /// Starts listening. A `backlog` of zero uses the configured ceiling.
    pub fn listen(&self, fd: SocketId, backlog: usize) -> Result<(), SocketError> {
        self.lock().listen(fd, backlog)
    }

    /// Takes the oldest connection off the backlog.
    pub fn accept(&self, fd: SocketId) -> Result<SocketId, SocketError> {
        self.lock().accept(fd)
    }

    /// Starts a connect, or reports the outcome of one already started.
    ///
    /// A stream connect returns [`SocketError::InProgress`] until one port has
    /// connected or every port has failed. The outcome is reported once;
    /// later calls on a connected socket return
    /// [`SocketError::AlreadyConnected`].
    pub fn connect(&self, fd: SocketId, remote: SocketAddr) -> Result<(), SocketError> {
        self.lock().connect(fd, remote)
    }

    pub fn send(&self, fd: SocketId, data: &[u8], flags: MessageFlags) -> Result<usize, SocketError> {
        self.lock().send(fd, data, flags, None)
    }

    pub fn send_to(
        &self,
        fd: SocketId,
        data: &[u8],
        flags: MessageFlags,
        to: SocketAddr,
    ) -> Result<usize, SocketError> {
        self.lock().send(fd, data, flags, Some(to))
    }

    /// Reads at most `len` bytes, or one datagram truncated to `len`.
    pub fn receive(
        &self,
        fd: SocketId,
        len: usize,
        flags: MessageFlags,
    ) -> Result<ReceivedData, SocketError> {
        self.lock().receive(fd, flags, len)
    }

    pub fn shutdown(&self, fd: SocketId, how: ShutdownHow) -> Result<(), SocketError> {
        self.lock().shutdown(fd, how)
    }

    /// Starts a graceful close. Queued data is transmitted first.
    pub fn close(&self, fd: SocketId) -> Result<(), SocketError> {
        self.lock().close(fd, false)
    }

    /// Starts an immediate close, discarding queued data.
    pub fn close_now(&self, fd: SocketId) -> Result<(), SocketError> {
        self.lock().close(fd, true)
    }

    /// Returns `Ok` and frees the socket once every port has closed.
    pub fn close_poll(&self, fd: SocketId) -> Result<(), SocketError> {
        self.lock().close_poll(fd)
    }

    pub fn local_address(&self, fd: SocketId) -> Result<SocketAddr, SocketError> {
        self.lock().local_address(fd)
    }

    pub fn remote_address(&self, fd: SocketId) -> Result<SocketAddr, SocketError> {
        self.lock().remote_address(fd)
    }

    pub fn get_option(&self, fd: SocketId, option: SocketOption) -> Result<OptionValue, SocketError> {
        self.lock().get_option(fd, option)
    }

    pub fn set_option(
        &self,
        fd: SocketId,
        option: SocketOption,
        value: OptionValue,
    ) -> Result<(), SocketError> {
        self.lock().set_option(fd, option, value)
    }

    pub fn poll(&self, fd: SocketId, interest: PollEvents) -> PollEvents {
        self.lock().poll(fd, interest)
    }

    pub fn stats(&self, fd: SocketId) -> Result<SocketStats, SocketError> {
        self.lock().stats(fd)
    }

    /// Routes every queued completion. Returns how many were handled.
    pub fn dispatch(&self) -> usize {
        let mut state = self.lock();
        let mut handled = 0;
        loop {
            let completions = self.sink.take_all();
            if completions.is_empty() {
                return handled;
            }
            for completion in completions {
                handled += 1;
                state.complete(completion);
            }
        }
    }

    /// Gives every transport a chance to make progress.
    pub fn poll_transports(&self) {
        self.lock().poll_transports();
    }

    /// Dispatches completions as they arrive and polls the transports on a
    /// timer. Every socket is closed immediately once `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: Shutdown) {
        let period = self.config().dispatch_interval.max(Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.wait_for_shutdown() => break,
                _ = self.sink.notified() => {
                    self.dispatch();
                }
                _ = ticker.tick() => {
                    self.poll_transports();
                    self.dispatch();
                }
            }
        }
        tracing::info!(target: "LAYER", "shutting down");
        self.lock().shut_down();
        self.dispatch();
    }

    /// Retries `attempt` after every dispatch that may have changed the
    /// socket until it is ready.
    async fn wait_for<T>(
        &self,
        fd: SocketId,
        mut attempt: impl FnMut(&mut LayerState) -> Poll<T>,
    ) -> T {
        let readiness: Arc<Notify> = self
            .lock()
            .sockets
            .get(&fd)
            .map(|socket| Arc::clone(&socket.readiness))
            .unwrap_or_default();
        loop {
            let notified = readiness.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.dispatch();
            let ready = attempt(&mut *self.lock());
            if let Poll::Ready(value) = ready {
                return value;
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = self.sink.notified() => {}
            }
        }
    }

    /// Waits until the socket reports any of `interest`, or an event that is
    /// always reported.
    pub async fn wait(&self, fd: SocketId, interest: PollEvents) -> PollEvents {
        self.wait_for(fd, |state| {
            let events = state.poll(fd, interest);
            if events.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(events)
            }
        })
        .await
    }

    pub async fn accept_wait(&self, fd: SocketId) -> Result<SocketId, SocketError> {
        self.wait_for(fd, |state| match state.accept(fd) {
            Err(SocketError::WouldBlock) => Poll::Pending,
            result => Poll::Ready(result),
        })
        .await
    }

    /// Connects and waits for the outcome.
    pub async fn connect_wait(&self, fd: SocketId, remote: SocketAddr) -> Result<(), SocketError> {
        self.wait_for(fd, |state| match state.connect(fd, remote) {
            Err(SocketError::InProgress) => Poll::Pending,
            result => Poll::Ready(result),
        })
        .await
    }

    /// Receives, waiting for data. Gives up with
    /// [`SocketError::WouldBlock`] once the socket's receive timeout passes.
    pub async fn receive_wait(
        &self,
        fd: SocketId,
        len: usize,
        flags: MessageFlags,
    ) -> Result<ReceivedData, SocketError> {
        let limit = match self.get_option(fd, SocketOption::ReceiveTimeout)? {
            OptionValue::Timeout(limit) => limit,
            _ => None,
        };
        let receiving = self.wait_for(fd, |state| match state.receive(fd, flags, len) {
            Err(SocketError::WouldBlock) => Poll::Pending,
            result => Poll::Ready(result),
        });
        match limit {
            Some(limit) => timeout(limit, receiving)
                .await
                .unwrap_or(Err(SocketError::WouldBlock)),
            None => receiving.await,
        }
    }

    /// Waits for a started close to finish and frees the socket.
    pub async fn close_wait(&self, fd: SocketId) -> Result<(), SocketError> {
        self.wait_for(fd, |state| match state.close_poll(fd) {
            Err(SocketError::InProgress) => Poll::Pending,
            result => Poll::Ready(result),
        })
        .await
    }
}

impl Default for SocketLayer {
    fn default() -> Self {
        Self::new(Config::default())
    }
}
