//! A transport driven entirely by hand.
//!
//! [`ManualAdapter`] is a [`TransportFactory`] for one adapter address. Every
//! transport it creates records the operations the socket layer posts and
//! completes nothing on its own, except `close` while auto-close is on. The
//! matching [`ManualHandle`] lets a caller complete connects, accepts, receives
//! and transmits in any order, which makes races and partial progress easy to
//! reproduce.

use super::{
    CompletionSink, Event, Inbound, ModeData, Token, Transport, TransportConfig,
    TransportFactory,
};
use crate::{
    address::{IPPROTO_TCP, IPPROTO_UDP},
    error::TransportError,
    packet::TxMeta,
};
use std::{
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// An operation posted to a manual transport and not yet completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect,
    Accept,
    Receive { capacity: usize },
    Transmit { data: Vec<u8>, meta: TxMeta },
    Close { abort: bool },
}

struct AdapterShared {
    address: IpAddr,
    next_port: u16,
    transports: Vec<ManualHandle>,
    create_error: Option<TransportError>,
    configure_error: Option<TransportError>,
    auto_close: bool,
}

impl AdapterShared {
    fn ephemeral_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = match self.next_port {
            u16::MAX => FIRST_EPHEMERAL_PORT,
            n => n + 1,
        };
        port
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Creates [`ManualTransport`]s for one adapter address.
pub struct ManualAdapter {
    shared: Arc<Mutex<AdapterShared>>,
}

/// Inspects and scripts the transports a [`ManualAdapter`] created.
#[derive(Clone)]
pub struct AdapterHandle {
    shared: Arc<Mutex<AdapterShared>>,
}

impl ManualAdapter {
    pub fn new(address: IpAddr) -> (Self, AdapterHandle) {
        let shared = Arc::new(Mutex::new(AdapterShared {
            address,
            next_port: FIRST_EPHEMERAL_PORT,
            transports: Vec::new(),
            create_error: None,
            configure_error: None,
            auto_close: true,
        }));
        (
            Self {
                shared: Arc::clone(&shared),
            },
            AdapterHandle { shared },
        )
    }
}

impl TransportFactory for ManualAdapter {
    fn create(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        let mut adapter = lock(&self.shared);
        if let Some(error) = adapter.create_error {
            return Err(error);
        }
        let transport = ManualTransport::new(
            Arc::clone(&self.shared),
            adapter.configure_error,
            adapter.auto_close,
        );
        adapter.transports.push(transport.handle());
        Ok(Box::new(transport))
    }
}

impl AdapterHandle {
    pub fn address(&self) -> IpAddr {
        lock(&self.shared).address
    }

    /// Every transport created so far, oldest first. Accepted children are
    /// included.
    pub fn transports(&self) -> Vec<ManualHandle> {
        lock(&self.shared).transports.clone()
    }

    pub fn transport(&self, index: usize) -> Option<ManualHandle> {
        lock(&self.shared).transports.get(index).cloned()
    }

    pub fn last(&self) -> Option<ManualHandle> {
        lock(&self.shared).transports.last().cloned()
    }

    /// Makes later `create` calls fail.
    pub fn fail_create(&self, error: Option<TransportError>) {
        lock(&self.shared).create_error = error;
    }

    /// Makes transports created from now on fail `configure`.
    pub fn fail_configure(&self, error: Option<TransportError>) {
        lock(&self.shared).configure_error = error;
    }

    /// Sets auto-close for transports created from now on.
    pub fn set_auto_close(&self, auto_close: bool) {
        lock(&self.shared).auto_close = auto_close;
    }
}

struct ManualState {
    adapter: Arc<Mutex<AdapterShared>>,
    sink: Option<CompletionSink>,
    config: Option<TransportConfig>,
    mode: ModeData,
    pending: Vec<(Token, Request)>,
    transmitted: Vec<Vec<u8>>,
    cancelled: usize,
    configure_error: Option<TransportError>,
    auto_close: bool,
    closed: bool,
    polls: usize,
}

impl ManualState {
    fn finish(&self, token: Token, outcome: Result<Event, TransportError>) -> bool {
        match &self.sink {
            Some(sink) => {
                sink.complete(token, outcome);
                true
            }
            None => false,
        }
    }

    fn take(&mut self, matches: impl Fn(&Request) -> bool) -> Option<(Token, Request)> {
        let index = self.pending.iter().position(|(_, request)| matches(request))?;
        Some(self.pending.remove(index))
    }

    fn abort_where(&mut self, matches: impl Fn(&Request) -> bool) {
        let (aborted, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, request)| matches(request));
        self.pending = kept;
        for (token, _) in aborted {
            self.finish(token, Err(TransportError::Aborted));
        }
    }

    fn require_configured(&self) -> Result<&TransportConfig, TransportError> {
        self.config.as_ref().ok_or(TransportError::NotStarted)
    }

    fn receive_complete(&mut self, inbound: Inbound) -> bool {
        match self.take(|r| matches!(r, Request::Receive { .. })) {
            Some((token, _)) => self.finish(token, Ok(Event::Received(inbound))),
            None => false,
        }
    }
}

/// A transport completed by hand through its [`ManualHandle`].
pub struct ManualTransport {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTransport {
    fn new(
        adapter: Arc<Mutex<AdapterShared>>,
        configure_error: Option<TransportError>,
        auto_close: bool,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                adapter,
                sink: None,
                config: None,
                mode: ModeData::default(),
                pending: Vec::new(),
                transmitted: Vec::new(),
                cancelled: 0,
                configure_error,
                auto_close,
                closed: false,
                polls: 0,
            })),
        }
    }

    pub fn handle(&self) -> ManualHandle {
        ManualHandle {
            state: Arc::clone(&self.state),
        }
    }
}

impl Transport for ManualTransport {
    fn attach(&mut self, sink: CompletionSink) {
        lock(&self.state).sink = Some(sink);
    }

    fn configure(&mut self, config: Option<&TransportConfig>) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let Some(config) = config else {
            state.abort_where(|_| true);
            state.config = None;
            state.mode = ModeData::default();
            return Ok(());
        };
        if let Some(error) = state.configure_error {
            return Err(error);
        }
        let mut local = config.local;
        {
            let mut adapter = lock(&state.adapter);
            if local.ip().is_unspecified() && local.is_ipv4() == adapter.address.is_ipv4() {
                local.set_ip(adapter.address);
            }
            let uses_ports = matches!(config.protocol, IPPROTO_TCP | IPPROTO_UDP);
            if uses_ports && local.port() == 0 {
                // Keep the port picked by an earlier configure.
                let earlier = state.mode.local.map_or(0, |addr| addr.port());
                local.set_port(match earlier {
                    0 => adapter.ephemeral_port(),
                    port => port,
                });
            }
        }
        state.mode = ModeData {
            local: Some(local),
            remote: config.remote,
        };
        state.config = Some(config.clone());
        state.closed = false;
        Ok(())
    }

    fn connect(&mut self, token: Token) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if state.require_configured()?.remote.is_none() {
            return Err(TransportError::InvalidParameter);
        }
        state.pending.push((token, Request::Connect));
        Ok(())
    }

    fn accept(&mut self, token: Token) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        if !state.require_configured()?.passive {
            return Err(TransportError::NotStarted);
        }
        state.pending.push((token, Request::Accept));
        Ok(())
    }

    fn transmit(&mut self, token: Token, data: &[u8], meta: &TxMeta) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.require_configured()?;
        if state.closed {
            return Err(TransportError::NotStarted);
        }
        state.transmitted.push(data.to_vec());
        state.pending.push((
            token,
            Request::Transmit {
                data: data.to_vec(),
                meta: *meta,
            },
        ));
        Ok(())
    }

    fn receive(&mut self, token: Token, capacity: usize) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.require_configured()?;
        state.pending.push((token, Request::Receive { capacity }));
        Ok(())
    }

    fn cancel(&mut self, token: Token) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        let index = state
            .pending
            .iter()
            .position(|(pending, _)| *pending == token)
            .ok_or(TransportError::NotStarted)?;
        state.pending.remove(index);
        state.cancelled += 1;
        state.finish(token, Err(TransportError::Aborted));
        Ok(())
    }

    fn poll(&mut self) -> Result<(), TransportError> {
        lock(&self.state).polls += 1;
        Ok(())
    }

    fn mode_data(&self) -> ModeData {
        lock(&self.state).mode
    }

    fn close(&mut self, token: Token, abort: bool) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.closed = true;
        state.abort_where(|request| match request {
            Request::Transmit { .. } => abort,
            Request::Close { .. } => false,
            _ => true,
        });
        if state.auto_close {
            state.finish(token, Ok(Event::Closed));
        } else {
            state.pending.push((token, Request::Close { abort }));
        }
        Ok(())
    }
}

/// Scripts one [`ManualTransport`]. Completion methods return `false` when no
/// matching operation was pending.
#[derive(Clone)]
pub struct ManualHandle {
    state: Arc<Mutex<ManualState>>,
}

impl ManualHandle {
    /// Operations still waiting for completion, oldest first.
    pub fn pending(&self) -> Vec<Request> {
        lock(&self.state)
            .pending
            .iter()
            .map(|(_, request)| request.clone())
            .collect()
    }

    pub fn pending_receives(&self) -> usize {
        self.count(|r| matches!(r, Request::Receive { .. }))
    }

    pub fn pending_transmits(&self) -> usize {
        self.count(|r| matches!(r, Request::Transmit { .. }))
    }

    pub fn has_pending_connect(&self) -> bool {
        self.count(|r| matches!(r, Request::Connect)) > 0
    }

    pub fn has_pending_accept(&self) -> bool {
        self.count(|r| matches!(r, Request::Accept)) > 0
    }

    fn count(&self, matches: impl Fn(&Request) -> bool) -> usize {
        lock(&self.state)
            .pending
            .iter()
            .filter(|(_, request)| matches(request))
            .count()
    }

    pub fn is_configured(&self) -> bool {
        lock(&self.state).config.is_some()
    }

    pub fn configuration(&self) -> Option<TransportConfig> {
        lock(&self.state).config.clone()
    }

    pub fn mode_data(&self) -> ModeData {
        lock(&self.state).mode
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Payloads of every transmit posted so far, completed or not.
    pub fn transmitted(&self) -> Vec<Vec<u8>> {
        lock(&self.state).transmitted.clone()
    }

    /// How many operations were cancelled.
    pub fn cancelled(&self) -> usize {
        lock(&self.state).cancelled
    }

    pub fn polls(&self) -> usize {
        lock(&self.state).polls
    }

    pub fn set_auto_close(&self, auto_close: bool) {
        lock(&self.state).auto_close = auto_close;
    }

    pub fn fail_configure(&self, error: Option<TransportError>) {
        lock(&self.state).configure_error = error;
    }

    pub fn complete_connect(&self, result: Result<(), TransportError>) -> bool {
        let mut state = lock(&self.state);
        match state.take(|r| matches!(r, Request::Connect)) {
            Some((token, _)) => state.finish(token, result.map(|()| Event::Connected)),
            None => false,
        }
    }

    /// Completes the oldest receive with normal data.
    pub fn deliver(&self, data: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let inbound = Inbound {
            data: data.to_vec(),
            urgent: false,
            remote: state.mode.remote,
            local: state.mode.local,
        };
        state.receive_complete(inbound)
    }

    /// Completes the oldest receive with urgent data.
    pub fn deliver_urgent(&self, data: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let inbound = Inbound {
            data: data.to_vec(),
            urgent: true,
            remote: state.mode.remote,
            local: state.mode.local,
        };
        state.receive_complete(inbound)
    }

    /// Completes the oldest receive with a datagram from `remote`.
    pub fn deliver_from(&self, remote: SocketAddr, data: &[u8]) -> bool {
        let mut state = lock(&self.state);
        let inbound = Inbound {
            data: data.to_vec(),
            urgent: false,
            remote: Some(remote),
            local: state.mode.local,
        };
        state.receive_complete(inbound)
    }

    pub fn fail_receive(&self, error: TransportError) -> bool {
        let mut state = lock(&self.state);
        match state.take(|r| matches!(r, Request::Receive { .. })) {
            Some((token, _)) => state.finish(token, Err(error)),
            None => false,
        }
    }

    /// Reports that the peer finished sending.
    pub fn end_of_stream(&self) -> bool {
        self.fail_receive(TransportError::EndOfStream)
    }

    /// Completes the oldest transmit.
    pub fn complete_transmit(&self, result: Result<(), TransportError>) -> bool {
        let mut state = lock(&self.state);
        match state.take(|r| matches!(r, Request::Transmit { .. })) {
            Some((token, _)) => state.finish(token, result.map(|()| Event::Transmitted)),
            None => false,
        }
    }

    /// Completes the pending accept with a new connection from `remote` and
    /// returns the handle of the child transport.
    pub fn accept_connection(&self, remote: SocketAddr) -> Option<ManualHandle> {
        let mut state = lock(&self.state);
        let (token, _) = state.take(|r| matches!(r, Request::Accept))?;
        let auto_close = lock(&state.adapter).auto_close;
        let child = ManualTransport::new(Arc::clone(&state.adapter), None, auto_close);
        {
            let mut child_state = lock(&child.state);
            child_state.sink = state.sink.clone();
            child_state.config = state.config.clone().map(|mut config| {
                config.passive = false;
                config.remote = Some(remote);
                config
            });
            child_state.mode = ModeData {
                local: state.mode.local,
                remote: Some(remote),
            };
        }
        let handle = child.handle();
        lock(&state.adapter).transports.push(handle.clone());
        state.finish(
            token,
            Ok(Event::Accepted {
                transport: Box::new(child),
                remote,
            }),
        );
        Some(handle)
    }

    pub fn fail_accept(&self, error: TransportError) -> bool {
        let mut state = lock(&self.state);
        match state.take(|r| matches!(r, Request::Accept)) {
            Some((token, _)) => state.finish(token, Err(error)),
            None => false,
        }
    }

    /// Completes a close posted while auto-close was off.
    pub fn complete_close(&self) -> bool {
        let mut state = lock(&self.state);
        match state.take(|r| matches!(r, Request::Close { .. })) {
            Some((token, _)) => state.finish(token, Ok(Event::Closed)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn config(local: &str) -> TransportConfig {
        TransportConfig {
            local: local.parse().unwrap(),
            remote: None,
            passive: false,
            protocol: IPPROTO_UDP,
            time_to_live: 64,
            type_of_service: 0,
            no_delay: false,
            header_included: false,
            receive_timeout: None,
            send_timeout: None,
        }
    }

    #[test]
    fn configure_assigns_adapter_address_and_ephemeral_port() {
        let (mut adapter, handle) = ManualAdapter::new(Ipv4Addr::new(10, 0, 0, 1).into());
        let mut first = adapter.create().unwrap();
        let mut second = adapter.create().unwrap();
        first.configure(Some(&config("0.0.0.0:0"))).unwrap();
        second.configure(Some(&config("0.0.0.0:0"))).unwrap();

        let a = first.mode_data().local.unwrap();
        let b = second.mode_data().local.unwrap();
        assert_eq!(a, "10.0.0.1:49152".parse().unwrap());
        assert_eq!(b.port(), 49153);
        assert_eq!(handle.transports().len(), 2);
    }

    #[test]
    fn completions_reach_the_sink() {
        let (mut adapter, handle) = ManualAdapter::new(Ipv4Addr::LOCALHOST.into());
        let sink = CompletionSink::new();
        let mut transport = adapter.create().unwrap();
        transport.attach(sink.clone());
        transport.configure(Some(&config("127.0.0.1:7"))).unwrap();
        transport.receive(Token::new(1), 64).unwrap();

        let manual = handle.last().unwrap();
        assert_eq!(manual.pending_receives(), 1);
        assert!(manual.deliver_from("127.0.0.1:9".parse().unwrap(), b"ping"));
        assert!(!manual.deliver(b"nobody waiting"));

        let completion = sink.take_all().pop_front().unwrap();
        assert_eq!(completion.token, Token::new(1));
        match completion.outcome {
            Ok(Event::Received(inbound)) => assert_eq!(inbound.data, b"ping"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn close_aborts_outstanding_receives() {
        let (mut adapter, handle) = ManualAdapter::new(Ipv4Addr::LOCALHOST.into());
        let sink = CompletionSink::new();
        let mut transport = adapter.create().unwrap();
        transport.attach(sink.clone());
        transport.configure(Some(&config("127.0.0.1:7"))).unwrap();
        transport.receive(Token::new(1), 64).unwrap();
        transport.close(Token::new(2), false).unwrap();

        let outcomes: Vec<_> = sink.take_all().into_iter().collect();
        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0].outcome, Err(TransportError::Aborted)));
        assert!(matches!(outcomes[1].outcome, Ok(Event::Closed)));
        assert!(handle.last().unwrap().is_closed());
    }

    #[test]
    fn unconfigured_transport_refuses_work() {
        let (mut adapter, _) = ManualAdapter::new(Ipv4Addr::LOCALHOST.into());
        let mut transport = adapter.create().unwrap();
        assert_eq!(
            transport.receive(Token::new(1), 8),
            Err(TransportError::NotStarted)
        );
        assert_eq!(transport.cancel(Token::new(1)), Err(TransportError::NotStarted));
    }
}
