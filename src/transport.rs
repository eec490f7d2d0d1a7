//! The interface the socket layer consumes from each per-adapter transport.
//!
//! A transport accepts operations tagged with a [`Token`] and reports their
//! outcome later by pushing a [`Completion`] into the [`CompletionSink`] it was
//! attached to. A transport must never call back into the socket layer while
//! one of its methods is running; the layer drains the sink on its own
//! schedule in [`SocketLayer::dispatch`](crate::SocketLayer::dispatch).

use crate::{error::TransportError, packet::TxMeta};
use std::{
    collections::VecDeque,
    fmt::{self, Debug},
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::sync::Notify;

pub use crate::id::Token;

pub mod manual;

/// Everything a transport needs to configure one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub local: SocketAddr,
    pub remote: Option<SocketAddr>,
    /// Wait for a peer instead of connecting to one.
    pub passive: bool,
    /// IP protocol number.
    pub protocol: u8,
    pub time_to_live: u8,
    pub type_of_service: u8,
    pub no_delay: bool,
    pub header_included: bool,
    pub receive_timeout: Option<Duration>,
    pub send_timeout: Option<Duration>,
}

/// Addresses a configured transport actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModeData {
    pub local: Option<SocketAddr>,
    pub remote: Option<SocketAddr>,
}

/// Data delivered by a completed receive.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Inbound {
    pub data: Vec<u8>,
    pub urgent: bool,
    /// Sender, for connectionless transports.
    pub remote: Option<SocketAddr>,
    /// Local address the data arrived on, for connectionless transports.
    pub local: Option<SocketAddr>,
}

/// What a successful operation produced.
pub enum Event {
    Connected,
    /// A listening transport accepted a peer. The child transport is already
    /// configured for the new connection.
    Accepted {
        transport: Box<dyn Transport>,
        remote: SocketAddr,
    },
    Received(Inbound),
    Transmitted,
    Closed,
}

impl Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected => write!(f, "Connected"),
            Self::Accepted { remote, .. } => write!(f, "Accepted({remote})"),
            Self::Received(inbound) => write!(f, "Received({} bytes)", inbound.data.len()),
            Self::Transmitted => write!(f, "Transmitted"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// The outcome of one tokened operation.
#[derive(Debug)]
pub struct Completion {
    pub token: Token,
    pub outcome: Result<Event, TransportError>,
}

/// Where transports report completions. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CompletionSink {
    shared: Arc<SinkShared>,
}

#[derive(Debug, Default)]
struct SinkShared {
    completions: Mutex<VecDeque<Completion>>,
    notify: Notify,
}

impl CompletionSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a completion for the next dispatch.
    pub fn complete(&self, token: Token, outcome: Result<Event, TransportError>) {
        self.shared
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(Completion { token, outcome });
        self.shared.notify.notify_one();
    }

    /// Completions waiting for dispatch.
    pub fn pending(&self) -> usize {
        self.shared
            .completions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub(crate) fn take_all(&self) -> VecDeque<Completion> {
        std::mem::take(
            &mut *self
                .shared
                .completions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Resolves once a completion has been queued since the last wake-up.
    pub(crate) async fn notified(&self) {
        self.shared.notify.notified().await
    }
}

/// One transport instance, bound to one port of one socket.
///
/// Every method returns immediately. Operations that take a token finish by
/// pushing exactly one completion with that token into the attached sink,
/// unless they return an error, in which case no completion follows.
pub trait Transport: Send {
    /// Gives the transport the sink to report completions to.
    fn attach(&mut self, sink: CompletionSink);

    /// Applies a configuration, or resets the transport when given `None`.
    /// Resetting aborts every outstanding operation.
    fn configure(&mut self, config: Option<&TransportConfig>) -> Result<(), TransportError>;

    /// Starts an active open toward the configured remote.
    fn connect(&mut self, token: Token) -> Result<(), TransportError>;

    /// Waits for one peer on a passively configured transport.
    fn accept(&mut self, token: Token) -> Result<(), TransportError>;

    fn transmit(&mut self, token: Token, data: &[u8], meta: &TxMeta) -> Result<(), TransportError>;

    /// Posts a receive of at most `capacity` bytes.
    fn receive(&mut self, token: Token, capacity: usize) -> Result<(), TransportError>;

    /// Aborts an outstanding operation. Its completion reports
    /// [`TransportError::Aborted`].
    fn cancel(&mut self, token: Token) -> Result<(), TransportError>;

    /// Gives the transport a chance to make progress.
    fn poll(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    fn mode_data(&self) -> ModeData;

    /// Closes the connection, aborting outstanding operations first when
    /// `abort` is set.
    fn close(&mut self, token: Token, abort: bool) -> Result<(), TransportError>;
}

/// Creates transports for one service.
pub trait TransportFactory: Send {
    fn create(&mut self) -> Result<Box<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_drains_in_order() {
        let sink = CompletionSink::new();
        let clone = sink.clone();
        clone.complete(Token::new(1), Ok(Event::Transmitted));
        clone.complete(Token::new(2), Err(TransportError::Aborted));
        assert_eq!(sink.pending(), 2);

        let drained: Vec<_> = sink.take_all().into_iter().map(|c| c.token).collect();
        assert_eq!(drained, [Token::new(1), Token::new(2)]);
        assert_eq!(sink.pending(), 0);
    }

    #[tokio::test]
    async fn sink_wakes_waiter() {
        let sink = CompletionSink::new();
        sink.complete(Token::new(5), Ok(Event::Closed));
        // The stored permit resolves the wait without another completion.
        sink.notified().await;
    }
}
