//! A BSD-style socket layer over per-adapter transport services.
//!
//! Applications open sockets of a family, type and protocol and use them with
//! the familiar bind, listen, accept, connect, send, receive, shutdown and
//! close operations. Underneath, each socket owns one port per network
//! adapter service it is bound to, and each port drives one transport
//! instance for that adapter.
//!
//! # Organization
//! - [`SocketLayer`] is the entry point. It owns every socket, port and
//!   service behind a single lock.
//! - [`Transport`] and [`TransportFactory`] are what a network stack
//!   implements to plug into the layer. [`transport::manual`] is an in-memory
//!   implementation driven by hand, used by the tests.
//! - [`Config`] holds the tunables: buffer watermarks, backlog ceiling and
//!   packet sizes.
//!
//! # Completions
//!
//! Transports never call into the layer. Every asynchronous operation is
//! started with a [`Token`] and finishes by queueing a
//! [`Completion`](transport::Completion) in the layer's sink. Nothing changes
//! until [`SocketLayer::dispatch`] runs, either called directly or from the
//! [`SocketLayer::run`] task.
//!
//! # Variants
//!
//! Each socket is driven by the capability table of its variant: raw IPv4,
//! TCP over IPv4 or IPv6, or UDP over IPv4 or IPv6. The table decides which
//! operations are supported and how addresses, options and packet metadata
//! are handled.

pub mod address;
pub use address::{ProtocolFamily, SocketType, Variant, IPPROTO_TCP, IPPROTO_UDP};

pub mod config;
pub use config::Config;

mod error;
pub use error::{FailureKind, SocketError, TransportError};

pub mod flags;
pub use flags::{MessageFlags, PollEvents};

mod id;
pub use id::{Id, PortId, ServiceId, SocketId, Token};

pub mod logging;

pub mod options;
pub use options::{OptionValue, ProtocolOptions, SocketOption};

pub mod packet;
pub use packet::{RxMeta, TxMeta};

pub mod transport;
pub use transport::{Transport, TransportFactory};

mod shutdown;
pub use shutdown::Shutdown;

mod io;
mod layer;
mod port;
mod protocol;
mod protocols;
mod queue;
mod service;
mod socket;

pub use layer::SocketLayer;
pub use port::PortState;
pub use queue::ReceivedData;
pub use service::ServiceInfo;
pub use socket::{ShutdownHow, SocketState, SocketStats};
