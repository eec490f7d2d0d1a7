//! Wrapper functions for the events the socket layer logs.
//!
//! Each helper emits a `tracing` event under a fixed target so a subscriber can
//! filter socket transitions (`SOCKET`), port transitions (`PORT`) and
//! completion routing (`DISPATCH`) independently.

use crate::{
    id::{PortId, SocketId, Token},
    port::PortState,
    socket::SocketState,
};
use std::{
    fs::{self, OpenOptions},
    io,
    path::Path,
    sync::Arc,
};
use thiserror::Error as ThisError;
use tracing::{event, subscriber::SetGlobalDefaultError, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Debug, ThisError)]
pub enum LoggingError {
    #[error("Could not open the log file: {0}")]
    Io(#[from] io::Error),
    #[error("A global subscriber is already installed")]
    AlreadyInstalled(#[from] SetGlobalDefaultError),
}

/// Installs a JSON subscriber that appends every event to
/// `<dir>/debug-<date>.log`. Only call this once per process.
pub fn init_events(dir: impl AsRef<Path>) -> Result<(), LoggingError> {
    let dir = dir.as_ref();
    fs::create_dir_all(dir)?;
    let file_path = dir.join(format!(
        "debug-{}.log",
        chrono::offset::Local::now().format("%y-%m-%d")
    ));
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::TRACE)
        .with_writer(Arc::new(file))
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Installs a human-readable subscriber writing to stderr.
pub fn init_stderr(level: Level) -> Result<(), LoggingError> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

pub(crate) fn socket_state_event(socket: SocketId, from: SocketState, to: SocketState) {
    event!(
        target: "SOCKET",
        Level::DEBUG,
        socket = %socket,
        from = ?from,
        to = ?to,
    );
}

pub(crate) fn port_state_event(port: PortId, socket: SocketId, from: PortState, to: PortState) {
    event!(
        target: "PORT",
        Level::DEBUG,
        port = %port,
        socket = %socket,
        from = ?from,
        to = ?to,
    );
}

/// A completion arrived for a token the layer no longer tracks.
pub(crate) fn dropped_completion_event(token: Token, reason: &str) {
    event!(target: "DISPATCH", Level::DEBUG, token = %token, reason);
}

pub(crate) fn latched_error_event(socket: SocketId, direction: &str, error: crate::SocketError) {
    event!(
        target: "SOCKET",
        Level::WARN,
        socket = %socket,
        direction,
        error = %error,
    );
}
