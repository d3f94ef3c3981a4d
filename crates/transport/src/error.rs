//! Error types for the transport crate.

use thiserror::Error;

/// Transport error type covering every capability the adapter exposes.
#[derive(Debug, Error)]
pub enum TransportError {
    // Connection establishment
    /// The endpoint could not be reached or the handshake failed.
    #[error("dial failed: {0}")]
    Dial(String),

    /// The remote side rejected the supplied credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    // Channel operations
    /// A session channel could not be opened on the connection.
    #[error("failed to open channel: {0}")]
    ChannelOpen(String),

    /// The remote side refused to allocate a pseudo-terminal.
    #[error("pty request refused: {0}")]
    PtyRequest(String),

    /// A stream endpoint was unavailable or already taken.
    #[error("stream unavailable: {0}")]
    Stream(String),

    /// The remote shell could not be started.
    #[error("failed to start shell: {0}")]
    Shell(String),

    /// A window-change request could not be delivered.
    #[error("window change failed: {0}")]
    Resize(String),

    /// Waiting on the remote process failed before an exit status arrived.
    #[error("remote wait failed: {0}")]
    Wait(String),

    /// An operation was issued in the wrong order (e.g. shell before pty).
    #[error("invalid channel state: {0}")]
    InvalidState(&'static str),

    // Teardown
    /// The channel or connection was already closed.
    #[error("already closed")]
    Closed,

    /// I/O error from the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Returns true for the benign error reported when a resource is closed twice.
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
