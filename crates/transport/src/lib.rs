//! # wsm Transport Adapter
//!
//! Capability contracts between the interactive session core and the secure
//! transport that carries it. The core never performs key exchange, host-key
//! verification or authentication itself; it asks a [`Transport`] to dial,
//! then drives a single [`Channel`] on the resulting [`Connection`].
//!
//! ## Capabilities
//!
//! ```text
//! Transport::dial ──▶ Connection::open_channel ──▶ Channel
//!                                                   ├─ request_pty
//!                                                   ├─ take_stdin / take_stdout / take_stderr
//!                                                   ├─ start_shell
//!                                                   ├─ resize
//!                                                   ├─ wait
//!                                                   └─ close
//! ```
//!
//! Channel methods take `&self` so that waiting, resizing and closing can
//! run concurrently from different tasks. Each stream endpoint can be taken
//! exactly once.
//!
//! ## Adapters
//!
//! - [`ssh`]: password-authenticated SSH via `russh`
//! - [`local`]: loopback adapter running the shell on a local PTY
//! - [`mock`]: scriptable in-memory adapter for tests (feature `mock`)

pub mod error;
pub mod local;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod ssh;
pub mod types;

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

pub use error::{Result, TransportError};
pub use local::LocalTransport;
pub use ssh::{SshOptions, SshTransport};
pub use types::{Credential, DialParams, ExitStatus, TerminalModes, WindowSize};

/// Remote stdin endpoint.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Remote stdout or stderr endpoint.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Dials authenticated connections.
pub trait Transport: Send + Sync {
    type Connection: Connection;

    /// Establishes and authenticates a connection.
    ///
    /// Fails with [`TransportError::Dial`] when the endpoint cannot be
    /// reached and [`TransportError::Auth`] when credentials are rejected.
    fn dial(
        &self,
        params: &DialParams,
    ) -> impl Future<Output = Result<Self::Connection>> + Send;
}

/// An established connection that can host session channels.
pub trait Connection: Send + Sync + 'static {
    type Channel: Channel;

    /// Opens a session channel.
    fn open_channel(&self) -> impl Future<Output = Result<Self::Channel>> + Send;

    /// Closes the connection. A second call returns [`TransportError::Closed`].
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}

/// A remote command channel.
pub trait Channel: Send + Sync + 'static {
    /// Asks the remote side to allocate a pseudo-terminal.
    fn request_pty(
        &self,
        term: &str,
        size: WindowSize,
        modes: &TerminalModes,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Takes the remote stdin endpoint.
    fn take_stdin(&self) -> Result<BoxedWriter>;

    /// Takes the remote stdout endpoint.
    fn take_stdout(&self) -> Result<BoxedReader>;

    /// Takes the remote stderr endpoint.
    fn take_stderr(&self) -> Result<BoxedReader>;

    /// Starts the login shell on the allocated pty.
    fn start_shell(&self) -> impl Future<Output = Result<()>> + Send;

    /// Sends a window-change request.
    fn resize(&self, size: WindowSize) -> impl Future<Output = Result<()>> + Send;

    /// Resolves once the remote process terminates.
    fn wait(&self) -> impl Future<Output = Result<ExitStatus>> + Send;

    /// Closes the channel. A second call returns [`TransportError::Closed`].
    fn close(&self) -> impl Future<Output = Result<()>> + Send;
}
