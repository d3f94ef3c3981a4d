//! Session error taxonomy.

use thiserror::Error;
use transport::TransportError;

use crate::config::ConfigError;
use crate::session::SessionState;

/// Errors surfaced by [`TerminalSession`](crate::TerminalSession) operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The caller-supplied configuration is invalid.
    #[error("invalid session config: {0}")]
    InvalidConfig(#[from] ConfigError),

    /// The transport could not be established.
    #[error("dial failed: {0}")]
    Dial(#[source] TransportError),

    /// The remote side rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(#[source] TransportError),

    /// No session channel could be opened on the connection.
    #[error("failed to open channel: {0}")]
    ChannelOpen(#[source] TransportError),

    /// The remote side refused to allocate a pseudo-terminal.
    #[error("pty request failed: {0}")]
    PtyRequest(#[source] TransportError),

    /// One of the stdin/stdout/stderr endpoints could not be acquired.
    #[error("failed to acquire remote {stream}: {source}")]
    StreamAcquisition {
        stream: &'static str,
        #[source]
        source: TransportError,
    },

    /// The remote shell could not be started.
    #[error("failed to start remote shell: {0}")]
    ShellStart(#[source] TransportError),

    /// The local terminal cannot be switched into raw mode.
    #[error("local terminal unavailable: {0}")]
    TerminalMode(String),

    /// A pump failed reading or writing a stream.
    #[error("remote I/O failed: {0}")]
    RemoteIo(String),

    /// Waiting on the remote process failed.
    #[error("remote exit: {0}")]
    RemoteExit(String),

    /// The remote side rejected a window-change request.
    #[error("window change failed: {0}")]
    WindowChange(#[source] TransportError),

    /// `connect` was called on a session that already left `Idle`.
    #[error("session already connected")]
    AlreadyConnected,

    /// The operation needs a running shell.
    #[error("session is not running (state: {state})")]
    NotRunning { state: SessionState },

    /// Teardown already ran; nothing was released a second time.
    #[error("session already closed")]
    AlreadyClosed,

    /// Releasing the channel or connection failed.
    #[error("close failed: {0}")]
    Close(#[source] TransportError),
}

impl SessionError {
    /// Maps a dial failure onto the session taxonomy.
    pub(crate) fn from_dial(err: TransportError) -> Self {
        match err {
            TransportError::Auth(_) => SessionError::Auth(err),
            other => SessionError::Dial(other),
        }
    }

    /// Returns true for the benign error of closing twice.
    pub fn is_already_closed(&self) -> bool {
        matches!(self, SessionError::AlreadyClosed)
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_errors_are_categorized() {
        let auth = SessionError::from_dial(TransportError::Auth("denied".into()));
        assert!(matches!(auth, SessionError::Auth(_)));

        let dial = SessionError::from_dial(TransportError::Dial("refused".into()));
        assert!(matches!(dial, SessionError::Dial(_)));

        let io = SessionError::from_dial(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "timed out",
        )));
        assert!(matches!(io, SessionError::Dial(_)));
    }

    #[test]
    fn test_display_messages() {
        let err = SessionError::StreamAcquisition {
            stream: "stdout",
            source: TransportError::Stream("gone".into()),
        };
        assert_eq!(
            err.to_string(),
            "failed to acquire remote stdout: stream unavailable: gone"
        );

        let err = SessionError::NotRunning {
            state: SessionState::Idle,
        };
        assert_eq!(err.to_string(), "session is not running (state: idle)");
        assert!(SessionError::AlreadyClosed.is_already_closed());
    }
}
