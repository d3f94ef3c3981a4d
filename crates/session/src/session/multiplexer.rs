//! I/O multiplexer.
//!
//! Three independent pumps move bytes between the caller's standard
//! streams and the remote channel:
//!
//! - stdout pump: remote stdout → caller output
//! - stderr pump: remote stderr → caller error sink
//! - stdin pump: caller input → remote stdin
//!
//! No pump waits on another. A pump that fails records its error as the
//! session's exit message and stops; the others keep running until EOF or
//! cancellation.

use std::fmt;
use std::sync::OnceLock;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use transport::{BoxedReader, BoxedWriter};

use crate::error::SessionError;

/// Which pump a log line or outcome belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stream::Stdin => "stdin",
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        })
    }
}

/// How a pump ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpOutcome {
    /// The source reached end of stream.
    Eof,
    /// The session was torn down.
    Cancelled,
    /// A read or write failed; the error is in the exit message.
    Failed,
}

/// The session's final human-readable exit message.
///
/// Single writer: the first failure to report wins, later reports are
/// logged and dropped.
#[derive(Debug, Default)]
pub struct ExitMessage {
    message: OnceLock<String>,
}

impl ExitMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `message` unless one was already recorded.
    pub fn record(&self, message: impl Into<String>) -> bool {
        match self.message.set(message.into()) {
            Ok(()) => true,
            Err(dropped) => {
                tracing::debug!(dropped = %dropped, "Exit message already recorded");
                false
            }
        }
    }

    pub fn get(&self) -> Option<&str> {
        self.message.get().map(String::as_str)
    }
}

/// Copies a remote output stream into a caller sink.
pub async fn pump_output(
    stream: Stream,
    mut source: BoxedReader,
    mut sink: BoxedWriter,
    buffer_size: usize,
    exit_message: &ExitMessage,
    cancel: CancellationToken,
) -> PumpOutcome {
    let mut buffer = vec![0u8; buffer_size];
    let mut copied: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            read = source.read(&mut buffer) => match read {
                Ok(0) => {
                    if let Err(e) = sink.flush().await {
                        tracing::debug!(stream = %stream, error = %e, "Final flush of local stream failed");
                    }
                    tracing::debug!(stream = %stream, bytes = copied, "Remote stream reached EOF");
                    return PumpOutcome::Eof;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(stream = %stream, error = %e, "Error reading remote stream");
                    exit_message.record(remote_io(format_args!("{} read: {}", stream, e)));
                    return PumpOutcome::Failed;
                }
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            written = write_chunk(&mut sink, &buffer[..n]) => {
                if let Err(e) = written {
                    tracing::warn!(stream = %stream, error = %e, "Error writing local stream");
                    exit_message.record(e.to_string());
                    return PumpOutcome::Failed;
                }
            }
        }

        copied += n as u64;
    }
}

/// Copies the caller's input into remote stdin.
///
/// Local EOF shuts down the remote stdin writer so the remote side sees
/// end of input.
pub async fn pump_input(
    mut source: BoxedReader,
    mut sink: BoxedWriter,
    buffer_size: usize,
    exit_message: &ExitMessage,
    cancel: CancellationToken,
) -> PumpOutcome {
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            read = source.read(&mut buffer) => match read {
                Ok(0) => {
                    tracing::debug!("Local input reached EOF");
                    if let Err(e) = sink.shutdown().await {
                        tracing::debug!(error = %e, "Failed to shut down remote stdin");
                    }
                    return PumpOutcome::Eof;
                }
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(error = %e, "Error reading local input");
                    exit_message.record(e.to_string());
                    return PumpOutcome::Failed;
                }
            },
        };

        tokio::select! {
            _ = cancel.cancelled() => return PumpOutcome::Cancelled,
            written = write_chunk(&mut sink, &buffer[..n]) => {
                if let Err(e) = written {
                    tracing::warn!(error = %e, "Error writing remote stdin");
                    exit_message.record(remote_io(format_args!("{} write: {}", Stream::Stdin, e)));
                    return PumpOutcome::Failed;
                }
            }
        }
    }
}

fn remote_io(detail: fmt::Arguments<'_>) -> String {
    SessionError::RemoteIo(detail.to_string()).to_string()
}

async fn write_chunk<W: AsyncWrite + Unpin + ?Sized>(sink: &mut W, data: &[u8]) -> std::io::Result<()> {
    sink.write_all(data).await?;
    sink.flush().await
}
