//! Loopback transport backed by a local PTY.
//!
//! The "remote" shell is a child process on the local host, attached to a
//! pseudo-terminal opened with `portable-pty`. Blocking PTY reads and writes
//! are bridged onto tokio duplex pipes so the session core sees the same
//! async stream endpoints it gets from [`crate::ssh`]. `wsm-shell --local`
//! selects it.

use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::error::{Result, TransportError};
use crate::types::{DialParams, ExitStatus, TerminalModes, WindowSize};
use crate::{BoxedReader, BoxedWriter, Channel, Connection, Transport};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the in-memory pipe between the PTY threads and the session.
const BRIDGE_CAPACITY: usize = 64 * 1024;

/// How often `wait` polls the child for an exit status.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Transport that only accepts loopback targets and runs the shell locally.
///
/// No credential check is performed beyond requiring a username: the
/// process already runs as the local user.
#[derive(Debug, Clone, Default)]
pub struct LocalTransport {
    shell: Option<String>,
}

impl LocalTransport {
    /// Creates a transport that runs `$SHELL` (or `/bin/sh`).
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a transport that runs the given shell.
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: Some(shell.into()),
        }
    }
}

impl Transport for LocalTransport {
    type Connection = LocalConnection;

    async fn dial(&self, params: &DialParams) -> Result<LocalConnection> {
        if !is_loopback(&params.host) {
            return Err(TransportError::Dial(format!(
                "{} is not a loopback address",
                params.address()
            )));
        }

        if params.username.is_empty() {
            return Err(TransportError::Auth("username is required".to_string()));
        }

        let shell = detect_shell(self.shell.clone());

        tracing::debug!(
            address = %params.address(),
            username = %params.username,
            shell = %shell,
            "Dialed loopback transport"
        );

        Ok(LocalConnection {
            shell,
            closed: AtomicBool::new(false),
        })
    }
}

/// A loopback connection. Each channel spawns its own shell.
pub struct LocalConnection {
    shell: String,
    closed: AtomicBool,
}

impl Connection for LocalConnection {
    type Channel = LocalChannel;

    async fn open_channel(&self) -> Result<LocalChannel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelOpen(
                "connection is closed".to_string(),
            ));
        }

        Ok(LocalChannel::new(self.shell.clone()))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

/// PTY handles owned by a channel.
#[derive(Default)]
struct PtyState {
    master: Option<Box<dyn MasterPty + Send>>,
    slave: Option<Box<dyn SlavePty + Send>>,
    term: String,
    stdin_taken: bool,
    stdout_taken: bool,
    stderr_taken: bool,
}

/// Session channel running a local shell on a PTY.
pub struct LocalChannel {
    shell: String,
    pty: Mutex<PtyState>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    closed: AtomicBool,
}

impl LocalChannel {
    fn new(shell: String) -> Self {
        Self {
            shell,
            pty: Mutex::new(PtyState::default()),
            child: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the process ID of the shell, if it has been started.
    pub fn pid(&self) -> Option<u32> {
        lock(&self.child).as_ref().and_then(|child| child.process_id())
    }
}

impl Channel for LocalChannel {
    async fn request_pty(&self, term: &str, size: WindowSize, _modes: &TerminalModes) -> Result<()> {
        let mut pty = lock(&self.pty);
        if pty.master.is_some() {
            return Err(TransportError::InvalidState("pty already allocated"));
        }

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| TransportError::PtyRequest(e.to_string()))?;

        pty.master = Some(pair.master);
        pty.slave = Some(pair.slave);
        pty.term = term.to_string();

        tracing::debug!(term = %term, size = %size, "Allocated local PTY");
        Ok(())
    }

    fn take_stdin(&self) -> Result<BoxedWriter> {
        let mut pty = lock(&self.pty);
        if pty.stdin_taken {
            return Err(TransportError::Stream("stdin already taken".to_string()));
        }
        let master = pty
            .master
            .as_ref()
            .ok_or(TransportError::InvalidState("pty not allocated"))?;
        let writer = master
            .take_writer()
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        let (session_end, bridge_end) = tokio::io::duplex(BRIDGE_CAPACITY);
        runtime.spawn(stdin_bridge(bridge_end, writer));
        pty.stdin_taken = true;

        Ok(Box::new(session_end))
    }

    fn take_stdout(&self) -> Result<BoxedReader> {
        let mut pty = lock(&self.pty);
        if pty.stdout_taken {
            return Err(TransportError::Stream("stdout already taken".to_string()));
        }
        let master = pty
            .master
            .as_ref()
            .ok_or(TransportError::InvalidState("pty not allocated"))?;
        let reader = master
            .try_clone_reader()
            .map_err(|e| TransportError::Stream(e.to_string()))?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Stream(e.to_string()))?;

        let (session_end, bridge_end) = tokio::io::duplex(BRIDGE_CAPACITY);
        runtime.spawn(stdout_bridge(reader, bridge_end));
        pty.stdout_taken = true;

        Ok(Box::new(session_end))
    }

    fn take_stderr(&self) -> Result<BoxedReader> {
        // A PTY merges stderr into stdout, so the separate endpoint is always at EOF.
        let mut pty = lock(&self.pty);
        if pty.stderr_taken {
            return Err(TransportError::Stream("stderr already taken".to_string()));
        }
        if pty.master.is_none() {
            return Err(TransportError::InvalidState("pty not allocated"));
        }
        pty.stderr_taken = true;

        Ok(Box::new(tokio::io::empty()))
    }

    async fn start_shell(&self) -> Result<()> {
        let mut pty = lock(&self.pty);
        let mut child = lock(&self.child);
        if child.is_some() {
            return Err(TransportError::InvalidState("shell already started"));
        }
        let slave = pty
            .slave
            .take()
            .ok_or(TransportError::InvalidState("pty not allocated"))?;

        let mut cmd = CommandBuilder::new(&self.shell);
        cmd.env("TERM", &pty.term);

        let spawned = slave
            .spawn_command(cmd)
            .map_err(|e| TransportError::Shell(e.to_string()))?;

        tracing::info!(
            shell = %self.shell,
            pid = ?spawned.process_id(),
            "Started local shell"
        );

        *child = Some(spawned);
        Ok(())
    }

    async fn resize(&self, size: WindowSize) -> Result<()> {
        let pty = lock(&self.pty);
        let master = pty
            .master
            .as_ref()
            .ok_or(TransportError::InvalidState("pty not allocated"))?;
        master
            .resize(pty_size(size))
            .map_err(|e| TransportError::Resize(e.to_string()))
    }

    async fn wait(&self) -> Result<ExitStatus> {
        loop {
            {
                let mut child = lock(&self.child);
                let child = child
                    .as_mut()
                    .ok_or(TransportError::InvalidState("shell not started"))?;
                match child.try_wait() {
                    Ok(Some(status)) => return Ok(ExitStatus::from_code(status.exit_code())),
                    Ok(None) => {}
                    Err(e) => return Err(TransportError::Wait(e.to_string())),
                }
            }

            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Wait(
                    "channel closed before the shell exited".to_string(),
                ));
            }

            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let killed = match lock(&self.child).as_mut() {
            Some(child) => {
                if matches!(child.try_wait(), Ok(None)) {
                    child.kill()
                } else {
                    Ok(())
                }
            }
            None => Ok(()),
        };

        // Dropping the master hangs up the PTY so the bridge threads unwind,
        // even when the kill failed.
        let mut pty = lock(&self.pty);
        pty.master = None;
        pty.slave = None;

        if let Err(e) = &killed {
            tracing::warn!(error = %e, "Failed to kill local shell");
        }
        killed.map_err(TransportError::from)
    }
}

/// Copies bytes written by the session into the blocking PTY writer.
async fn stdin_bridge(mut pipe: DuplexStream, writer: Box<dyn Write + Send>) {
    let writer = Arc::new(Mutex::new(writer));
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match pipe.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(error = %e, "PTY stdin bridge read failed");
                break;
            }
        };

        let chunk = buffer[..n].to_vec();
        let writer = Arc::clone(&writer);
        let result = tokio::task::spawn_blocking(move || {
            let mut writer = lock(&writer);
            writer.write_all(&chunk)?;
            writer.flush()
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "PTY write failed");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "PTY write task panicked");
                break;
            }
        }
    }
}

/// Copies PTY output into the pipe read by the session.
async fn stdout_bridge(reader: Box<dyn Read + Send>, mut pipe: DuplexStream) {
    let reader = Arc::new(Mutex::new(reader));

    loop {
        let reader = Arc::clone(&reader);
        let result = tokio::task::spawn_blocking(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            let mut reader = lock(&reader);
            match reader.read(&mut buffer) {
                Ok(0) => Ok(None),
                Ok(n) => {
                    buffer.truncate(n);
                    Ok(Some(buffer))
                }
                Err(e) => Err(e),
            }
        })
        .await;

        match result {
            Ok(Ok(Some(data))) => {
                if pipe.write_all(&data).await.is_err() {
                    tracing::trace!("Session dropped PTY output pipe");
                    break;
                }
            }
            Ok(Ok(None)) => break,
            // Linux reports EIO on the master once the slave side hangs up.
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "PTY read ended");
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "PTY read task panicked");
                break;
            }
        }
    }

    let _ = pipe.shutdown().await;
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn is_loopback(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credential;
    use tokio::time::timeout;

    fn params(host: &str, username: &str) -> DialParams {
        DialParams {
            host: host.to_string(),
            port: 22,
            username: username.to_string(),
            credential: Credential::password("x"),
        }
    }

    #[test]
    fn test_is_loopback() {
        assert!(is_loopback("localhost"));
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("[::1]"));
        assert!(!is_loopback("10.0.0.5"));
        assert!(!is_loopback("example.com"));
    }

    #[test]
    fn test_detect_shell_with_provided() {
        assert_eq!(detect_shell(Some("/bin/bash".to_string())), "/bin/bash");
    }

    #[tokio::test]
    async fn test_dial_rejects_remote_host() {
        let result = LocalTransport::new().dial(&params("10.0.0.5", "ops")).await;
        assert!(matches!(result, Err(TransportError::Dial(_))));
    }

    #[tokio::test]
    async fn test_dial_requires_username() {
        let result = LocalTransport::new().dial(&params("127.0.0.1", "")).await;
        assert!(matches!(result, Err(TransportError::Auth(_))));
    }

    #[tokio::test]
    async fn test_connection_close_twice() {
        let conn = LocalTransport::new()
            .dial(&params("localhost", "ops"))
            .await
            .unwrap();
        assert!(conn.close().await.is_ok());
        assert!(matches!(conn.close().await, Err(TransportError::Closed)));
        assert!(matches!(
            conn.open_channel().await,
            Err(TransportError::ChannelOpen(_))
        ));
    }

    #[tokio::test]
    async fn test_streams_require_pty() {
        let conn = LocalTransport::new()
            .dial(&params("localhost", "ops"))
            .await
            .unwrap();
        let channel = conn.open_channel().await.unwrap();
        assert!(matches!(
            channel.take_stdout(),
            Err(TransportError::InvalidState(_))
        ));
        assert!(matches!(
            channel.start_shell().await,
            Err(TransportError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_shell_exit_status() {
        let conn = LocalTransport::with_shell("/bin/sh")
            .dial(&params("localhost", "ops"))
            .await
            .unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .request_pty("xterm-256color", WindowSize::new(80, 24), &TerminalModes::new())
            .await
            .unwrap();

        let mut stdin = channel.take_stdin().unwrap();
        let _stdout = channel.take_stdout().unwrap();
        assert!(matches!(
            channel.take_stdout(),
            Err(TransportError::Stream(_))
        ));
        channel.start_shell().await.unwrap();
        assert!(channel.pid().is_some());

        channel.resize(WindowSize::new(120, 40)).await.unwrap();
        stdin.write_all(b"exit 3\n").await.unwrap();

        let status = timeout(Duration::from_secs(5), channel.wait())
            .await
            .expect("shell did not exit")
            .unwrap();
        assert_eq!(status.code, Some(3));

        assert!(channel.close().await.is_ok());
        assert!(matches!(channel.close().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_close_hangs_up_running_shell() {
        let conn = LocalTransport::with_shell("/bin/sh")
            .dial(&params("localhost", "ops"))
            .await
            .unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .request_pty("xterm-256color", WindowSize::new(80, 24), &TerminalModes::new())
            .await
            .unwrap();
        let _stdin = channel.take_stdin().unwrap();
        let mut stdout = channel.take_stdout().unwrap();
        channel.start_shell().await.unwrap();

        let _ = channel.close().await;

        // The master is released, so the output bridge reaches EOF.
        let mut drained = Vec::new();
        timeout(Duration::from_secs(5), stdout.read_to_end(&mut drained))
            .await
            .expect("output bridge did not unwind")
            .unwrap();
        assert!(lock(&channel.pty).master.is_none());
        assert!(matches!(channel.close().await, Err(TransportError::Closed)));
    }
}
