//! Mock transport for testing without a real remote host.
//!
//! Provides in-memory duplex pipes behind the transport traits, plus a
//! [`MockRemote`] handle through which a test plays the remote side:
//! reading what the session sends to stdin, producing stdout/stderr,
//! and finishing the remote process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::io::DuplexStream;
use tokio::sync::watch;

use crate::error::{Result, TransportError};
use crate::types::{DialParams, ExitStatus, TerminalModes, WindowSize};
use crate::{BoxedReader, BoxedWriter, Channel, Connection, Transport};

/// Capacity of each in-memory pipe.
const PIPE_CAPACITY: usize = 16 * 1024;

/// Operations a test can make fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    Dial,
    Auth,
    ChannelOpen,
    Pty,
    Stdin,
    Stdout,
    Stderr,
    Shell,
    Resize,
    ChannelClose,
    ConnectionClose,
}

/// Counters and recorded requests, snapshotted by [`MockTransport::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub dials: usize,
    pub channels_opened: usize,
    pub pty_requests: Vec<(String, WindowSize)>,
    pub shells_started: usize,
    pub resizes: Vec<WindowSize>,
    pub channel_close_calls: usize,
    pub connection_close_calls: usize,
    /// Connections dialed and not yet closed.
    pub open_connections: usize,
    /// Channels opened and not yet closed.
    pub open_channels: usize,
    pub last_dial: Option<(String, u16, String)>,
}

#[derive(Default)]
struct Shared {
    faults: HashSet<Fault>,
    stats: MockStats,
    remote: Option<MockRemote>,
}

/// Scriptable transport. Clones share state, so a test keeps one clone
/// while the session owns the other.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the given operation fail from now on.
    pub fn fail(self, fault: Fault) -> Self {
        lock(&self.shared).faults.insert(fault);
        self
    }

    /// Returns a snapshot of the recorded activity.
    pub fn stats(&self) -> MockStats {
        lock(&self.shared).stats.clone()
    }

    /// Takes the remote side of the most recently opened channel.
    pub fn take_remote(&self) -> Option<MockRemote> {
        lock(&self.shared).remote.take()
    }

    fn faulty(&self, fault: Fault) -> bool {
        lock(&self.shared).faults.contains(&fault)
    }
}

impl Transport for MockTransport {
    type Connection = MockConnection;

    async fn dial(&self, params: &DialParams) -> Result<MockConnection> {
        let mut shared = lock(&self.shared);
        shared.stats.dials += 1;
        shared.stats.last_dial = Some((
            params.host.clone(),
            params.port,
            params.username.clone(),
        ));

        if shared.faults.contains(&Fault::Dial) {
            return Err(TransportError::Dial(format!(
                "connection refused: {}",
                params.address()
            )));
        }
        if shared.faults.contains(&Fault::Auth) {
            return Err(TransportError::Auth(
                "unable to authenticate, attempted methods [none password]".to_string(),
            ));
        }

        shared.stats.open_connections += 1;
        Ok(MockConnection {
            transport: self.clone(),
            closed: Mutex::new(false),
        })
    }
}

/// Connection half of the mock.
pub struct MockConnection {
    transport: MockTransport,
    closed: Mutex<bool>,
}

impl Connection for MockConnection {
    type Channel = MockChannel;

    async fn open_channel(&self) -> Result<MockChannel> {
        if *lock(&self.closed) {
            return Err(TransportError::ChannelOpen("connection is closed".to_string()));
        }
        if self.transport.faulty(Fault::ChannelOpen) {
            return Err(TransportError::ChannelOpen(
                "administratively prohibited".to_string(),
            ));
        }

        let (channel, remote) = MockChannel::pair(self.transport.clone());
        let mut shared = lock(&self.transport.shared);
        shared.stats.channels_opened += 1;
        shared.stats.open_channels += 1;
        shared.remote = Some(remote);

        Ok(channel)
    }

    async fn close(&self) -> Result<()> {
        let mut closed = lock(&self.closed);
        let mut shared = lock(&self.transport.shared);
        shared.stats.connection_close_calls += 1;
        if *closed {
            return Err(TransportError::Closed);
        }
        *closed = true;
        shared.stats.open_connections -= 1;

        if shared.faults.contains(&Fault::ConnectionClose) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "connection reset while closing",
            )));
        }
        Ok(())
    }
}

/// How the simulated remote process ends.
type ExitOutcome = std::result::Result<ExitStatus, String>;

/// Channel half of the mock.
pub struct MockChannel {
    transport: MockTransport,
    stdin: Mutex<Option<DuplexStream>>,
    stdout: Mutex<Option<DuplexStream>>,
    stderr: Mutex<Option<DuplexStream>>,
    pty: Mutex<bool>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    closed_tx: watch::Sender<bool>,
}

impl MockChannel {
    fn pair(transport: MockTransport) -> (Self, MockRemote) {
        let (stdin_session, stdin_remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_session, stdout_remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_session, stderr_remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (closed_tx, _) = watch::channel(false);

        let channel = Self {
            transport,
            stdin: Mutex::new(Some(stdin_session)),
            stdout: Mutex::new(Some(stdout_session)),
            stderr: Mutex::new(Some(stderr_session)),
            pty: Mutex::new(false),
            exit_rx,
            closed_tx,
        };
        let remote = MockRemote {
            stdin: stdin_remote,
            stdout: Some(stdout_remote),
            stderr: Some(stderr_remote),
            exit: exit_tx,
        };
        (channel, remote)
    }

    fn take_stream(
        &self,
        slot: &Mutex<Option<DuplexStream>>,
        fault: Fault,
        name: &str,
    ) -> Result<DuplexStream> {
        if !*lock(&self.pty) {
            return Err(TransportError::InvalidState("pty not allocated"));
        }
        if self.transport.faulty(fault) {
            return Err(TransportError::Stream(format!("{} pipe unavailable", name)));
        }
        lock(slot)
            .take()
            .ok_or_else(|| TransportError::Stream(format!("{} already taken", name)))
    }

    fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

impl Channel for MockChannel {
    async fn request_pty(&self, term: &str, size: WindowSize, _modes: &TerminalModes) -> Result<()> {
        let mut shared = lock(&self.transport.shared);
        shared.stats.pty_requests.push((term.to_string(), size));
        if shared.faults.contains(&Fault::Pty) {
            return Err(TransportError::PtyRequest("pty allocation denied".to_string()));
        }
        *lock(&self.pty) = true;
        Ok(())
    }

    fn take_stdin(&self) -> Result<BoxedWriter> {
        Ok(Box::new(self.take_stream(&self.stdin, Fault::Stdin, "stdin")?))
    }

    fn take_stdout(&self) -> Result<BoxedReader> {
        Ok(Box::new(self.take_stream(&self.stdout, Fault::Stdout, "stdout")?))
    }

    fn take_stderr(&self) -> Result<BoxedReader> {
        Ok(Box::new(self.take_stream(&self.stderr, Fault::Stderr, "stderr")?))
    }

    async fn start_shell(&self) -> Result<()> {
        if !*lock(&self.pty) {
            return Err(TransportError::InvalidState("pty not allocated"));
        }
        let mut shared = lock(&self.transport.shared);
        if shared.faults.contains(&Fault::Shell) {
            return Err(TransportError::Shell("exec request failed".to_string()));
        }
        shared.stats.shells_started += 1;
        Ok(())
    }

    async fn resize(&self, size: WindowSize) -> Result<()> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut shared = lock(&self.transport.shared);
        if shared.faults.contains(&Fault::Resize) {
            return Err(TransportError::Resize("window-change rejected".to_string()));
        }
        shared.stats.resizes.push(size);
        Ok(())
    }

    async fn wait(&self) -> Result<ExitStatus> {
        let mut exit = self.exit_rx.clone();
        let mut closed = self.closed_tx.subscribe();

        loop {
            let outcome = exit.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome.map_err(TransportError::Wait);
            }
            if *closed.borrow_and_update() {
                return Err(TransportError::Wait("channel closed".to_string()));
            }

            tokio::select! {
                changed = exit.changed() => {
                    if changed.is_err() {
                        return Err(TransportError::Wait("remote side went away".to_string()));
                    }
                }
                _ = closed.changed() => {}
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut shared = lock(&self.transport.shared);
        shared.stats.channel_close_calls += 1;
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.closed_tx.send_replace(true);
        shared.stats.open_channels -= 1;

        if shared.faults.contains(&Fault::ChannelClose) {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "channel reset while closing",
            )));
        }
        Ok(())
    }
}

/// The remote side of a mock channel, driven by the test.
pub struct MockRemote {
    /// Receives everything the session writes to remote stdin.
    pub stdin: DuplexStream,
    /// Feeds the session's stdout pump. Drop it (or call
    /// [`MockRemote::close_output`]) to signal EOF.
    pub stdout: Option<DuplexStream>,
    /// Feeds the session's stderr pump.
    pub stderr: Option<DuplexStream>,
    exit: watch::Sender<Option<ExitOutcome>>,
}

impl MockRemote {
    /// Closes remote stdout and stderr.
    pub fn close_output(&mut self) {
        self.stdout = None;
        self.stderr = None;
    }

    /// Ends the remote process with the given status.
    pub fn finish(&self, status: ExitStatus) {
        self.exit.send_replace(Some(Ok(status)));
    }

    /// Makes the pending wait fail with the given detail.
    pub fn fail_wait(&self, detail: impl Into<String>) {
        self.exit.send_replace(Some(Err(detail.into())));
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credential;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn params() -> DialParams {
        DialParams {
            host: "10.0.0.5".to_string(),
            port: 22,
            username: "ops".to_string(),
            credential: Credential::password("x"),
        }
    }

    #[tokio::test]
    async fn test_auth_fault() {
        let transport = MockTransport::new().fail(Fault::Auth);
        let result = transport.dial(&params()).await;
        assert!(matches!(result, Err(TransportError::Auth(_))));
        assert_eq!(transport.stats().open_connections, 0);
    }

    #[tokio::test]
    async fn test_stream_round_trip() {
        let transport = MockTransport::new();
        let conn = transport.dial(&params()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        channel
            .request_pty("vt100", WindowSize::new(80, 24), &TerminalModes::new())
            .await
            .unwrap();

        let mut stdin = channel.take_stdin().unwrap();
        let mut stdout = channel.take_stdout().unwrap();
        let mut remote = transport.take_remote().unwrap();

        stdin.write_all(b"ls\n").await.unwrap();
        let mut buf = [0u8; 3];
        remote.stdin.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        remote.stdout.as_mut().unwrap().write_all(b"ok").await.unwrap();
        remote.close_output();
        let mut out = Vec::new();
        stdout.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ok");
    }

    #[tokio::test]
    async fn test_wait_resolves_on_finish_and_close() {
        let transport = MockTransport::new();
        let conn = transport.dial(&params()).await.unwrap();
        let channel = conn.open_channel().await.unwrap();
        let remote = transport.take_remote().unwrap();

        remote.finish(ExitStatus::from_code(7));
        assert_eq!(channel.wait().await.unwrap().code, Some(7));

        let second = conn.open_channel().await.unwrap();
        second.close().await.unwrap();
        assert!(matches!(second.wait().await, Err(TransportError::Wait(_))));
        assert!(matches!(second.close().await, Err(TransportError::Closed)));
    }
}
