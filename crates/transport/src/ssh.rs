//! SSH transport backed by `russh`.
//!
//! Dials `host:port`, authenticates with a password and opens session
//! channels. Each channel is driven by one owner task that holds the
//! `russh` channel and multiplexes three things onto it:
//!
//! - requests from the session (pty, shell, window change, close)
//! - bytes written to the stdin pipe
//! - messages from the server (output, exit status, replies, close)
//!
//! Host keys are accepted without verification and the server's
//! pre-auth banner is written to stderr.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::{ChannelMsg, Disconnect, Pty};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{Result, TransportError};
use crate::types::{DialParams, ExitStatus, TerminalModes, WindowSize};
use crate::{BoxedReader, BoxedWriter, Channel, Connection, Transport};

/// Capacity of each pipe between the owner task and the session.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Read size for forwarding stdin to the channel.
const STDIN_CHUNK: usize = 4096;

/// Extended-data type code for stderr.
const SSH_EXTENDED_DATA_STDERR: u32 = 1;

/// Connection tunables.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Limit on TCP connect, key exchange and authentication together.
    pub connect_timeout: Duration,
    /// Keepalive interval; `None` disables keepalives.
    pub keepalive_interval: Option<Duration>,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

/// Password-authenticated SSH transport.
#[derive(Debug, Clone, Default)]
pub struct SshTransport {
    options: SshOptions,
}

impl SshTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: SshOptions) -> Self {
        Self { options }
    }

    fn client_config(&self) -> client::Config {
        client::Config {
            keepalive_interval: self.options.keepalive_interval,
            keepalive_max: 3,
            ..Default::default()
        }
    }
}

/// Client-side callbacks.
struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        tracing::debug!("Accepting server host key without verification");
        Ok(true)
    }

    async fn auth_banner(
        &mut self,
        banner: &str,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        eprint!("{}", banner);
        Ok(())
    }
}

impl Transport for SshTransport {
    type Connection = SshConnection;

    async fn dial(&self, params: &DialParams) -> Result<SshConnection> {
        let address = params.address();
        let config = Arc::new(self.client_config());
        let timeout = self.options.connect_timeout;

        let connect = async {
            let mut handle = client::connect(config, address.as_str(), ClientHandler)
                .await
                .map_err(|e| TransportError::Dial(format!("{}: {}", address, e)))?;

            let accepted = handle
                .authenticate_password(params.username.as_str(), params.credential.expose())
                .await
                .map_err(|e| TransportError::Auth(e.to_string()))?;
            password_accepted(accepted, &params.username)?;

            Ok::<_, TransportError>(handle)
        };

        let handle = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                TransportError::Dial(format!(
                    "{}: timed out after {}s",
                    address,
                    timeout.as_secs()
                ))
            })??;

        tracing::info!(address = %address, username = %params.username, "SSH connection established");

        Ok(SshConnection {
            handle: tokio::sync::Mutex::new(handle),
            closed: AtomicBool::new(false),
        })
    }
}

fn password_accepted(accepted: bool, username: &str) -> Result<()> {
    if accepted {
        Ok(())
    } else {
        Err(TransportError::Auth(format!(
            "unable to authenticate {}, attempted methods [password]",
            username
        )))
    }
}

/// An authenticated SSH connection.
pub struct SshConnection {
    handle: tokio::sync::Mutex<Handle<ClientHandler>>,
    closed: AtomicBool,
}

impl Connection for SshConnection {
    type Channel = SshChannel;

    async fn open_channel(&self) -> Result<SshChannel> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ChannelOpen(
                "connection is closed".to_string(),
            ));
        }

        let channel = self
            .handle
            .lock()
            .await
            .channel_open_session()
            .await
            .map_err(|e| TransportError::ChannelOpen(e.to_string()))?;

        Ok(SshChannel::spawn(channel))
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        self.handle
            .lock()
            .await
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))
    }
}

/// Requests forwarded to the channel owner task.
enum Command {
    RequestPty {
        term: String,
        size: WindowSize,
        modes: Vec<(Pty, u32)>,
        reply: oneshot::Sender<bool>,
    },
    Shell {
        reply: oneshot::Sender<bool>,
    },
    WindowChange {
        size: WindowSize,
        reply: oneshot::Sender<std::result::Result<(), String>>,
    },
    Close,
}

type ExitOutcome = std::result::Result<ExitStatus, String>;

/// Session-side stream endpoints, taken once each.
#[derive(Default)]
struct Endpoints {
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
}

/// A session channel on an SSH connection.
pub struct SshChannel {
    commands: mpsc::UnboundedSender<Command>,
    endpoints: Mutex<Endpoints>,
    pty: AtomicBool,
    closed: AtomicBool,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
}

impl SshChannel {
    fn spawn(channel: russh::Channel<Msg>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (stdin_session, stdin_owner) = tokio::io::duplex(PIPE_CAPACITY);
        let (stdout_session, stdout_owner) = tokio::io::duplex(PIPE_CAPACITY);
        let (stderr_session, stderr_owner) = tokio::io::duplex(PIPE_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(drive_channel(
            channel,
            command_rx,
            OwnerPipes {
                stdin: stdin_owner,
                stdout: Some(stdout_owner),
                stderr: Some(stderr_owner),
            },
            exit_tx,
        ));

        Self {
            commands,
            endpoints: Mutex::new(Endpoints {
                stdin: Some(stdin_session),
                stdout: Some(stdout_session),
                stderr: Some(stderr_session),
            }),
            pty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            exit_rx,
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| TransportError::InvalidState("channel owner has stopped"))
    }

    fn take(
        &self,
        pick: impl FnOnce(&mut Endpoints) -> &mut Option<DuplexStream>,
        name: &str,
    ) -> Result<DuplexStream> {
        if !self.pty.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("pty not allocated"));
        }
        let mut endpoints = lock(&self.endpoints);
        pick(&mut endpoints)
            .take()
            .ok_or_else(|| TransportError::Stream(format!("{} already taken", name)))
    }
}

impl Channel for SshChannel {
    async fn request_pty(&self, term: &str, size: WindowSize, modes: &TerminalModes) -> Result<()> {
        let (reply, accepted) = oneshot::channel();
        self.send(Command::RequestPty {
            term: term.to_string(),
            size,
            modes: pty_modes(modes),
            reply,
        })?;

        match accepted.await {
            Ok(true) => {
                self.pty.store(true, Ordering::SeqCst);
                Ok(())
            }
            Ok(false) => Err(TransportError::PtyRequest(
                "server refused the pty request".to_string(),
            )),
            Err(_) => Err(TransportError::PtyRequest(
                "channel closed before the server replied".to_string(),
            )),
        }
    }

    fn take_stdin(&self) -> Result<BoxedWriter> {
        Ok(Box::new(self.take(|e| &mut e.stdin, "stdin")?))
    }

    fn take_stdout(&self) -> Result<BoxedReader> {
        Ok(Box::new(self.take(|e| &mut e.stdout, "stdout")?))
    }

    fn take_stderr(&self) -> Result<BoxedReader> {
        Ok(Box::new(self.take(|e| &mut e.stderr, "stderr")?))
    }

    async fn start_shell(&self) -> Result<()> {
        if !self.pty.load(Ordering::SeqCst) {
            return Err(TransportError::InvalidState("pty not allocated"));
        }
        let (reply, accepted) = oneshot::channel();
        self.send(Command::Shell { reply })?;

        match accepted.await {
            Ok(true) => Ok(()),
            Ok(false) => Err(TransportError::Shell(
                "server refused the shell request".to_string(),
            )),
            Err(_) => Err(TransportError::Shell(
                "channel closed before the server replied".to_string(),
            )),
        }
    }

    async fn resize(&self, size: WindowSize) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let (reply, sent) = oneshot::channel();
        self.send(Command::WindowChange { size, reply })?;

        sent.await
            .map_err(|_| TransportError::Resize("channel closed".to_string()))?
            .map_err(TransportError::Resize)
    }

    async fn wait(&self) -> Result<ExitStatus> {
        let mut exit = self.exit_rx.clone();
        let outcome = exit
            .wait_for(Option::is_some)
            .await
            .map(|outcome| (*outcome).clone())
            .map_err(|_| TransportError::Wait("channel owner went away".to_string()))?;

        match outcome {
            Some(outcome) => outcome.map_err(TransportError::Wait),
            None => Err(TransportError::Wait("no exit status".to_string())),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        // The owner may already have stopped after a server-side close.
        let _ = self.commands.send(Command::Close);
        Ok(())
    }
}

/// The owner task's ends of the stream pipes.
struct OwnerPipes {
    stdin: DuplexStream,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
}

/// Owns the `russh` channel until either side closes it.
async fn drive_channel(
    mut channel: russh::Channel<Msg>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut pipes: OwnerPipes,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
) {
    let mut pending: VecDeque<oneshot::Sender<bool>> = VecDeque::new();
    let mut stdin_open = true;
    let mut code: Option<u32> = None;
    let mut signal: Option<String> = None;
    let mut buffer = vec![0u8; STDIN_CHUNK];

    let outcome = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Close) | None => {
                    if let Err(e) = channel.close().await {
                        tracing::debug!(error = %e, "SSH channel close failed");
                    }
                    break Err("channel closed".to_string());
                }
                Some(command) => handle_command(&mut channel, command, &mut pending).await,
            },
            read = pipes.stdin.read(&mut buffer), if stdin_open => match read {
                Ok(0) => {
                    stdin_open = false;
                    if let Err(e) = channel.eof().await {
                        tracing::debug!(error = %e, "Failed to send EOF");
                    }
                }
                Ok(n) => {
                    if let Err(e) = channel.data(&buffer[..n]).await {
                        tracing::warn!(error = %e, "Failed to send stdin data");
                        stdin_open = false;
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Stdin pipe failed");
                    stdin_open = false;
                }
            },
            message = channel.wait() => match message {
                Some(ChannelMsg::Data { data }) => {
                    forward(&mut pipes.stdout, &data, "stdout").await;
                }
                Some(ChannelMsg::ExtendedData { data, ext }) if ext == SSH_EXTENDED_DATA_STDERR => {
                    forward(&mut pipes.stderr, &data, "stderr").await;
                }
                Some(ChannelMsg::Success) => reply(&mut pending, true),
                Some(ChannelMsg::Failure) => reply(&mut pending, false),
                Some(ChannelMsg::ExitStatus { exit_status }) => code = Some(exit_status),
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    signal = Some(format!("{:?}", signal_name));
                }
                Some(ChannelMsg::Eof) => {
                    pipes.stdout = None;
                    pipes.stderr = None;
                }
                Some(ChannelMsg::Close) | None => break exit_outcome(code, signal.take()),
                Some(_) => {}
            },
        }
    };

    // Dropping the output pipes gives the session EOF; dropping the
    // pending senders fails any request still awaiting a reply.
    drop(pipes);
    drop(pending);

    tracing::debug!(outcome = ?outcome, "SSH channel finished");
    exit_tx.send_replace(Some(outcome));
}

async fn handle_command(
    channel: &mut russh::Channel<Msg>,
    command: Command,
    pending: &mut VecDeque<oneshot::Sender<bool>>,
) {
    match command {
        Command::RequestPty {
            term,
            size,
            modes,
            reply,
        } => {
            let sent = channel
                .request_pty(
                    true,
                    &term,
                    u32::from(size.cols),
                    u32::from(size.rows),
                    0,
                    0,
                    &modes,
                )
                .await;
            queue_reply(sent, reply, pending);
        }
        Command::Shell { reply } => {
            let sent = channel.request_shell(true).await;
            queue_reply(sent, reply, pending);
        }
        Command::WindowChange { size, reply } => {
            let sent = channel
                .window_change(u32::from(size.cols), u32::from(size.rows), 0, 0)
                .await
                .map_err(|e| e.to_string());
            let _ = reply.send(sent);
        }
        Command::Close => {}
    }
}

/// Replies to want-reply requests arrive in request order.
fn queue_reply(
    sent: std::result::Result<(), russh::Error>,
    reply: oneshot::Sender<bool>,
    pending: &mut VecDeque<oneshot::Sender<bool>>,
) {
    match sent {
        Ok(()) => pending.push_back(reply),
        Err(e) => {
            tracing::debug!(error = %e, "Channel request could not be sent");
            let _ = reply.send(false);
        }
    }
}

fn reply(pending: &mut VecDeque<oneshot::Sender<bool>>, accepted: bool) {
    match pending.pop_front() {
        Some(waiter) => {
            let _ = waiter.send(accepted);
        }
        None => tracing::debug!(accepted, "Unsolicited channel reply"),
    }
}

async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8], stream: &str) {
    let Some(writer) = pipe.as_mut() else {
        return;
    };
    if writer.write_all(data).await.is_err() {
        tracing::trace!(stream, "Session dropped output pipe");
        *pipe = None;
    }
}

/// Maps what the server reported before closing onto an exit outcome.
fn exit_outcome(code: Option<u32>, signal: Option<String>) -> ExitOutcome {
    match (code, signal) {
        (_, Some(signal)) => Ok(ExitStatus::from_signal(signal)),
        (Some(code), None) => Ok(ExitStatus::from_code(code)),
        (None, None) => Err("remote command exited without exit status or exit signal".to_string()),
    }
}

fn pty_modes(modes: &TerminalModes) -> Vec<(Pty, u32)> {
    modes
        .iter()
        .filter_map(|&(opcode, value)| match Pty::from_u8(opcode) {
            Some(pty) => Some((pty, value)),
            None => {
                tracing::debug!(opcode, "Skipping unknown terminal mode");
                None
            }
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credential;

    fn params(port: u16) -> DialParams {
        DialParams {
            host: "127.0.0.1".to_string(),
            port,
            username: "ops".to_string(),
            credential: Credential::password("x"),
        }
    }

    #[test]
    fn test_rejected_password_is_auth_error() {
        assert!(password_accepted(true, "ops").is_ok());
        let err = password_accepted(false, "ops").unwrap_err();
        assert!(matches!(err, TransportError::Auth(_)));
        assert!(err.to_string().contains("[password]"));
    }

    #[test]
    fn test_exit_outcome() {
        assert_eq!(exit_outcome(Some(0), None), Ok(ExitStatus::from_code(0)));
        assert_eq!(
            exit_outcome(Some(1), Some("TERM".to_string())),
            Ok(ExitStatus::from_signal("TERM"))
        );
        assert!(exit_outcome(None, None).is_err());
    }

    #[test]
    fn test_pty_modes_skip_unknown_opcodes() {
        let mut modes = TerminalModes::new();
        // ECHO, then an opcode outside the defined range.
        modes.set(53, 1).set(250, 7);
        let converted = pty_modes(&modes);
        assert_eq!(converted.len(), 1);
        assert_eq!(converted[0].1, 1);
    }

    #[tokio::test]
    async fn test_dial_refused_port_is_dial_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = SshTransport::new().dial(&params(port)).await;
        assert!(matches!(result, Err(TransportError::Dial(_))));
    }

    #[tokio::test]
    async fn test_dial_non_ssh_peer_is_dial_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = socket.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
            }
        });

        let transport = SshTransport::with_options(SshOptions {
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: None,
        });
        let result = transport.dial(&params(port)).await;
        assert!(matches!(result, Err(TransportError::Dial(_))));
    }
}
