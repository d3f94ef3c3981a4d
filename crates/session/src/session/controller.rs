//! Session controller.
//!
//! A [`TerminalSession`] owns one transport connection and one remote
//! channel. `connect` dials, puts the local terminal into raw mode,
//! requests a pty, starts the shell and spawns the background tasks:
//! three byte pumps, the resize listener and the remote-wait watcher.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use transport::{
    BoxedReader, BoxedWriter, Channel, Connection, ExitStatus, TerminalModes, Transport,
    WindowSize,
};

use super::lifecycle::{self, SessionCore, Trigger};
use super::multiplexer::{self, Stream};
use super::state::SessionState;
use crate::config::{Config, ConfigError, SessionConfig};
use crate::error::{Result, SessionError};
use crate::terminal::{resize, LocalTerminal, RawModeGuard, ResizeEvents};

/// The caller's standard streams. The session takes the boxed endpoints;
/// the underlying process handles stay with the caller.
pub struct Stdio {
    pub input: BoxedReader,
    pub output: BoxedWriter,
    pub error: BoxedWriter,
}

impl Stdio {
    pub fn new(input: BoxedReader, output: BoxedWriter, error: BoxedWriter) -> Self {
        Self {
            input,
            output,
            error,
        }
    }

    /// The current process's stdin, stdout and stderr.
    pub fn inherit() -> Self {
        Self {
            input: Box::new(tokio::io::stdin()),
            output: Box::new(tokio::io::stdout()),
            error: Box::new(tokio::io::stderr()),
        }
    }
}

/// Remote stream endpoints acquired during connect.
struct RemoteStreams {
    stdin: BoxedWriter,
    stdout: BoxedReader,
    stderr: BoxedReader,
}

/// An interactive shell session over a transport connection.
pub struct TerminalSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    settings: Config,
    stdio: std::sync::Mutex<Option<Stdio>>,
    local_terminal: Option<Arc<dyn LocalTerminal>>,
    core: Arc<SessionCore<T::Connection>>,
}

impl<T: Transport> TerminalSession<T> {
    /// Creates an idle session. Nothing is acquired until [`connect`](Self::connect).
    pub fn new(transport: T, config: SessionConfig, stdio: Stdio) -> Self {
        let core = Arc::new(SessionCore::new(config.window_size()));
        Self {
            transport,
            config,
            settings: Config::default(),
            stdio: std::sync::Mutex::new(Some(stdio)),
            local_terminal: None,
            core,
        }
    }

    /// Uses the given tunables instead of the defaults.
    pub fn with_settings(mut self, settings: Config) -> Self {
        self.settings = settings;
        self
    }

    /// Attaches the terminal to hold in raw mode and watch for resizes.
    pub fn with_local_terminal(mut self, terminal: Arc<dyn LocalTerminal>) -> Self {
        self.local_terminal = Some(terminal);
        self
    }

    /// Creates a session and connects it.
    pub async fn open(transport: T, config: SessionConfig, stdio: Stdio) -> Result<Self> {
        let mut session = Self::new(transport, config, stdio);
        session.connect().await?;
        Ok(session)
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.core.state.get()
    }

    /// Returns the recorded exit message, if any pump or the remote side failed.
    pub fn exit_message(&self) -> Option<String> {
        self.core.exit_message.get().map(str::to_string)
    }

    /// Returns the last window size sent to the remote pty.
    pub fn window_size(&self) -> WindowSize {
        self.core.window_size()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Number of pumps and listeners still running.
    pub fn active_tasks(&self) -> usize {
        self.core.tasks.len()
    }

    /// Establishes the session and returns once the shell is running.
    ///
    /// On failure every acquired resource is released and the session
    /// ends in [`SessionState::Failed`].
    pub async fn connect(&mut self) -> Result<()> {
        if self.state() != SessionState::Idle {
            return Err(SessionError::AlreadyConnected);
        }
        let stdio = self
            .stdio
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
            .ok_or(SessionError::AlreadyConnected)?;

        match self.establish(stdio).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.core.abort_connect(&e).await;
                Err(e)
            }
        }
    }

    async fn establish(&mut self, stdio: Stdio) -> Result<()> {
        let core = Arc::clone(&self.core);

        self.config.validate()?;
        self.settings.validate()?;
        advance(&core, SessionState::Dialing)?;

        let params = self.config.dial_params();
        info!(
            host = %params.host,
            port = params.port,
            username = %params.username,
            "Dialing remote host"
        );

        let connection = self
            .transport
            .dial(&params)
            .await
            .map_err(SessionError::from_dial)?;
        let connection = core.connection.get_or_init(|| connection);

        let channel = connection
            .open_channel()
            .await
            .map_err(SessionError::ChannelOpen)?;
        let channel = Arc::clone(core.channel.get_or_init(|| Arc::new(channel)));

        if let Some(terminal) = &self.local_terminal {
            core.hold_raw_mode(RawModeGuard::acquire(Arc::clone(terminal))?);
        }

        // Subscribe before the pty request so a window change made while
        // the shell starts is still delivered.
        let resize_events = self.local_terminal.as_ref().and_then(|terminal| {
            terminal
                .resize_events()
                .map_err(|e| warn!(error = %e, "Window-change notifications unavailable"))
                .ok()
        });

        let term = self.settings.terminal.resolve_term_type();
        let size = self.config.window_size();
        channel
            .request_pty(&term, size, &TerminalModes::new())
            .await
            .map_err(SessionError::PtyRequest)?;
        advance(&core, SessionState::PtyRequested)?;
        debug!(term = %term, size = %size, "Remote pty allocated");

        let remote = acquire_streams(channel.as_ref())?;

        channel
            .start_shell()
            .await
            .map_err(SessionError::ShellStart)?;
        advance(&core, SessionState::ShellRunning)?;

        self.spawn_tasks(channel, stdio, remote, resize_events);

        info!(host = %params.host, size = %size, "Remote shell running");
        Ok(())
    }

    fn spawn_tasks(
        &self,
        channel: Arc<<T::Connection as Connection>::Channel>,
        stdio: Stdio,
        remote: RemoteStreams,
        resize_events: Option<ResizeEvents>,
    ) {
        let core = &self.core;
        let buffer_size = self.settings.io.buffer_size;
        let Stdio {
            input,
            output,
            error,
        } = stdio;
        let RemoteStreams {
            stdin,
            stdout,
            stderr,
        } = remote;

        let shared = Arc::clone(core);
        let stdout_pump = core.tasks.spawn(async move {
            let cancel = shared.cancel.clone();
            multiplexer::pump_output(
                Stream::Stdout,
                stdout,
                output,
                buffer_size,
                &shared.exit_message,
                cancel,
            )
            .await
        });

        let shared = Arc::clone(core);
        let stderr_pump = core.tasks.spawn(async move {
            let cancel = shared.cancel.clone();
            multiplexer::pump_output(
                Stream::Stderr,
                stderr,
                error,
                buffer_size,
                &shared.exit_message,
                cancel,
            )
            .await
        });

        let shared = Arc::clone(core);
        core.tasks.spawn(async move {
            let cancel = shared.cancel.clone();
            multiplexer::pump_input(
                input,
                stdin,
                buffer_size,
                &shared.exit_message,
                cancel,
            )
            .await
        });

        if let (Some(terminal), Some(events)) = (&self.local_terminal, resize_events) {
            core.tasks.spawn(resize::propagate_resizes(
                Arc::clone(terminal),
                events,
                Arc::clone(core),
            ));
        }

        let drain_timeout = Duration::from_millis(self.settings.io.drain_timeout_ms);
        tokio::spawn(lifecycle::watch_remote_exit(
            Arc::clone(core),
            channel,
            vec![stdout_pump, stderr_pump],
            drain_timeout,
        ));
    }

    /// Sends a window-change request to the remote pty.
    ///
    /// Requires [`SessionState::ShellRunning`]. Repeating the last size
    /// sent is a no-op.
    pub async fn resize(&self, width: u16, height: u16) -> Result<()> {
        let size = WindowSize::new(width, height);
        if !size.is_valid() {
            return Err(ConfigError::InvalidWindowSize {
                cols: width,
                rows: height,
            }
            .into());
        }

        self.core.forward_resize(size).await.map(|_| ())
    }

    /// Waits until the remote shell terminates.
    ///
    /// Safe to call while the pumps run and from several tasks. A
    /// non-zero status is returned as `Ok`; a failed wait is returned as
    /// [`SessionError::RemoteExit`] and kept as the exit message.
    pub async fn wait_for_exit(&self) -> Result<ExitStatus> {
        let state = self.state();
        if matches!(
            state,
            SessionState::Idle
                | SessionState::Dialing
                | SessionState::PtyRequested
                | SessionState::Failed
        ) {
            return Err(SessionError::NotRunning { state });
        }

        let mut exit = self.core.subscribe_exit();
        let outcome = exit
            .wait_for(Option::is_some)
            .await
            .map(|outcome| (*outcome).clone())
            .map_err(|_| SessionError::RemoteExit("exit watcher went away".to_string()))?;

        match outcome {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(SessionError::RemoteExit(message)),
            None => Err(SessionError::RemoteExit("no exit status".to_string())),
        }
    }

    /// Tears the session down: stops the pumps and resize listener,
    /// closes the channel and the connection, restores the local terminal.
    ///
    /// Idempotent. A repeated call (or a call racing a remote-exit
    /// teardown) waits for that teardown and returns
    /// [`SessionError::AlreadyClosed`] without releasing anything again.
    pub async fn close(&self) -> Result<()> {
        self.core.teardown(Trigger::Caller).await
    }
}

impl<K: Connection> SessionCore<K> {
    /// Forwards a window change unless it repeats the last size sent.
    /// Returns whether a request went out.
    pub(crate) async fn forward_resize(&self, size: WindowSize) -> Result<bool> {
        let state = self.state.get();
        if state != SessionState::ShellRunning {
            return Err(SessionError::NotRunning { state });
        }
        let channel = self
            .channel
            .get()
            .ok_or(SessionError::NotRunning { state })?;

        let _serialized = self.resize_lock.lock().await;
        if self.window_size() == size {
            debug!(size = %size, "Window size unchanged, skipping window-change");
            return Ok(false);
        }

        channel.resize(size).await.map_err(SessionError::WindowChange)?;
        self.set_window_size(size);

        debug!(size = %size, "Sent window-change");
        Ok(true)
    }
}

impl<T: Transport> Drop for TerminalSession<T> {
    fn drop(&mut self) {
        // Without a close, still stop the tasks and give the terminal back.
        if !self.state().is_terminal() {
            self.core.cancel.cancel();
            self.core.restore_terminal();
        }
    }
}

fn advance<K: Connection>(core: &SessionCore<K>, next: SessionState) -> Result<()> {
    core.state
        .transition(next)
        .map_err(|state| SessionError::NotRunning { state })
}

fn acquire_streams<C: Channel>(channel: &C) -> Result<RemoteStreams> {
    let stdin = channel
        .take_stdin()
        .map_err(|source| SessionError::StreamAcquisition {
            stream: "stdin",
            source,
        })?;
    let stdout = channel
        .take_stdout()
        .map_err(|source| SessionError::StreamAcquisition {
            stream: "stdout",
            source,
        })?;
    let stderr = channel
        .take_stderr()
        .map_err(|source| SessionError::StreamAcquisition {
            stream: "stderr",
            source,
        })?;

    Ok(RemoteStreams {
        stdin,
        stdout,
        stderr,
    })
}
