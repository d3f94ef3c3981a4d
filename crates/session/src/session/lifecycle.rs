//! Lifecycle and teardown.
//!
//! [`SessionCore`] is the state every session task shares. Teardown can be
//! triggered by the caller's `close`, by the remote process exiting, or by
//! a failed connect; whichever fires first runs it and the others observe
//! [`SessionError::AlreadyClosed`].

use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use transport::{Channel, Connection, ExitStatus, TransportError, WindowSize};

use super::multiplexer::{ExitMessage, PumpOutcome};
use super::state::{SessionState, StateCell};
use crate::error::{Result, SessionError};
use crate::terminal::RawModeGuard;

/// How long teardown waits for pumps and listeners to unwind.
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Result published by the remote-wait watcher.
pub(crate) type ExitOutcome = std::result::Result<ExitStatus, String>;

/// What started a teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Trigger {
    Caller,
    RemoteExit,
}

/// State shared by the session handle and its background tasks.
pub(crate) struct SessionCore<K: Connection> {
    pub(crate) state: StateCell,
    pub(crate) exit_message: ExitMessage,
    /// Cancelled when teardown starts; stops pumps and listeners.
    pub(crate) cancel: CancellationToken,
    /// Cancelled once the session reaches `Closed` or `Failed`.
    pub(crate) done: CancellationToken,
    pub(crate) tasks: TaskTracker,
    pub(crate) connection: OnceLock<K>,
    pub(crate) channel: OnceLock<Arc<K::Channel>>,
    /// Serializes window-change requests.
    pub(crate) resize_lock: tokio::sync::Mutex<()>,
    last_size: Mutex<WindowSize>,
    raw_mode: Mutex<Option<RawModeGuard>>,
    exit_tx: watch::Sender<Option<ExitOutcome>>,
}

impl<K: Connection> SessionCore<K> {
    pub(crate) fn new(initial_size: WindowSize) -> Self {
        let (exit_tx, _) = watch::channel(None);
        Self {
            state: StateCell::new(),
            exit_message: ExitMessage::new(),
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
            tasks: TaskTracker::new(),
            connection: OnceLock::new(),
            channel: OnceLock::new(),
            resize_lock: tokio::sync::Mutex::new(()),
            last_size: Mutex::new(initial_size),
            raw_mode: Mutex::new(None),
            exit_tx,
        }
    }

    /// Last size sent to the remote pty.
    pub(crate) fn window_size(&self) -> WindowSize {
        *lock(&self.last_size)
    }

    pub(crate) fn set_window_size(&self, size: WindowSize) {
        *lock(&self.last_size) = size;
    }

    pub(crate) fn hold_raw_mode(&self, guard: RawModeGuard) {
        *lock(&self.raw_mode) = Some(guard);
    }

    /// Restores the local terminal if this session put it in raw mode.
    pub(crate) fn restore_terminal(&self) {
        let guard = lock(&self.raw_mode).take();
        if let Some(mut guard) = guard {
            if let Err(e) = guard.restore() {
                warn!(error = %e, "Failed to restore terminal mode");
            }
        }
    }

    pub(crate) fn subscribe_exit(&self) -> watch::Receiver<Option<ExitOutcome>> {
        self.exit_tx.subscribe()
    }

    /// Publishes the remote exit outcome once.
    fn publish_exit(&self, outcome: ExitOutcome) {
        self.exit_tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome);
            true
        });
    }

    fn settle(&self, last: SessionState) {
        self.state.finish(last);
        self.done.cancel();
    }

    /// Runs the teardown sequence if nobody else has.
    ///
    /// Stops pumps and listeners, closes the channel and then the
    /// connection, restores the local terminal. Both releases are always
    /// attempted; the first failure is returned.
    pub(crate) async fn teardown(&self, trigger: Trigger) -> Result<()> {
        let Some(from) = self.state.begin_close() else {
            // Someone else is tearing down; let them finish first.
            self.done.cancelled().await;
            return Err(SessionError::AlreadyClosed);
        };

        if from == SessionState::Idle {
            self.publish_exit(Err("session closed before the shell started".to_string()));
            self.done.cancel();
            return Ok(());
        }

        info!(trigger = ?trigger, from = %from, "Tearing down session");

        self.cancel.cancel();
        self.tasks.close();
        let result = self.release().await;

        if tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, self.tasks.wait())
            .await
            .is_err()
        {
            warn!(remaining = self.tasks.len(), "Session tasks did not stop in time");
        }

        self.restore_terminal();
        self.settle(SessionState::Closed);

        debug!("Session closed");
        result
    }

    /// Releases whatever a failed connect acquired.
    pub(crate) async fn abort_connect(&self, error: &SessionError) {
        warn!(error = %error, "Connect failed, releasing acquired resources");

        self.cancel.cancel();
        self.tasks.close();
        if let Err(e) = self.release().await {
            warn!(error = %e, "Failed to release resources after connect failure");
        }
        self.restore_terminal();
        self.settle(SessionState::Failed);
    }

    async fn release(&self) -> Result<()> {
        let mut first_error = None;

        if let Some(channel) = self.channel.get() {
            if let Err(e) = channel.close().await {
                note_close_error(&mut first_error, "channel", e);
            }
        }

        if let Some(connection) = self.connection.get() {
            if let Err(e) = connection.close().await {
                note_close_error(&mut first_error, "connection", e);
            }
        }

        match first_error {
            Some(e) => Err(SessionError::Close(e)),
            None => Ok(()),
        }
    }
}

fn note_close_error(first: &mut Option<TransportError>, what: &str, error: TransportError) {
    // Already closed (e.g. by the remote side) is not a failure.
    if error.is_closed() {
        debug!(resource = what, "Resource was already closed");
        return;
    }

    warn!(resource = what, error = %error, "Failed to close");
    if first.is_none() {
        *first = Some(error);
    }
}

/// Waits for the remote process, publishes its outcome, then tears the
/// session down once the output pumps have drained.
pub(crate) async fn watch_remote_exit<K: Connection>(
    core: Arc<SessionCore<K>>,
    channel: Arc<K::Channel>,
    output_pumps: Vec<JoinHandle<PumpOutcome>>,
    drain_timeout: Duration,
) {
    let result = tokio::select! {
        _ = core.cancel.cancelled() => {
            core.publish_exit(Err("session closed before the remote process exited".to_string()));
            return;
        }
        result = channel.wait() => result,
    };

    match &result {
        Ok(status) if status.success() => {
            info!(status = %status, "Remote process exited");
        }
        Ok(status) => {
            info!(status = %status, "Remote process exited");
            let message = match &status.signal {
                Some(signal) => format!("remote process killed by signal {}", signal),
                None => format!("remote process exited with {}", status),
            };
            core.exit_message.record(message);
        }
        Err(e) if core.cancel.is_cancelled() => {
            debug!(error = %e, "Remote wait ended by teardown");
        }
        Err(e) => {
            warn!(error = %e, "Remote wait failed");
            core.exit_message.record(e.to_string());
        }
    }
    core.publish_exit(result.map_err(|e| e.to_string()));

    let drain = futures_util::future::join_all(output_pumps);
    if tokio::time::timeout(drain_timeout, drain).await.is_err() {
        debug!("Output still flowing after drain timeout");
    }

    match core.teardown(Trigger::RemoteExit).await {
        Ok(()) => {}
        Err(SessionError::AlreadyClosed) => {}
        Err(e) => warn!(error = %e, "Teardown after remote exit failed"),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
