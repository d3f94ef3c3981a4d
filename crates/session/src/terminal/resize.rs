//! Window-change propagation.
//!
//! Listens for local window-change notifications for the lifetime of a
//! running session and forwards each new size to the remote pty. Sizes
//! equal to the last one sent are dropped.

use std::sync::Arc;

use futures_util::StreamExt;
use tracing::{debug, warn};
use transport::Connection;

use super::{LocalTerminal, ResizeEvents};
use crate::session::lifecycle::SessionCore;

/// Forwards window changes until the session is cancelled or the
/// notification stream ends.
pub(crate) async fn propagate_resizes<K: Connection>(
    terminal: Arc<dyn LocalTerminal>,
    mut events: ResizeEvents,
    core: Arc<SessionCore<K>>,
) {
    debug!("Resize listener started");

    loop {
        tokio::select! {
            _ = core.cancel.cancelled() => break,
            event = events.next() => {
                if event.is_none() {
                    debug!("Window-change notifications ended");
                    break;
                }
            }
        }

        let size = match terminal.size() {
            Ok(size) if size.is_valid() => size,
            Ok(size) => {
                debug!(size = %size, "Ignoring degenerate window size");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read terminal size");
                continue;
            }
        };

        if let Err(e) = core.forward_resize(size).await {
            // Not fatal; the next notification retries with a fresh size.
            warn!(size = %size, error = %e, "Failed to forward window change");
        }
    }

    debug!("Resize listener stopped");
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::mpsc;
    use transport::mock::{Fault, MockTransport};
    use transport::{Credential, WindowSize};

    use super::*;
    use crate::config::SessionConfig;
    use crate::session::{SessionState, Stdio, TerminalSession};
    use crate::terminal::testing::FakeTerminal;

    fn session_config() -> SessionConfig {
        SessionConfig {
            username: "ops".to_string(),
            host: "10.0.0.5".to_string(),
            port: 22,
            credential: Credential::password("x"),
            width: 80,
            height: 24,
        }
    }

    async fn running_session(
        transport: &MockTransport,
    ) -> (
        TerminalSession<MockTransport>,
        Arc<FakeTerminal>,
        mpsc::UnboundedSender<()>,
    ) {
        let (terminal, events) = FakeTerminal::new(WindowSize::new(80, 24));
        let terminal = Arc::new(terminal);
        let stdio = Stdio::new(
            Box::new(tokio::io::empty()),
            Box::new(tokio::io::sink()),
            Box::new(tokio::io::sink()),
        );

        let mut session = TerminalSession::new(transport.clone(), session_config(), stdio)
            .with_local_terminal(terminal.clone());
        session.connect().await.unwrap();
        assert_eq!(session.state(), SessionState::ShellRunning);

        (session, terminal, events)
    }

    async fn wait_for_resizes(transport: &MockTransport, count: usize) -> Vec<WindowSize> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let resizes = transport.stats().resizes;
                if resizes.len() >= count {
                    return resizes;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("resize was not forwarded")
    }

    #[tokio::test]
    async fn test_notification_forwards_new_size() {
        let transport = MockTransport::new();
        let (session, terminal, events) = running_session(&transport).await;

        terminal.set_size(WindowSize::new(132, 43));
        events.send(()).unwrap();

        let resizes = wait_for_resizes(&transport, 1).await;
        assert_eq!(resizes, vec![WindowSize::new(132, 43)]);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unchanged_size_is_not_forwarded() {
        let transport = MockTransport::new();
        let (session, terminal, events) = running_session(&transport).await;

        // Still 80x24, then the same new size twice.
        events.send(()).unwrap();
        terminal.set_size(WindowSize::new(100, 30));
        events.send(()).unwrap();
        events.send(()).unwrap();
        terminal.set_size(WindowSize::new(100, 31));
        events.send(()).unwrap();

        let resizes = wait_for_resizes(&transport, 2).await;
        assert_eq!(
            resizes,
            vec![WindowSize::new(100, 30), WindowSize::new(100, 31)]
        );

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_degenerate_size_is_skipped() {
        let transport = MockTransport::new();
        let (session, terminal, events) = running_session(&transport).await;

        terminal.set_size(WindowSize::new(0, 0));
        events.send(()).unwrap();
        terminal.set_size(WindowSize::new(90, 25));
        events.send(()).unwrap();

        let resizes = wait_for_resizes(&transport, 1).await;
        assert_eq!(resizes, vec![WindowSize::new(90, 25)]);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_failure_does_not_stop_listener() {
        let transport = MockTransport::new().fail(Fault::Resize);
        let (session, terminal, events) = running_session(&transport).await;

        terminal.set_size(WindowSize::new(100, 30));
        events.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(transport.stats().resizes.is_empty());
        assert_eq!(session.window_size(), WindowSize::new(80, 24));
        // Listener plus the stdout/stderr pumps are still alive.
        assert!(session.active_tasks() >= 1);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_listener_stops_on_close() {
        let transport = MockTransport::new();
        let (session, _terminal, events) = running_session(&transport).await;

        session.close().await.unwrap();
        assert_eq!(session.active_tasks(), 0);

        let _ = events.send(());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(transport.stats().resizes.is_empty());
    }
}
