//! Local terminal control.
//!
//! The calling process's controlling terminal is a process-wide resource:
//! it is switched into raw mode for the lifetime of an interactive session
//! and its window-change notifications are forwarded to the remote pty.
//! Access goes through the [`LocalTerminal`] trait so sessions can run
//! headless or against a fake terminal in tests.

pub mod raw;
pub mod resize;

use std::io::{self, IsTerminal};
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{BoxStream, StreamExt};
use transport::WindowSize;

use crate::error::{Result, SessionError};

pub use raw::RawModeGuard;

/// Stream of window-change notifications. Items carry no payload; the
/// listener re-reads the size on each one.
pub type ResizeEvents = BoxStream<'static, ()>;

/// The terminal an interactive session runs in.
pub trait LocalTerminal: Send + Sync + 'static {
    /// Switches the terminal into raw, unbuffered, unechoed mode,
    /// remembering the previous mode.
    fn enter_raw(&self) -> Result<()>;

    /// Restores the mode saved by [`enter_raw`](LocalTerminal::enter_raw).
    fn restore(&self) -> io::Result<()>;

    /// Reads the current dimensions.
    fn size(&self) -> io::Result<WindowSize>;

    /// Subscribes to window-change notifications.
    fn resize_events(&self) -> io::Result<ResizeEvents>;
}

/// Set while some session holds the controlling terminal in raw mode.
static RAW_MODE_HELD: AtomicBool = AtomicBool::new(false);

/// The process's controlling terminal, driven through crossterm.
///
/// Only one session at a time may hold it in raw mode.
#[derive(Debug, Default, Clone, Copy)]
pub struct ControllingTerminal;

impl ControllingTerminal {
    pub fn new() -> Self {
        Self
    }
}

impl LocalTerminal for ControllingTerminal {
    fn enter_raw(&self) -> Result<()> {
        if !io::stdin().is_terminal() {
            return Err(SessionError::TerminalMode(
                "stdin is not a terminal".to_string(),
            ));
        }

        if RAW_MODE_HELD.swap(true, Ordering::SeqCst) {
            return Err(SessionError::TerminalMode(
                "terminal already in raw mode for another session".to_string(),
            ));
        }

        if let Err(e) = crossterm::terminal::enable_raw_mode() {
            RAW_MODE_HELD.store(false, Ordering::SeqCst);
            return Err(SessionError::TerminalMode(e.to_string()));
        }

        Ok(())
    }

    fn restore(&self) -> io::Result<()> {
        let result = crossterm::terminal::disable_raw_mode();
        RAW_MODE_HELD.store(false, Ordering::SeqCst);
        result
    }

    fn size(&self) -> io::Result<WindowSize> {
        let (cols, rows) = crossterm::terminal::size()?;
        Ok(WindowSize::new(cols, rows))
    }

    fn resize_events(&self) -> io::Result<ResizeEvents> {
        window_change_events()
    }
}

/// SIGWINCH is sent to the process when the terminal's window size changes.
#[cfg(unix)]
fn window_change_events() -> io::Result<ResizeEvents> {
    use tokio::signal::unix::{signal, SignalKind};

    let sigwinch = signal(SignalKind::window_change())?;
    let events = futures_util::stream::unfold(sigwinch, |mut sigwinch| async move {
        sigwinch.recv().await.map(|()| ((), sigwinch))
    });

    Ok(events.boxed())
}

#[cfg(not(unix))]
fn window_change_events() -> io::Result<ResizeEvents> {
    Ok(futures_util::stream::pending().boxed())
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable terminal for session tests.

    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use tokio::sync::mpsc;

    use super::*;

    /// Fake terminal counting raw-mode transitions.
    pub(crate) struct FakeTerminal {
        pub(crate) raw_entries: AtomicUsize,
        pub(crate) restores: AtomicUsize,
        pub(crate) refuse_raw: bool,
        size: Mutex<WindowSize>,
        events: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    }

    impl FakeTerminal {
        pub(crate) fn new(size: WindowSize) -> (Self, mpsc::UnboundedSender<()>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let terminal = Self {
                raw_entries: AtomicUsize::new(0),
                restores: AtomicUsize::new(0),
                refuse_raw: false,
                size: Mutex::new(size),
                events: Mutex::new(Some(rx)),
            };
            (terminal, tx)
        }

        pub(crate) fn set_size(&self, size: WindowSize) {
            *self.size.lock().unwrap() = size;
        }
    }

    impl LocalTerminal for FakeTerminal {
        fn enter_raw(&self) -> Result<()> {
            if self.refuse_raw {
                return Err(SessionError::TerminalMode(
                    "stdin is not a terminal".to_string(),
                ));
            }
            self.raw_entries.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn restore(&self) -> io::Result<()> {
            self.restores.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn size(&self) -> io::Result<WindowSize> {
            Ok(*self.size.lock().unwrap())
        }

        fn resize_events(&self) -> io::Result<ResizeEvents> {
            let rx = self
                .events
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "events already taken"))?;
            Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|()| ((), rx))
            })
            .boxed())
        }
    }
}
