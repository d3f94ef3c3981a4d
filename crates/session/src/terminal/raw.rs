//! Scoped raw-mode acquisition.

use std::io;
use std::sync::Arc;

use tracing::{debug, warn};

use super::LocalTerminal;
use crate::error::Result;

/// Holds a terminal in raw mode until restored or dropped.
///
/// Restoration happens exactly once, whichever comes first: an explicit
/// [`restore`](RawModeGuard::restore) from teardown or the guard's `Drop`
/// on an unwinding path.
pub struct RawModeGuard {
    terminal: Arc<dyn LocalTerminal>,
    active: bool,
}

impl RawModeGuard {
    /// Enters raw mode on the given terminal.
    pub fn acquire(terminal: Arc<dyn LocalTerminal>) -> Result<Self> {
        terminal.enter_raw()?;
        debug!("Entered raw terminal mode");

        Ok(Self {
            terminal,
            active: true,
        })
    }

    /// Returns true until the previous mode has been restored.
    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        self.active
    }

    /// Restores the previous terminal mode. Later calls are no-ops.
    pub fn restore(&mut self) -> io::Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;

        self.terminal.restore()?;
        debug!("Restored terminal mode");
        Ok(())
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            warn!(error = %e, "Failed to restore terminal mode");
        }
    }
}
