//! Remote shell session management.
//!
//! This module drives one interactive session from dial to teardown:
//! the state machine, the session controller, the stream pumps and the
//! shared teardown path.

pub mod controller;
pub(crate) mod lifecycle;
pub mod multiplexer;
pub mod state;

pub use controller::{Stdio, TerminalSession};
pub use multiplexer::{ExitMessage, PumpOutcome, Stream};
pub use state::SessionState;
