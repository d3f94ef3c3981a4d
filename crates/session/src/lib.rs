//! # wsm shell sessions
//!
//! This crate runs an interactive shell on a remote host over an
//! authenticated transport, as if the user were sitting at it.
//!
//! ## Overview
//!
//! A [`TerminalSession`] provides:
//!
//! - **Session Controller**: dial, pty request, shell start and the
//!   lifecycle state machine
//! - **Local Terminal Control**: raw mode for the session's lifetime,
//!   restored exactly once on every exit path
//! - **Resize Propagation**: local window changes forwarded to the remote pty
//! - **I/O Multiplexing**: independent stdin, stdout and stderr pumps
//! - **Teardown**: idempotent close, triggered by the caller or by the
//!   remote process exiting
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       TerminalSession                           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                 │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐   │
//! │  │ RawModeGuard │  │    Resize    │  │   Remote-exit        │   │
//! │  │              │  │   Listener   │  │     Watcher          │   │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘   │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │       stdin pump · stdout pump · stderr pump              │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! │                                                                 │
//! │  ┌───────────────────────────────────────────────────────────┐  │
//! │  │    transport::Transport → Connection → Channel            │  │
//! │  └───────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use session::{ControllingTerminal, SessionConfig, Stdio, TerminalSession};
//! use transport::{Credential, SshTransport};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = SessionConfig {
//!         username: "ops".to_string(),
//!         host: "10.0.0.5".to_string(),
//!         port: 22,
//!         credential: Credential::password("x"),
//!         width: 80,
//!         height: 24,
//!     };
//!
//!     let mut session = TerminalSession::new(SshTransport::new(), config, Stdio::inherit())
//!         .with_local_terminal(Arc::new(ControllingTerminal::new()));
//!     session.connect().await?;
//!
//!     let status = session.wait_for_exit().await?;
//!     let _ = session.close().await;
//!     println!("remote shell exited with {}", status);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Session parameters and TOML tunables
//! - [`error`]: Session error taxonomy
//! - [`session`]: Controller, state machine, pumps and teardown
//! - [`terminal`]: Raw mode and window-change notifications

pub mod config;
pub mod error;
pub mod session;
pub mod terminal;

pub use config::{Config, ConfigError, SessionConfig};
pub use error::{Result, SessionError};
pub use session::{SessionState, Stdio, TerminalSession};
pub use terminal::{ControllingTerminal, LocalTerminal, RawModeGuard};
