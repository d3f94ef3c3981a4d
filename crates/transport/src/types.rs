//! Value types shared by every transport adapter.

use std::fmt;

/// Secret used to authenticate the dial.
///
/// The value never appears in `Debug` output so configs can be logged safely.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a password credential.
    pub fn password(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Exposes the secret to the adapter performing authentication.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Returns true if no secret was supplied.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Everything an adapter needs to establish an authenticated connection.
#[derive(Debug, Clone)]
pub struct DialParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub credential: Credential,
}

impl DialParams {
    /// Returns the `host:port` form, bracketing IPv6 literals.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Terminal dimensions in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowSize {
    /// Width in columns.
    pub cols: u16,
    /// Height in rows.
    pub rows: u16,
}

impl WindowSize {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Both dimensions must be positive for a pty request.
    pub fn is_valid(&self) -> bool {
        self.cols > 0 && self.rows > 0
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Terminal mode opcodes sent along with a pty request.
///
/// Stored as `(opcode, value)` pairs in insertion order. An empty set asks
/// the remote side to use its defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalModes {
    modes: Vec<(u8, u32)>,
}

impl TerminalModes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets an opcode, replacing an earlier value for the same opcode.
    pub fn set(&mut self, opcode: u8, value: u32) -> &mut Self {
        match self.modes.iter_mut().find(|(op, _)| *op == opcode) {
            Some(entry) => entry.1 = value,
            None => self.modes.push((opcode, value)),
        }
        self
    }

    pub fn get(&self, opcode: u8) -> Option<u32> {
        self.modes
            .iter()
            .find(|(op, _)| *op == opcode)
            .map(|(_, value)| *value)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u8, u32)> {
        self.modes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.modes.is_empty()
    }
}

/// How the remote process terminated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExitStatus {
    /// Exit code, if the process exited normally.
    pub code: Option<u32>,
    /// Signal name, if the process was killed by a signal.
    pub signal: Option<String>,
}

impl ExitStatus {
    pub fn from_code(code: u32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn from_signal(signal: impl Into<String>) -> Self {
        Self {
            code: None,
            signal: Some(signal.into()),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0) && self.signal.is_none()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.code, &self.signal) {
            (_, Some(signal)) => write!(f, "killed by signal {}", signal),
            (Some(code), None) => write!(f, "status {}", code),
            (None, None) => f.write_str("unknown status"),
        }
    }
}
