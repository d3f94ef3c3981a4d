//! wsm shell
//!
//! Interactive shell session over SSH, or over a local PTY with `--local`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use session::config::{Config, SessionConfig};
use session::{ControllingTerminal, LocalTerminal, SessionError, Stdio, TerminalSession};
use transport::{Credential, LocalTransport, SshOptions, SshTransport, Transport};

/// Port used when the target does not name one.
const DEFAULT_PORT: u16 = 22;

/// Exit code when the remote status is unknown or the session failed.
const FAILURE_EXIT_CODE: i32 = 1;

/// wsm shell - interactive remote shell session.
#[derive(Parser, Debug)]
#[command(name = "wsm-shell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Run the shell on a local PTY instead of dialing SSH
    #[arg(long)]
    pub local: bool,

    /// Shell to run instead of $SHELL (with --local)
    #[arg(long, value_name = "PATH", requires = "local")]
    pub shell: Option<String>,

    /// Target in the form [USER@]HOST[:PORT]
    pub target: String,
}

/// A parsed `[USER@]HOST[:PORT]` target.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    username: Option<String>,
    host: String,
    port: u16,
}

fn parse_target(target: &str) -> anyhow::Result<Target> {
    let (username, rest) = match target.rsplit_once('@') {
        Some((user, rest)) => (Some(user.to_string()), rest),
        None => (None, target),
    };

    let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
        // [v6addr] or [v6addr]:port
        let (host, tail) = bracketed
            .split_once(']')
            .with_context(|| format!("unterminated IPv6 address in '{}'", target))?;
        let port = match tail.strip_prefix(':') {
            Some(port) => parse_port(port)?,
            None if tail.is_empty() => DEFAULT_PORT,
            None => anyhow::bail!("unexpected '{}' after IPv6 address", tail),
        };
        (host, port)
    } else {
        match rest.split_once(':') {
            Some((host, port)) => (host, parse_port(port)?),
            None => (rest, DEFAULT_PORT),
        }
    };

    if host.is_empty() {
        anyhow::bail!("missing host in '{}'", target);
    }

    Ok(Target {
        username,
        host: host.to_string(),
        port,
    })
}

fn parse_port(port: &str) -> anyhow::Result<u16> {
    port.parse()
        .with_context(|| format!("invalid port '{}'", port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default()?
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Logs go to stderr so they never mix with the remote output stream.
    let filter = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let target = parse_target(&cli.target)?;
    let username = match target.username {
        Some(user) => user,
        None => std::env::var("USER").unwrap_or_default(),
    };

    let terminal = ControllingTerminal::new();
    let size = terminal
        .size()
        .context("failed to read terminal size")?;

    let session_config = SessionConfig {
        username,
        host: target.host,
        port: target.port,
        credential: Credential::password(std::env::var("WSM_PASSWORD").unwrap_or_default()),
        width: size.cols,
        height: size.rows,
    };

    let code = if cli.local {
        let transport = match cli.shell {
            Some(shell) => LocalTransport::with_shell(shell),
            None => LocalTransport::new(),
        };
        run(transport, session_config, config, terminal).await
    } else {
        let transport = SshTransport::with_options(SshOptions {
            connect_timeout: config.ssh.connect_timeout(),
            keepalive_interval: config.ssh.keepalive(),
        });
        run(transport, session_config, config, terminal).await
    };

    std::process::exit(code);
}

/// Runs one session to completion and returns the process exit code.
async fn run<T: Transport>(
    transport: T,
    session_config: SessionConfig,
    config: Config,
    terminal: ControllingTerminal,
) -> i32 {
    let mut session = TerminalSession::new(transport, session_config, Stdio::inherit())
        .with_settings(config)
        .with_local_terminal(Arc::new(terminal));

    if let Err(e) = session.connect().await {
        eprintln!("Error: {}", e);
        return FAILURE_EXIT_CODE;
    }

    let code = match session.wait_for_exit().await {
        Ok(status) => status
            .code
            .and_then(|code| i32::try_from(code).ok())
            .unwrap_or(FAILURE_EXIT_CODE),
        Err(e) => {
            tracing::debug!(error = %e, "Remote wait ended with an error");
            FAILURE_EXIT_CODE
        }
    };

    match session.close().await {
        Ok(()) | Err(SessionError::AlreadyClosed) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to close session"),
    }

    // Raw mode is restored by now, so plain newlines render correctly.
    if let Some(message) = session.exit_message() {
        eprintln!("{}", message);
    }

    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from([
            "wsm-shell",
            "--config",
            "/tmp/wsm.toml",
            "-v",
            "--local",
            "--shell",
            "/bin/sh",
            "ops@localhost",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/tmp/wsm.toml")));
        assert!(cli.verbose);
        assert!(cli.local);
        assert_eq!(cli.shell.as_deref(), Some("/bin/sh"));
        assert_eq!(cli.target, "ops@localhost");
    }

    #[test]
    fn test_cli_defaults_to_ssh() {
        let cli = Cli::try_parse_from(["wsm-shell", "ops@10.0.0.5"]).unwrap();
        assert!(!cli.local);
        assert_eq!(cli.shell, None);
    }

    #[test]
    fn test_cli_shell_requires_local() {
        assert!(Cli::try_parse_from(["wsm-shell", "--shell", "/bin/sh", "ops@host"]).is_err());
    }

    #[test]
    fn test_cli_requires_target() {
        assert!(Cli::try_parse_from(["wsm-shell"]).is_err());
    }

    #[test]
    fn test_parse_target_full() {
        let target = parse_target("ops@10.0.0.5:2222").unwrap();
        assert_eq!(target.username.as_deref(), Some("ops"));
        assert_eq!(target.host, "10.0.0.5");
        assert_eq!(target.port, 2222);
    }

    #[test]
    fn test_parse_target_defaults() {
        let target = parse_target("localhost").unwrap();
        assert_eq!(target.username, None);
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_target_ipv6() {
        let target = parse_target("root@[::1]:2022").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.port, 2022);

        let target = parse_target("[::1]").unwrap();
        assert_eq!(target.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_target_rejects_bad_input() {
        assert!(parse_target("ops@").is_err());
        assert!(parse_target("host:notaport").is_err());
        assert!(parse_target("host:70000").is_err());
        assert!(parse_target("[::1").is_err());
    }
}
