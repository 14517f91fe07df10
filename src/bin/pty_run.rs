//! pty-run - run a program on a fresh PTY and relay I/O
//!
//! Spawns the configured program through a `PtySession`, copies stdin into
//! the master and the master onto stdout, and exits with the child's status.

use std::io::{self, IsTerminal, Read, Write};
use std::os::fd::AsFd;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use nix::sys::termios::{self, SetArg, Termios};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pty_session::config::{CliArgs, SessionConfig};
use pty_session::{spawn, ExitStatus, MasterStream, PtySession};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = CliArgs::parse();
    let config = match SessionConfig::load_with_args(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        },
    };

    let program = match config.executable() {
        Ok(program) => program,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        },
    };
    let argv = config.argv();
    let env = config.environment();
    tracing::info!("Spawning {} {:?}", program, &argv[1..]);

    let mut session = match spawn(&program, &argv, &env) {
        Ok(session) => session,
        Err(e) => {
            eprintln!("Failed to spawn PTY: {}", e);
            return ExitCode::FAILURE;
        },
    };
    tracing::info!("PTY spawned, child PID: {}", session.child_pid());

    let raw_mode = if io::stdin().is_terminal() {
        match RawModeGuard::new() {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!("Could not switch stdin to raw mode: {}", e);
                None
            },
        }
    } else {
        None
    };

    if let Err(e) = forward_stdin(session.master()) {
        tracing::error!("Failed to start stdin relay: {}", e);
    }

    if let Err(e) = relay_output(&mut session) {
        tracing::error!("Relay error: {}", e);
    }

    drop(raw_mode);

    match session.wait() {
        Ok(status) => {
            tracing::info!("Child finished: {}", status);
            exit_code(status)
        },
        Err(e) => {
            tracing::error!("Wait error: {}", e);
            ExitCode::FAILURE
        },
    }
}

/// Copy stdin into the master on a background thread
///
/// The thread is not joined; it ends with the process.
fn forward_stdin(master: &MasterStream) -> io::Result<()> {
    let mut master = master.try_clone()?;
    thread::Builder::new()
        .name("stdin-relay".into())
        .spawn(move || {
            let mut stdin = io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if master.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    },
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        })?;
    Ok(())
}

/// Copy master output to stdout until the child is gone
fn relay_output(session: &mut PtySession) -> pty_session::PtyResult<()> {
    let mut stdout = io::stdout();
    let mut buf = [0u8; 4096];

    loop {
        if session.master().poll_readable(POLL_INTERVAL)? {
            let n = session.read(&mut buf)?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n])?;
            stdout.flush()?;
        } else if session.poll_finished() {
            // Pick up anything written just before exit
            while session.master().poll_readable(Duration::ZERO)? {
                let n = session.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                stdout.write_all(&buf[..n])?;
            }
            stdout.flush()?;
            break;
        }
    }
    Ok(())
}

/// Shell convention: the exit code, or 128 + signal number
fn exit_code(status: ExitStatus) -> ExitCode {
    match (status.code(), status.signal_number()) {
        (Some(code), _) => ExitCode::from(code as u8),
        (None, Some(sig)) => ExitCode::from((128 + sig) as u8),
        (None, None) => ExitCode::FAILURE,
    }
}

/// RAII guard for raw terminal mode on stdin
struct RawModeGuard {
    original: Termios,
}

impl RawModeGuard {
    fn new() -> nix::Result<Self> {
        let stdin = io::stdin();
        let original = termios::tcgetattr(stdin.as_fd())?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &self.original);
    }
}
