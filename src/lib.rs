//! PTY session library
//!
//! Spawns a child process on a freshly allocated pseudoterminal and hands the
//! caller the master side as a byte stream, along with wait, poll and signal
//! controls for the child.
//!
//! - `pty`: terminal allocation, fork/exec, and the [`PtySession`] handle
//! - `config`: spawn requests loaded from TOML or the command line
//!
//! The child runs in an interactive terminal, so it emits escape sequences
//! if its environment asks for them (`TERM=ansi`, for example):
//!
//! ```no_run
//! use std::io::Read;
//!
//! let mut session = pty_session::spawn("/bin/ls", &["/bin/ls", "-la"], &["TERM=ansi"])?;
//! let mut output = String::new();
//! session.read_to_string(&mut output)?;
//! let status = session.wait()?;
//! println!("{output}\n{status}");
//! # Ok::<(), pty_session::PtyError>(())
//! ```

pub mod config;
pub mod pty;

pub use pty::{spawn, ExitStatus, MasterStream, PtyError, PtyResult, PtySession};
