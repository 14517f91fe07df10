//! PTY (pseudoterminal) session handling
//!
//! This module allocates a master/slave terminal pair, forks a child onto the
//! slave side, and hands the caller a [`PtySession`] wrapping the master.

mod allocator;
mod session;
mod status;
mod stream;

use std::ffi::NulError;
use std::fmt;

use nix::unistd::Pid;

pub use allocator::{fork_with_terminal, spawn, ForkOutcome, TerminalPair};
pub use session::PtySession;
pub use status::ExitStatus;
pub use stream::MasterStream;

/// Step of terminal/process allocation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocStage {
    OpenMaster,
    Grant,
    Unlock,
    SlaveName,
    OpenSlave,
    CloseOnExec,
    Fork,
}

impl fmt::Display for AllocStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllocStage::OpenMaster => "open master",
            AllocStage::Grant => "grant slave access",
            AllocStage::Unlock => "unlock slave",
            AllocStage::SlaveName => "resolve slave name",
            AllocStage::OpenSlave => "open slave",
            AllocStage::CloseOnExec => "set close-on-exec",
            AllocStage::Fork => "fork",
        };
        f.write_str(name)
    }
}

/// Error type for PTY operations
#[derive(Debug, thiserror::Error)]
pub enum PtyError {
    /// No pseudo-terminal or process could be created. Nothing was spawned.
    #[error("Failed to allocate PTY ({stage}): {source}")]
    AllocationFailed {
        stage: AllocStage,
        #[source]
        source: nix::Error,
    },

    #[error("Invalid spawn argument: {0}")]
    InvalidArgument(#[from] NulError),

    #[error("Failed to wait for child {pid}: {source}")]
    Wait {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    /// The OS has no record of the child this session refers to.
    #[error("Child process {0} is unknown to the OS")]
    UnknownChild(Pid),

    #[error("Failed to signal child {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to poll PTY master: {0}")]
    Poll(#[source] nix::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PtyError {
    pub(crate) fn alloc(stage: AllocStage) -> impl FnOnce(nix::Error) -> PtyError {
        move |source| PtyError::AllocationFailed { stage, source }
    }

    /// Whether the error happened before any child process existed
    pub fn is_allocation_failure(&self) -> bool {
        matches!(self, PtyError::AllocationFailed { .. })
    }
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;
