//! Raw child termination status
//!
//! `waitpid` reports termination as a single encoded status word. The word is
//! kept as-is and decoded on demand.

use std::fmt;
use std::os::unix::process::ExitStatusExt;

use nix::libc::{self, c_int};
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

/// Encoded status word of a terminated child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus(c_int);

impl ExitStatus {
    /// Wrap a raw status word as returned by `waitpid`
    pub fn from_raw(raw: c_int) -> Self {
        Self(raw)
    }

    /// The undecoded status word
    pub fn raw(&self) -> c_int {
        self.0
    }

    /// Exit code, if the child called `exit`
    pub fn code(&self) -> Option<i32> {
        if libc::WIFEXITED(self.0) {
            Some(libc::WEXITSTATUS(self.0))
        } else {
            None
        }
    }

    /// Signal number, if the child was killed by a signal
    pub fn signal_number(&self) -> Option<i32> {
        if libc::WIFSIGNALED(self.0) {
            Some(libc::WTERMSIG(self.0))
        } else {
            None
        }
    }

    /// Terminating signal, if it is one `nix` knows about
    pub fn signal(&self) -> Option<Signal> {
        self.signal_number()
            .and_then(|sig| Signal::try_from(sig).ok())
    }

    pub fn core_dumped(&self) -> bool {
        libc::WIFSIGNALED(self.0) && libc::WCOREDUMP(self.0)
    }

    /// Normal exit with code 0
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// Decode into `nix`'s structured form for the given child
    pub fn decode(&self, pid: Pid) -> nix::Result<WaitStatus> {
        WaitStatus::from_raw(pid, self.0)
    }
}

impl From<ExitStatus> for std::process::ExitStatus {
    fn from(status: ExitStatus) -> Self {
        std::process::ExitStatus::from_raw(status.0)
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code() {
            write!(f, "exit code {}", code)
        } else if let Some(signal) = self.signal() {
            write!(f, "killed by {}", signal)
        } else if let Some(sig) = self.signal_number() {
            write!(f, "killed by signal {}", sig)
        } else {
            write!(f, "raw status {:#x}", self.0)
        }
    }
}
