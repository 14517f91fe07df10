//! A running child on a pseudoterminal
//!
//! The session owns the master descriptor and refers to the child by pid.
//! Once the child's status has been collected it is cached, and the pid is
//! never passed to `waitpid` or `kill` again: the OS may already have handed
//! it to an unrelated process.

use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;

use nix::errno::Errno;
use nix::libc::{self, c_int, pid_t};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use super::{allocator, ExitStatus, MasterStream, PtyError, PtyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    Running,
    Reaped(ExitStatus),
}

/// A child process attached to a PTY, seen from the parent
#[derive(Debug)]
pub struct PtySession {
    master: MasterStream,
    pid: Pid,
    state: ChildState,
}

impl PtySession {
    /// Same as [`spawn`](crate::pty::spawn)
    pub fn spawn<P, A, E>(path: P, arguments: &[A], environment: &[E]) -> PtyResult<Self>
    where
        P: AsRef<str>,
        A: AsRef<str>,
        E: AsRef<str>,
    {
        allocator::spawn(path, arguments, environment)
    }

    pub(crate) fn new(master: OwnedFd, pid: Pid) -> Self {
        Self {
            master: MasterStream::new(master),
            pid,
            state: ChildState::Running,
        }
    }

    /// The master side of the terminal
    pub fn master(&self) -> &MasterStream {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut MasterStream {
        &mut self.master
    }

    /// Get the child process ID
    pub fn child_pid(&self) -> Pid {
        self.pid
    }

    /// The collected exit status, if the child has been reaped
    pub fn status(&self) -> Option<ExitStatus> {
        match self.state {
            ChildState::Running => None,
            ChildState::Reaped(status) => Some(status),
        }
    }

    /// Block until the child terminates and return its status
    ///
    /// Returns immediately with the cached status once the child has been
    /// reaped by an earlier `wait` or poll.
    pub fn wait(&mut self) -> PtyResult<ExitStatus> {
        if let ChildState::Reaped(status) = self.state {
            return Ok(status);
        }

        loop {
            match waitpid_raw(self.pid, 0) {
                Ok((reaped, status)) if reaped == self.pid.as_raw() => {
                    return Ok(self.mark_reaped(status));
                },
                Ok((reaped, _)) => {
                    tracing::warn!(
                        pid = self.pid.as_raw(),
                        reaped,
                        "waitpid reported a different process"
                    );
                    return Err(PtyError::UnknownChild(self.pid));
                },
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => {
                    tracing::warn!(pid = self.pid.as_raw(), "Child process does not exist");
                    return Err(PtyError::UnknownChild(self.pid));
                },
                Err(source) => {
                    return Err(PtyError::Wait {
                        pid: self.pid,
                        source,
                    })
                },
            }
        }
    }

    /// Raw status word of the child, blocking until it terminates
    pub fn exit_status(&mut self) -> PtyResult<c_int> {
        self.wait().map(|status| status.raw())
    }

    /// Collect the child's status if it has already terminated
    ///
    /// Never blocks. `Ok(None)` means the child is still running.
    pub fn try_wait(&mut self) -> PtyResult<Option<ExitStatus>> {
        if let ChildState::Reaped(status) = self.state {
            return Ok(Some(status));
        }

        match waitpid_raw(self.pid, libc::WNOHANG) {
            Ok((0, _)) => Ok(None),
            Ok((reaped, status)) if reaped == self.pid.as_raw() => {
                Ok(Some(self.mark_reaped(status)))
            },
            Ok(_) => Err(PtyError::UnknownChild(self.pid)),
            Err(Errno::EINTR) => Ok(None),
            Err(Errno::ECHILD) => Err(PtyError::UnknownChild(self.pid)),
            Err(source) => Err(PtyError::Wait {
                pid: self.pid,
                source,
            }),
        }
    }

    /// Check whether the child has terminated, without blocking
    ///
    /// Anomalies such as the OS no longer knowing the child are logged and
    /// reported as "not finished".
    pub fn poll_finished(&mut self) -> bool {
        match self.try_wait() {
            Ok(status) => status.is_some(),
            Err(e) => {
                tracing::warn!(pid = self.pid.as_raw(), "Lost track of child: {}", e);
                false
            },
        }
    }

    /// Send a signal to the child process
    ///
    /// Signalling a child that already exited is not an error.
    pub fn send_signal(&self, signal: Signal) -> PtyResult<()> {
        if let ChildState::Reaped(_) = self.state {
            tracing::debug!(
                pid = self.pid.as_raw(),
                %signal,
                "Child already reaped, not signalling"
            );
            return Ok(());
        }

        match kill(self.pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(source) => Err(PtyError::Signal {
                pid: self.pid,
                source,
            }),
        }
    }

    fn mark_reaped(&mut self, raw: c_int) -> ExitStatus {
        let status = ExitStatus::from_raw(raw);
        tracing::debug!(pid = self.pid.as_raw(), %status, "Child process finished");
        self.state = ChildState::Reaped(status);
        status
    }
}

/// `waitpid` keeping the undecoded status word
///
/// Returns the pid the OS reported (0 under `WNOHANG` while still running).
fn waitpid_raw(pid: Pid, flags: c_int) -> nix::Result<(pid_t, c_int)> {
    let mut status: c_int = 0;
    // SAFETY: status is a valid, writable c_int for the duration of the call
    let reaped = unsafe { libc::waitpid(pid.as_raw(), &mut status, flags) };
    Errno::result(reaped).map(|reaped| (reaped, status))
}

impl Read for PtySession {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.master.read(buf)
    }
}

impl Write for PtySession {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.master.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.master.flush()
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        // The child is left running; only collect it if it is already gone.
        if self.state == ChildState::Running {
            if let Ok((reaped, _)) = waitpid_raw(self.pid, libc::WNOHANG) {
                if reaped == self.pid.as_raw() {
                    tracing::debug!(pid = self.pid.as_raw(), "Reaped child on drop");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty::spawn;
    use std::time::{Duration, Instant};

    const NO_ENV: &[&str] = &[];

    fn assert_send<T: Send>() {}

    #[test]
    fn test_session_is_send() {
        assert_send::<PtySession>();
    }

    #[test]
    fn test_spawn_echo() {
        let mut session =
            spawn("/bin/echo", &["echo", "hi"], &["TERM=ansi"]).expect("Failed to spawn PTY");
        assert!(session.child_pid().as_raw() > 0);

        let mut output = Vec::new();
        session.read_to_end(&mut output).expect("Failed to read");
        let text = String::from_utf8_lossy(&output);
        assert!(text.contains("hi"), "Unexpected output: {}", text);

        let status = session.wait().expect("Failed to wait");
        assert!(status.success(), "Unexpected status: {}", status);
        assert_eq!(session.exit_status().unwrap(), status.raw());
    }

    #[test]
    fn test_wait_twice_returns_cached_status() {
        let mut session =
            spawn("/bin/sh", &["sh", "-c", "exit 3"], NO_ENV).expect("Failed to spawn PTY");

        let first = session.wait().unwrap();
        assert_eq!(first.code(), Some(3));

        let started = Instant::now();
        let second = session.wait().unwrap();
        assert_eq!(first, second);
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(session.status(), Some(first));
    }

    #[test]
    fn test_poll_then_wait_does_not_reap_twice() {
        let mut session = spawn("/bin/sh", &["sh", "-c", "exit 0"], NO_ENV).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.poll_finished() {
            assert!(Instant::now() < deadline, "child never finished");
            std::thread::sleep(Duration::from_millis(10));
        }

        // A second waitpid on the same pid would fail with ECHILD
        assert!(session.wait().unwrap().success());
        assert!(session.poll_finished());
    }

    #[test]
    fn test_signal_after_reap_is_noop() {
        let mut session = spawn("/bin/sh", &["sh", "-c", "exit 0"], NO_ENV).unwrap();
        session.wait().unwrap();
        assert!(session.send_signal(Signal::SIGTERM).is_ok());
    }

    #[test]
    fn test_kill_reports_signal() {
        let mut session = spawn("/bin/sleep", &["sleep", "30"], NO_ENV).unwrap();
        assert!(!session.poll_finished());

        session.send_signal(Signal::SIGKILL).unwrap();
        let status = session.wait().unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGKILL));
        assert_eq!(status.code(), None);
    }

    #[test]
    fn test_unknown_child_is_not_finished() {
        let mut session = spawn("/bin/sh", &["sh", "-c", "exit 0"], NO_ENV).unwrap();
        let pid = session.child_pid();

        // Reap behind the session's back
        nix::sys::wait::waitpid(pid, None).unwrap();

        assert!(!session.poll_finished());
        assert!(matches!(session.try_wait(), Err(PtyError::UnknownChild(p)) if p == pid));
        assert!(matches!(session.wait(), Err(PtyError::UnknownChild(_))));
        assert_eq!(session.status(), None);
    }

    #[test]
    fn test_drop_leaves_child_running() {
        let session = spawn(
            "/bin/sh",
            &["sh", "-c", "trap '' HUP; sleep 0.5; exit 7"],
            &["PATH=/usr/bin:/bin"],
        )
        .unwrap();
        let pid = session.child_pid();

        // Let the shell install its trap before the master closes
        std::thread::sleep(Duration::from_millis(200));
        drop(session);

        let status = nix::sys::wait::waitpid(pid, None).unwrap();
        assert_eq!(status, nix::sys::wait::WaitStatus::Exited(pid, 7));
    }
}
