//! Terminal pair allocation and the fork into a PTY child
//!
//! Allocation and the C strings handed to `execve` are all prepared before
//! forking. The child only runs async-signal-safe calls until it either
//! replaces its image or aborts.

use std::ffi::CString;
use std::os::fd::{AsFd, BorrowedFd, IntoRawFd, OwnedFd};
use std::path::Path;
use std::ptr;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc::{self, c_char, STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::{signal, sigprocmask, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{close, dup2, fork, setsid, ForkResult, Pid};

use super::{AllocStage, PtyError, PtyResult, PtySession};

/// A connected master/slave pseudoterminal pair
///
/// Both descriptors are close-on-exec, so a pair allocated on one thread
/// never leaks into a child spawned concurrently on another.
#[derive(Debug)]
pub struct TerminalPair {
    master: OwnedFd,
    slave: OwnedFd,
}

impl TerminalPair {
    /// Allocate a new pair
    #[cfg(target_os = "linux")]
    pub fn open() -> PtyResult<Self> {
        use nix::fcntl::{open, OFlag};
        use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
        use nix::sys::stat::Mode;
        use std::os::fd::FromRawFd;

        let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC)
            .map_err(PtyError::alloc(AllocStage::OpenMaster))?;
        grantpt(&master).map_err(PtyError::alloc(AllocStage::Grant))?;
        unlockpt(&master).map_err(PtyError::alloc(AllocStage::Unlock))?;
        let slave_name = ptsname_r(&master).map_err(PtyError::alloc(AllocStage::SlaveName))?;

        let slave = open(
            slave_name.as_str(),
            OFlag::O_RDWR | OFlag::O_NOCTTY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )
        .map_err(PtyError::alloc(AllocStage::OpenSlave))?;

        // SAFETY: both descriptors were just opened and nothing else owns them
        let (master, slave) = unsafe {
            (
                OwnedFd::from_raw_fd(master.into_raw_fd()),
                OwnedFd::from_raw_fd(slave),
            )
        };
        Ok(Self { master, slave })
    }

    /// Allocate a new pair
    #[cfg(not(target_os = "linux"))]
    pub fn open() -> PtyResult<Self> {
        use nix::pty::openpty;
        use std::os::fd::AsRawFd;

        let pair = openpty(None, None).map_err(PtyError::alloc(AllocStage::OpenMaster))?;
        for fd in [&pair.master, &pair.slave] {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(PtyError::alloc(AllocStage::CloseOnExec))?;
        }
        Ok(Self {
            master: pair.master,
            slave: pair.slave,
        })
    }

    pub fn master(&self) -> BorrowedFd<'_> {
        self.master.as_fd()
    }

    pub fn slave(&self) -> BorrowedFd<'_> {
        self.slave.as_fd()
    }

    /// Split into `(master, slave)`
    pub fn into_parts(self) -> (OwnedFd, OwnedFd) {
        (self.master, self.slave)
    }
}

/// Which side of the fork the current process is on
#[derive(Debug)]
pub enum ForkOutcome {
    /// The original process. Keeps the master, knows the child's pid.
    Parent { child: Pid, master: OwnedFd },
    /// The new process. Keeps the slave and must exec or die.
    Child { slave: OwnedFd },
}

/// Fork the calling process, splitting the pair between the two sides
///
/// Each side closes the descriptor it does not keep. The child's copy of the
/// slave keeps the terminal open, so the parent can drop its own right away.
///
/// # Safety
///
/// Same contract as [`nix::unistd::fork`]: in a multi-threaded program the
/// child may only call async-signal-safe functions until it execs or exits.
pub unsafe fn fork_with_terminal(pair: TerminalPair) -> PtyResult<ForkOutcome> {
    let TerminalPair { master, slave } = pair;
    match fork().map_err(PtyError::alloc(AllocStage::Fork))? {
        ForkResult::Parent { child } => {
            drop(slave);
            Ok(ForkOutcome::Parent { child, master })
        },
        ForkResult::Child => {
            drop(master);
            Ok(ForkOutcome::Child { slave })
        },
    }
}

/// Program image for the child, converted before forking
struct ExecImage {
    path: CString,
    // Own the strings the pointer arrays below point into
    _argv: Vec<CString>,
    _envp: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    envp_ptrs: Vec<*const c_char>,
}

impl ExecImage {
    fn new<A, E>(path: &str, arguments: &[A], environment: &[E]) -> PtyResult<Self>
    where
        A: AsRef<str>,
        E: AsRef<str>,
    {
        let path = CString::new(path)?;
        let argv = to_cstrings(arguments)?;
        let envp = to_cstrings(environment)?;
        let argv_ptrs = null_terminated(&argv);
        let envp_ptrs = null_terminated(&envp);
        Ok(Self {
            path,
            _argv: argv,
            _envp: envp,
            argv_ptrs,
            envp_ptrs,
        })
    }
}

fn to_cstrings<S: AsRef<str>>(strings: &[S]) -> PtyResult<Vec<CString>> {
    strings
        .iter()
        .map(|s| CString::new(s.as_ref()).map_err(PtyError::from))
        .collect()
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Whether `argv[0]` names the executable at `path`
///
/// Compares path components from the end, so both `echo` and `/bin/echo`
/// name `/bin/echo`, while `ho` and the empty string do not.
pub(crate) fn argv0_names_path(path: &str, argv0: &str) -> bool {
    !argv0.is_empty() && Path::new(path).ends_with(argv0)
}

/// Spawn `path` on a new pseudoterminal
///
/// `arguments` is the full argument vector, program name first.
/// `environment` holds `KEY=VALUE` entries and becomes the child's entire
/// environment; nothing is inherited.
///
/// Success only means the fork worked. If the program cannot be executed the
/// child aborts, which shows up later as a `SIGABRT` status from
/// [`PtySession::wait`].
///
/// # Panics
///
/// If `arguments` is empty or its first element does not name `path`.
pub fn spawn<P, A, E>(path: P, arguments: &[A], environment: &[E]) -> PtyResult<PtySession>
where
    P: AsRef<str>,
    A: AsRef<str>,
    E: AsRef<str>,
{
    let path = path.as_ref();
    assert!(
        !arguments.is_empty(),
        "spawn needs at least one argument, the program name"
    );
    assert!(
        argv0_names_path(path, arguments[0].as_ref()),
        "argv[0] {:?} does not name {:?}",
        arguments[0].as_ref(),
        path
    );

    let image = ExecImage::new(path, arguments, environment)?;
    let pair = TerminalPair::open()?;

    // SAFETY: the child branch goes straight into exec_in_child, which only
    // makes async-signal-safe calls and never returns.
    match unsafe { fork_with_terminal(pair) }? {
        ForkOutcome::Parent { child, master } => {
            tracing::debug!(pid = child.as_raw(), path, "Spawned PTY child");
            Ok(PtySession::new(master, child))
        },
        ForkOutcome::Child { slave } => exec_in_child(slave, &image),
    }
}

const EXEC_FAILED: &[u8] = b"pty-session: failed to start child program\n";

/// Child side of the fork: attach to the slave, then become the target program
fn exec_in_child(slave: OwnedFd, image: &ExecImage) -> ! {
    reset_signals();

    if attach_terminal(slave).is_ok() {
        // SAFETY: every pointer refers to a NUL-terminated string owned by
        // `image`, and both arrays end with a null pointer.
        unsafe {
            libc::execve(
                image.path.as_ptr(),
                image.argv_ptrs.as_ptr(),
                image.envp_ptrs.as_ptr(),
            );
        }
    }

    // No way to report this to the parent; it sees the abort status instead.
    // SAFETY: write(2) on a static buffer is async-signal-safe
    unsafe {
        libc::write(
            STDERR_FILENO,
            EXEC_FAILED.as_ptr().cast(),
            EXEC_FAILED.len(),
        );
    }
    std::process::abort()
}

/// Undo what the parent may have changed that would otherwise survive exec
fn reset_signals() {
    let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);
    // SAFETY: restoring the default disposition installs no handler
    unsafe {
        let _ = signal(Signal::SIGPIPE, SigHandler::SigDfl);
    }
}

/// Make the slave our controlling terminal and standard streams
fn attach_terminal(slave: OwnedFd) -> nix::Result<()> {
    setsid()?;

    let fd = slave.into_raw_fd();

    // SAFETY: TIOCSCTTY takes an integer argument and fd is an open terminal
    Errno::result(unsafe { libc::ioctl(fd, libc::TIOCSCTTY as _, 0) })?;

    for target in [STDIN_FILENO, STDOUT_FILENO, STDERR_FILENO] {
        if fd == target {
            // dup2 onto itself keeps close-on-exec set
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
        } else {
            dup2(fd, target)?;
        }
    }

    if fd > STDERR_FILENO {
        close(fd)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::IsTerminal;
    use std::os::fd::AsRawFd;

    #[test]
    fn test_terminal_pair_open() {
        let pair = TerminalPair::open().expect("Failed to open PTY pair");
        assert!(pair.slave().is_terminal());
        assert_ne!(pair.master().as_raw_fd(), pair.slave().as_raw_fd());
    }

    #[test]
    fn test_terminal_pair_close_on_exec() {
        let pair = TerminalPair::open().expect("Failed to open PTY pair");
        for fd in [pair.master(), pair.slave()] {
            let flags = FdFlag::from_bits_truncate(fcntl(fd.as_raw_fd(), FcntlArg::F_GETFD).unwrap());
            assert!(flags.contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_argv0_names_path() {
        assert!(argv0_names_path("/bin/echo", "echo"));
        assert!(argv0_names_path("/bin/ls", "/bin/ls"));
        assert!(argv0_names_path("/usr/bin/env", "bin/env"));
        assert!(!argv0_names_path("/bin/echo", "ho"));
        assert!(!argv0_names_path("/bin/echo", "cat"));
        assert!(!argv0_names_path("/bin/echo", ""));
    }

    #[test]
    fn test_exec_image_is_null_terminated() {
        let image = ExecImage::new("/bin/echo", &["echo", "hi"], &["TERM=ansi"]).unwrap();
        assert_eq!(image.argv_ptrs.len(), 3);
        assert!(image.argv_ptrs[2].is_null());
        assert_eq!(image.envp_ptrs.len(), 2);
        assert!(image.envp_ptrs[1].is_null());
    }

    #[test]
    fn test_exec_image_empty_environment() {
        let image = ExecImage::new("/bin/true", &["true"], &[] as &[&str]).unwrap();
        assert_eq!(image.envp_ptrs.len(), 1);
        assert!(image.envp_ptrs[0].is_null());
    }

    #[test]
    fn test_interior_nul_rejected_before_spawn() {
        let err = spawn("/bin/echo", &["echo", "a\0b"], &[] as &[&str]).unwrap_err();
        assert!(matches!(err, PtyError::InvalidArgument(_)));
        assert!(!err.is_allocation_failure());
    }

    #[test]
    #[should_panic(expected = "at least one argument")]
    fn test_empty_arguments_panics() {
        let _ = spawn("/bin/echo", &[] as &[&str], &[] as &[&str]);
    }

    #[test]
    #[should_panic(expected = "does not name")]
    fn test_empty_argv0_panics() {
        let _ = spawn("/bin/echo", &[""], &[] as &[&str]);
    }

    #[test]
    #[should_panic(expected = "does not name")]
    fn test_mismatched_argv0_panics() {
        let _ = spawn("/bin/echo", &["cat"], &[] as &[&str]);
    }
}
