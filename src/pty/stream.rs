//! Byte stream over the PTY master descriptor

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags};

use super::{PtyError, PtyResult};

/// The master side of a pseudoterminal
///
/// Bytes written here arrive on the child's standard input. Everything the
/// child writes to its terminal, escape sequences included, can be read back.
#[derive(Debug)]
pub struct MasterStream {
    file: File,
}

impl MasterStream {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self {
            file: File::from(fd),
        }
    }

    /// Duplicate the descriptor, e.g. to read on another thread
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self {
            file: self.file.try_clone()?,
        })
    }

    /// Set non-blocking mode
    ///
    /// Applies to the open file description, so clones are affected too.
    pub fn set_nonblocking(&self, nonblocking: bool) -> PtyResult<()> {
        let fd = self.file.as_raw_fd();
        let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL).map_err(io_error)?);
        let flags = if nonblocking {
            flags | OFlag::O_NONBLOCK
        } else {
            flags & !OFlag::O_NONBLOCK
        };
        fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io_error)?;
        Ok(())
    }

    /// Wait until the master is readable or the timeout expires
    ///
    /// Also returns true on hangup, where the next read reports end of file.
    /// Timeouts are capped at `u16::MAX` milliseconds.
    pub fn poll_readable(&self, timeout: Duration) -> PtyResult<bool> {
        let timeout_ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
        let mut fds = [PollFd::new(self.file.as_fd(), PollFlags::POLLIN)];
        let n = match poll(&mut fds, timeout_ms) {
            Ok(n) => n,
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(PtyError::Poll(e)),
        };
        Ok(n > 0
            && fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP)))
    }
}

fn io_error(e: Errno) -> PtyError {
    PtyError::Io(io::Error::from(e))
}

/// Linux reports EIO on the master once every slave descriptor is closed.
fn eio_as_eof(result: io::Result<usize>) -> io::Result<usize> {
    match result {
        Err(e) if e.raw_os_error() == Some(Errno::EIO as i32) => Ok(0),
        other => other,
    }
}

impl Read for MasterStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        eio_as_eof(self.file.read(buf))
    }
}

impl Read for &MasterStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        eio_as_eof((&self.file).read(buf))
    }
}

impl Write for MasterStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Write for &MasterStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.file).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        (&self.file).flush()
    }
}

impl AsRawFd for MasterStream {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl AsFd for MasterStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}
