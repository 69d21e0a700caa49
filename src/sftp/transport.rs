//! Timed, blocking I/O on the pipes of the spawned ssh child.
//!
//! Both descriptors run in non-blocking mode; every transfer is a
//! poll(2) readiness wait bounded by the transfer timeout, followed by
//! the syscall. Partial transfers advance and retry until the full
//! count is moved or a terminal error occurs.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::SftpError;

/// The byte-moving seam between the session and the outside world.
/// Production uses `PipeTransport`; tests script a mock.
pub trait Transport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SftpError>;
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SftpError>;
    /// Zero-timeout probe: is a read possible right now?
    fn readable_now(&mut self) -> Result<bool, SftpError>;
}

pub struct PipeTransport {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    timeout: Duration,
    timeout_flag: Arc<AtomicBool>,
}

impl PipeTransport {
    /// Wrap a pair of descriptors (the child's stdout and stdin, or
    /// any duplex socket). Switches both to non-blocking mode.
    pub fn new(
        read_fd: OwnedFd,
        write_fd: OwnedFd,
        timeout: Duration,
        timeout_flag: Arc<AtomicBool>,
    ) -> io::Result<Self> {
        set_nonblocking(read_fd.as_raw_fd())?;
        set_nonblocking(write_fd.as_raw_fd())?;
        Ok(Self {
            read_fd,
            write_fd,
            timeout,
            timeout_flag,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn flag_timeout(&self) -> SftpError {
        self.timeout_flag.store(true, Ordering::SeqCst);
        SftpError::Timeout
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Wait for readiness on one descriptor. `deadline == None` is a
/// zero-timeout probe. Returns false when the wait expired.
fn wait_ready(
    fd: RawFd,
    events: libc::c_short,
    deadline: Option<Instant>,
) -> Result<bool, SftpError> {
    loop {
        let timeout_ms: libc::c_int = match deadline {
            None => 0,
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                (deadline - now).as_millis().clamp(1, i32::MAX as u128) as libc::c_int
            }
        };
        let mut pfd = libc::pollfd {
            fd,
            events,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SftpError::Io(err));
        }
        if rc > 0 {
            return Ok(true);
        }
        if deadline.is_none() {
            return Ok(false);
        }
        // poll timed out; the deadline check at the top of the loop
        // decides whether any time is left
    }
}

impl Transport for PipeTransport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), SftpError> {
        let deadline = Instant::now() + self.timeout;
        let fd = self.write_fd.as_raw_fd();
        let mut offset = 0;
        while offset < buf.len() {
            if !wait_ready(fd, libc::POLLOUT, Some(deadline))? {
                return Err(self.flag_timeout());
            }
            let n = unsafe {
                libc::write(
                    fd,
                    buf[offset..].as_ptr() as *const libc::c_void,
                    buf.len() - offset,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                    Some(libc::EPIPE) => return Err(SftpError::BrokenPipe),
                    Some(libc::ECONNRESET) => return Err(SftpError::ConnectionReset),
                    _ => return Err(SftpError::Io(err)),
                }
            }
            offset += n as usize;
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SftpError> {
        let deadline = Instant::now() + self.timeout;
        let fd = self.read_fd.as_raw_fd();
        let mut offset = 0;
        while offset < buf.len() {
            if !wait_ready(fd, libc::POLLIN, Some(deadline))? {
                return Err(self.flag_timeout());
            }
            let n = unsafe {
                libc::read(
                    fd,
                    buf[offset..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - offset,
                )
            };
            if n == 0 {
                return Err(SftpError::PipeClosed);
            }
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                    Some(libc::ECONNRESET) => return Err(SftpError::ConnectionReset),
                    _ => return Err(SftpError::Io(err)),
                }
            }
            offset += n as usize;
        }
        Ok(())
    }

    fn readable_now(&mut self) -> Result<bool, SftpError> {
        wait_ready(self.read_fd.as_raw_fd(), libc::POLLIN, None)
    }
}
