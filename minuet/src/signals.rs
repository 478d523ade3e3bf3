//! Signal bridge: a connected socket pair turns signals into loop events.
//!
//! The handler runs with the full signal mask blocked and does nothing but
//! write the signal number into the pipe; async-signal-safety forbids
//! touching the timer list or the logger from handler context. The read end
//! is registered with the reactor level-triggered and drained by the loop.

use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};

use libc::{c_int, c_void};

/// Write end of the self-pipe, reachable from handler context.
static SIG_PIPE_WRITE: AtomicI32 = AtomicI32::new(-1);

extern "C" fn signal_handler(sig: c_int) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let fd = SIG_PIPE_WRITE.load(Ordering::Relaxed);
    if fd >= 0 {
        let msg = sig as u8;
        unsafe {
            libc::send(fd, &msg as *const u8 as *const c_void, 1, 0);
        }
    }
    unsafe {
        *libc::__errno_location() = saved_errno;
    }
}

/// Owns the socket pair and the installed handlers.
pub struct SignalBridge {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl SignalBridge {
    /// Create the pipe and install handlers for SIGALRM and SIGTERM.
    /// SIGPIPE is ignored so a peer reset never kills the process.
    pub fn install() -> io::Result<Self> {
        let mut fds = [0 as c_int; 2];
        unsafe {
            if libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        let (read_fd, write_fd) = (fds[0], fds[1]);

        crate::syscalls::set_nonblocking(write_fd)?;
        crate::syscalls::set_nonblocking(read_fd)?;
        SIG_PIPE_WRITE.store(write_fd, Ordering::SeqCst);

        add_signal(libc::SIGALRM, SigDisposition::Handled)?;
        add_signal(libc::SIGTERM, SigDisposition::Handled)?;
        add_signal(libc::SIGPIPE, SigDisposition::Ignored)?;

        Ok(Self { read_fd, write_fd })
    }

    /// Descriptor the event loop registers for readiness (level-triggered).
    pub fn read_fd(&self) -> RawFd {
        self.read_fd
    }

    /// Drain pending signal bytes and invoke `on_sig` for each. Returns
    /// false when the read failed or returned nothing.
    pub fn drain(&self, mut on_sig: impl FnMut(i32)) -> bool {
        let mut signals = [0u8; 1024];
        let n = unsafe {
            libc::recv(
                self.read_fd,
                signals.as_mut_ptr() as *mut c_void,
                signals.len(),
                0,
            )
        };
        if n <= 0 {
            return false;
        }
        for &sig in &signals[..n as usize] {
            on_sig(sig as i32);
        }
        true
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        SIG_PIPE_WRITE.store(-1, Ordering::SeqCst);
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

enum SigDisposition {
    Handled,
    Ignored,
}

fn add_signal(sig: c_int, disposition: SigDisposition) -> io::Result<()> {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = match disposition {
            SigDisposition::Handled => signal_handler as usize,
            SigDisposition::Ignored => libc::SIG_IGN,
        };
        libc::sigfillset(&mut sa.sa_mask);
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Arm (or re-arm) the periodic SIGALRM used to drive timer ticks.
pub fn schedule_alarm(secs: u32) {
    unsafe {
        libc::alarm(secs);
    }
}
