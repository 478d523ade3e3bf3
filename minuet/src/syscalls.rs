//! Thin wrappers over the raw socket, epoll, and vectored-write syscalls.
//!
//! Everything here returns `io::Result` and leaves `WouldBlock`/`Interrupted`
//! classification to the caller, except `Epoll::wait` which swallows EINTR.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::RawFd;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

pub use libc::epoll_event;

/// Readiness notification mode for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMode {
    /// Level-triggered: one `recv` per ready-event is sufficient.
    Level,
    /// Edge-triggered: reads must drain until `EAGAIN`.
    Edge,
}

/// Interest set for `Epoll::add`/`Epoll::rearm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Set a descriptor to non-blocking mode. Returns the previous flags.
pub fn set_nonblocking(fd: RawFd) -> io::Result<c_int> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(flags)
    }
}

/// Create the listen socket: bind to INADDR_ANY on `port` and listen.
///
/// `SO_REUSEADDR` is always set; `SO_LINGER {1,1}` is set when `linger` is
/// true, `{0,1}` otherwise.
pub fn create_listen_socket(port: u16, linger: bool) -> io::Result<RawFd> {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let tmp = libc::linger {
            l_onoff: if linger { 1 } else { 0 },
            l_linger: 1,
        };
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &tmp as *const _ as *const c_void,
            mem::size_of_val(&tmp) as socklen_t,
        );

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: u32::from_ne_bytes(Ipv4Addr::UNSPECIFIED.octets()),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        Ok(fd)
    }
}

/// Accept one connection. Returns None on `EAGAIN`/`EWOULDBLOCK`.
pub fn accept_connection(listen_fd: RawFd) -> io::Result<Option<(RawFd, SocketAddr)>> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        let fd = libc::accept(
            listen_fd,
            &mut sin as *mut _ as *mut libc::sockaddr,
            &mut len,
        );
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }

        let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
        let port = u16::from_be(sin.sin_port);
        Ok(Some((fd, SocketAddr::V4(SocketAddrV4::new(ip, port)))))
    }
}

/// `recv` into `buf`. WouldBlock surfaces as an error for the caller to
/// classify.
pub fn recv(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    unsafe {
        let n = libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Vectored write: write up to two discontiguous buffers in one syscall.
pub fn writev(fd: RawFd, bufs: &[&[u8]]) -> io::Result<usize> {
    debug_assert!(bufs.len() <= 2);
    let mut iovecs: [libc::iovec; 2] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(2);

    for (i, buf) in bufs.iter().take(iov_count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    unsafe {
        let n = libc::writev(fd, iovecs.as_ptr(), iov_count as c_int);
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

/// Best-effort short message to a socket we are about to close.
pub fn send_best_effort(fd: RawFd, msg: &[u8]) {
    unsafe {
        libc::send(fd, msg.as_ptr() as *const c_void, msg.len(), libc::MSG_NOSIGNAL);
    }
}

pub fn close_fd(fd: RawFd) {
    unsafe {
        libc::close(fd);
    }
}

// ─── Epoll facade ─────────────────────────────────────────────

/// Wrapper over the epoll readiness interface.
///
/// Registration also switches the descriptor to non-blocking; connection
/// descriptors use one-shot so a request in flight on one thread is never
/// concurrently re-armed on another.
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(0);
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd` with the given interest. Token is the descriptor itself.
    pub fn add(
        &self,
        fd: RawFd,
        interest: Interest,
        trigger: TriggerMode,
        one_shot: bool,
    ) -> io::Result<()> {
        let mut event = epoll_event {
            events: event_mask(interest, trigger, one_shot),
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        set_nonblocking(fd)?;
        Ok(())
    }

    /// Re-arm a one-shot descriptor with a (possibly new) interest.
    pub fn rearm(
        &self,
        fd: RawFd,
        interest: Interest,
        trigger: TriggerMode,
        one_shot: bool,
    ) -> io::Result<()> {
        let mut event = epoll_event {
            events: event_mask(interest, trigger, one_shot),
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Wait for readiness events. EINTR is reported as zero events so the
    /// loop can re-check its signal flags.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err);
            }
            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// epoll_ctl on a shared instance is thread-safe; workers re-arm descriptors
// while the loop thread is in epoll_wait.
unsafe impl Send for Epoll {}
unsafe impl Sync for Epoll {}

fn event_mask(interest: Interest, trigger: TriggerMode, one_shot: bool) -> u32 {
    let mut events = match interest {
        Interest::Read => libc::EPOLLIN,
        Interest::Write => libc::EPOLLOUT,
    } | libc::EPOLLRDHUP;
    if trigger == TriggerMode::Edge {
        events |= libc::EPOLLET;
    }
    if one_shot {
        events |= libc::EPOLLONESHOT;
    }
    events as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_combinations() {
        let lt = event_mask(Interest::Read, TriggerMode::Level, false);
        assert_eq!(lt & libc::EPOLLIN as u32, libc::EPOLLIN as u32);
        assert_eq!(lt & libc::EPOLLET as u32, 0);
        assert_eq!(lt & libc::EPOLLONESHOT as u32, 0);

        let et = event_mask(Interest::Write, TriggerMode::Edge, true);
        assert_eq!(et & libc::EPOLLOUT as u32, libc::EPOLLOUT as u32);
        assert_ne!(et & libc::EPOLLET as u32, 0);
        assert_ne!(et & libc::EPOLLONESHOT as u32, 0);
        assert_ne!(et & libc::EPOLLRDHUP as u32, 0);
    }
}
