//! Per-connection state: buffers, parser cursors, and response bookkeeping.
//!
//! A `Connection` is owned by its slot for the lifetime of the descriptor
//! and reset in place between keep-alive requests. Parsed fields (url,
//! version, host, body) are offset spans into the owned read buffer, never
//! pointers.

use std::net::SocketAddr;
use std::ops::Range;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;

use crate::parser::{CheckState, Method};
use crate::syscalls::{self, TriggerMode};

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

pub struct Connection {
    pub(crate) fd: RawFd,
    pub(crate) peer: SocketAddr,
    pub(crate) trigger: TriggerMode,
    pub(crate) doc_root: Arc<PathBuf>,

    // Read side: incremental parser state over the recv buffer.
    pub(crate) read_buf: Box<[u8]>,
    pub(crate) read_idx: usize,
    pub(crate) checked_idx: usize,
    pub(crate) start_line: usize,
    pub(crate) line_end: usize,
    pub(crate) state: CheckState,
    pub(crate) method: Method,
    pub(crate) url_span: Option<Range<usize>>,
    pub(crate) url_override: Option<&'static str>,
    pub(crate) version_span: Option<Range<usize>>,
    pub(crate) host_span: Option<Range<usize>>,
    pub(crate) content_length: usize,
    pub(crate) keep_alive: bool,
    pub(crate) body_span: Option<Range<usize>>,
    pub(crate) cgi: bool,

    // Write side: header buffer plus the mapped file body.
    pub(crate) write_buf: Vec<u8>,
    pub(crate) bytes_to_send: usize,
    pub(crate) bytes_sent: usize,
    pub(crate) file_map: Option<Mmap>,
    pub(crate) file_len: usize,
    pub(crate) iov_count: usize,
}

impl Connection {
    pub fn new(fd: RawFd, peer: SocketAddr, trigger: TriggerMode, doc_root: Arc<PathBuf>) -> Self {
        let mut conn = Self {
            fd,
            peer,
            trigger,
            doc_root,
            read_buf: vec![0u8; READ_BUFFER_SIZE].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            line_end: 0,
            state: CheckState::RequestLine,
            method: Method::Get,
            url_span: None,
            url_override: None,
            version_span: None,
            host_span: None,
            content_length: 0,
            keep_alive: false,
            body_span: None,
            cgi: false,
            write_buf: Vec::with_capacity(WRITE_BUFFER_SIZE),
            bytes_to_send: 0,
            bytes_sent: 0,
            file_map: None,
            file_len: 0,
            iov_count: 0,
        };
        conn.reset();
        conn
    }

    /// Reset for the next request. Identity fields (descriptor, peer,
    /// trigger, document root) survive; everything else returns to the
    /// state of a brand-new connection.
    pub fn reset(&mut self) {
        self.read_buf.fill(0);
        self.read_idx = 0;
        self.checked_idx = 0;
        self.start_line = 0;
        self.line_end = 0;
        self.state = CheckState::RequestLine;
        self.method = Method::Get;
        self.url_span = None;
        self.url_override = None;
        self.version_span = None;
        self.host_span = None;
        self.content_length = 0;
        self.keep_alive = false;
        self.body_span = None;
        self.cgi = false;
        self.write_buf.clear();
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.file_map = None;
        self.file_len = 0;
        self.iov_count = 0;
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// The request target, with the `/` → `/judge.html` rewrite applied.
    pub fn url(&self) -> &str {
        if let Some(o) = self.url_override {
            return o;
        }
        self.span_str(&self.url_span)
    }

    pub fn version(&self) -> &str {
        self.span_str(&self.version_span)
    }

    pub fn host(&self) -> Option<&str> {
        self.host_span.as_ref().map(|r| {
            std::str::from_utf8(&self.read_buf[r.clone()]).unwrap_or("")
        })
    }

    pub fn body_bytes(&self) -> &[u8] {
        match &self.body_span {
            Some(r) => &self.read_buf[r.clone()],
            None => &[],
        }
    }

    fn span_str(&self, span: &Option<Range<usize>>) -> &str {
        match span {
            Some(r) => std::str::from_utf8(&self.read_buf[r.clone()]).unwrap_or(""),
            None => "",
        }
    }

    /// Pull bytes off the socket into the read buffer.
    ///
    /// Level-triggered: a single `recv` per ready-event. Edge-triggered:
    /// drain until `EAGAIN`. Returns false on EOF or a hard error.
    pub fn read_once(&mut self) -> bool {
        if self.read_idx >= READ_BUFFER_SIZE {
            return false;
        }

        match self.trigger {
            TriggerMode::Level => {
                let idx = self.read_idx;
                match syscalls::recv(self.fd, &mut self.read_buf[idx..]) {
                    Ok(0) => false,
                    Ok(n) => {
                        self.read_idx += n;
                        true
                    }
                    Err(_) => false,
                }
            }
            TriggerMode::Edge => loop {
                if self.read_idx >= READ_BUFFER_SIZE {
                    // Full buffer; let the parser decide whether this is an
                    // oversize request.
                    return true;
                }
                let idx = self.read_idx;
                match syscalls::recv(self.fd, &mut self.read_buf[idx..]) {
                    Ok(0) => return false,
                    Ok(n) => self.read_idx += n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return true,
                    Err(_) => return false,
                }
            },
        }
    }

    /// Drop the file mapping, if any.
    pub(crate) fn unmap(&mut self) {
        self.file_map = None;
        self.file_len = 0;
    }

    /// Test constructor: no real socket behind the descriptor.
    #[cfg(test)]
    pub(crate) fn for_tests(doc_root: Arc<PathBuf>) -> Self {
        Self::new(-1, test_peer(), TriggerMode::Level, doc_root)
    }

    /// Test helper: load raw request bytes as if they had been received.
    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) {
        let end = self.read_idx + bytes.len();
        assert!(end <= READ_BUFFER_SIZE, "test input exceeds read buffer");
        self.read_buf[self.read_idx..end].copy_from_slice(bytes);
        self.read_idx = end;
    }
}

#[cfg(test)]
pub(crate) fn test_peer() -> SocketAddr {
    use std::net::{Ipv4Addr, SocketAddrV4};
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000))
}
