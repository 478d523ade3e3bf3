//! Incremental HTTP/1.1 request parser.
//!
//! A three-state machine (request line → headers → body) driven by a
//! line-scanning sub-machine over the recv buffer. Parsing is restartable:
//! feeding the same bytes in any slicing across `recv` calls yields the same
//! parsed fields.

use crate::conn::{Connection, READ_BUFFER_SIZE};

/// Main parser state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    RequestLine,
    Header,
    Content,
}

/// Result of scanning for one CRLF-terminated line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete line is available.
    Ok,
    /// More bytes are needed.
    Open,
    /// A bare CR or LF was found.
    Bad,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Parser/handler outcome codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Need more bytes.
    NoRequest,
    /// Parsing done; run the handler.
    GetRequest,
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    InternalError,
    ClosedConnection,
}

impl Connection {
    /// Scan for the next complete line, advancing `checked_idx`.
    ///
    /// On `Ok` the line content (CRLF excluded) is `start_line..line_end`
    /// and `checked_idx` has stepped past the terminator.
    pub(crate) fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            let b = self.read_buf[self.checked_idx];
            if b == b'\r' {
                if self.checked_idx + 1 == self.read_idx {
                    return LineStatus::Open;
                }
                if self.read_buf[self.checked_idx + 1] == b'\n' {
                    self.line_end = self.checked_idx;
                    self.checked_idx += 2;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            } else if b == b'\n' {
                if self.checked_idx > 1 && self.read_buf[self.checked_idx - 1] == b'\r' {
                    self.line_end = self.checked_idx - 1;
                    self.checked_idx += 1;
                    return LineStatus::Ok;
                }
                return LineStatus::Bad;
            }
            self.checked_idx += 1;
        }
        LineStatus::Open
    }

    /// Run the state machine over whatever is buffered.
    pub fn process_read(&mut self) -> HttpCode {
        loop {
            if self.state == CheckState::Content {
                let ret = self.parse_content();
                if ret == HttpCode::GetRequest {
                    return HttpCode::GetRequest;
                }
                return HttpCode::NoRequest;
            }

            match self.parse_line() {
                LineStatus::Open => {
                    if self.read_idx >= READ_BUFFER_SIZE {
                        // A full buffer without a complete line is an
                        // oversize request, not a wait.
                        return HttpCode::BadRequest;
                    }
                    return HttpCode::NoRequest;
                }
                LineStatus::Bad => return HttpCode::BadRequest,
                LineStatus::Ok => {}
            }

            let line = self.start_line..self.line_end;
            self.start_line = self.checked_idx;
            tracing::trace!(
                line = %String::from_utf8_lossy(&self.read_buf[line.clone()]),
                "parsed line"
            );

            match self.state {
                CheckState::RequestLine => {
                    if self.parse_request_line(line) == HttpCode::BadRequest {
                        return HttpCode::BadRequest;
                    }
                }
                CheckState::Header => match self.parse_headers(line) {
                    HttpCode::BadRequest => return HttpCode::BadRequest,
                    HttpCode::GetRequest => return HttpCode::GetRequest,
                    _ => {}
                },
                CheckState::Content => unreachable!("content handled above"),
            }
        }
    }

    /// Split the request line into method, target, and version.
    fn parse_request_line(&mut self, line: std::ops::Range<usize>) -> HttpCode {
        let Some((method, mut url, version)) = split_request_line(&self.read_buf, &line) else {
            return HttpCode::BadRequest;
        };

        let method_bytes = &self.read_buf[method];
        if method_bytes.eq_ignore_ascii_case(b"GET") {
            self.method = Method::Get;
        } else if method_bytes.eq_ignore_ascii_case(b"POST") {
            self.method = Method::Post;
            self.cgi = true;
        } else {
            return HttpCode::BadRequest;
        }

        if !self.read_buf[version.clone()].eq_ignore_ascii_case(b"HTTP/1.1") {
            return HttpCode::BadRequest;
        }

        // Strip an absolute-form scheme down to the path.
        for prefix in [&b"http://"[..], &b"https://"[..]] {
            let bytes = &self.read_buf[url.clone()];
            if bytes.len() >= prefix.len() && bytes[..prefix.len()].eq_ignore_ascii_case(prefix) {
                match bytes[prefix.len()..].iter().position(|&b| b == b'/') {
                    Some(p) => url = (url.start + prefix.len() + p)..url.end,
                    None => return HttpCode::BadRequest,
                }
            }
        }

        if url.is_empty() || self.read_buf[url.start] != b'/' {
            return HttpCode::BadRequest;
        }
        if url.len() == 1 {
            self.url_override = Some("/judge.html");
        }

        self.url_span = Some(url);
        self.version_span = Some(version);
        self.state = CheckState::Header;
        HttpCode::NoRequest
    }

    /// Classify one header line; an empty line terminates the header block.
    fn parse_headers(&mut self, line: std::ops::Range<usize>) -> HttpCode {
        if line.is_empty() {
            if self.content_length != 0 {
                if self.checked_idx + self.content_length > READ_BUFFER_SIZE {
                    // The body can never fit; reject instead of waiting.
                    return HttpCode::BadRequest;
                }
                self.state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        if let Some(value) = header_value(&self.read_buf, &line, b"Connection:") {
            if self.read_buf[value].eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if let Some(value) = header_value(&self.read_buf, &line, b"Content-Length:") {
            self.content_length = std::str::from_utf8(&self.read_buf[value])
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(0);
        } else if let Some(value) = header_value(&self.read_buf, &line, b"Host:") {
            self.host_span = Some(value);
        } else {
            tracing::debug!(
                header = %String::from_utf8_lossy(&self.read_buf[line]),
                "ignoring unknown header"
            );
        }
        HttpCode::NoRequest
    }

    /// The body is complete once `read_idx` covers `content_length` bytes
    /// past the header terminator.
    fn parse_content(&mut self) -> HttpCode {
        if self.read_idx >= self.content_length + self.checked_idx {
            let start = self.checked_idx;
            self.body_span = Some(start..start + self.content_length);
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }
}

/// Tokenize `METHOD TARGET VERSION` on spaces/tabs. Returns absolute spans.
fn split_request_line(
    buf: &[u8],
    line: &std::ops::Range<usize>,
) -> Option<(
    std::ops::Range<usize>,
    std::ops::Range<usize>,
    std::ops::Range<usize>,
)> {
    let mut i = line.start;
    let end = line.end;

    let method_start = i;
    while i < end && buf[i] != b' ' && buf[i] != b'\t' {
        i += 1;
    }
    if i >= end {
        return None;
    }
    let method = method_start..i;

    while i < end && (buf[i] == b' ' || buf[i] == b'\t') {
        i += 1;
    }
    let url_start = i;
    while i < end && buf[i] != b' ' && buf[i] != b'\t' {
        i += 1;
    }
    if i >= end {
        return None;
    }
    let url = url_start..i;

    while i < end && (buf[i] == b' ' || buf[i] == b'\t') {
        i += 1;
    }
    if i >= end {
        return None;
    }
    let version = i..end;

    Some((method, url, version))
}

/// Case-insensitive header prefix match; returns the absolute value span
/// with leading spaces/tabs skipped.
fn header_value(
    buf: &[u8],
    line: &std::ops::Range<usize>,
    name: &[u8],
) -> Option<std::ops::Range<usize>> {
    let bytes = &buf[line.clone()];
    if bytes.len() < name.len() || !bytes[..name.len()].eq_ignore_ascii_case(name) {
        return None;
    }
    let mut i = line.start + name.len();
    while i < line.end && (buf[i] == b' ' || buf[i] == b'\t') {
        i += 1;
    }
    Some(i..line.end)
}
