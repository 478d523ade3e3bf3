//! Response emitter: header assembly plus the scatter-gather write loop.
//!
//! File bodies are never copied into the write buffer; the gather vector
//! pairs the header bytes with the mapped file, and partial-write state is
//! carried in `bytes_sent`/`bytes_to_send` across readiness events.

use crate::conn::{Connection, WRITE_BUFFER_SIZE};
use crate::parser::HttpCode;
use crate::syscalls;

const OK_200_TITLE: &str = "OK";
const ERROR_400_TITLE: &str = "Bad Request";
const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
const ERROR_403_TITLE: &str = "Forbidden";
const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
const ERROR_404_TITLE: &str = "Not Found";
const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_TITLE: &str = "Internal Error";
const ERROR_500_FORM: &str = "There was an unusual problem serving the request file.\n";

/// Body used for a zero-length regular file.
const EMPTY_PAGE: &str = "<html><body></body></html>";

/// What the emission loop wants from its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Kernel buffer full; re-arm for write readiness and come back.
    Again,
    /// Everything sent. Keep-alive decides reset-and-rearm vs close.
    Complete { keep_alive: bool },
    /// Hard write failure; close the connection.
    Error,
}

impl Connection {
    /// Build the response for a parser/handler outcome into the write
    /// buffer. Returns false only if the buffer cannot hold the headers.
    pub fn process_write(&mut self, code: HttpCode) -> bool {
        let ok = match code {
            HttpCode::InternalError => self.error_page(500, ERROR_500_TITLE, ERROR_500_FORM),
            HttpCode::BadRequest => self.error_page(400, ERROR_400_TITLE, ERROR_400_FORM),
            HttpCode::ForbiddenRequest => self.error_page(403, ERROR_403_TITLE, ERROR_403_FORM),
            HttpCode::NoResource => self.error_page(404, ERROR_404_TITLE, ERROR_404_FORM),
            HttpCode::FileRequest => {
                if self.file_len != 0 {
                    if !(self.add_status_line(200, OK_200_TITLE)
                        && self.add_headers(self.file_len))
                    {
                        return false;
                    }
                    self.iov_count = 2;
                    self.bytes_to_send = self.write_buf.len() + self.file_len;
                    self.bytes_sent = 0;
                    return true;
                }
                self.add_status_line(200, OK_200_TITLE)
                    && self.add_headers(EMPTY_PAGE.len())
                    && self.add_content(EMPTY_PAGE)
            }
            _ => false,
        };
        if !ok {
            return false;
        }

        self.iov_count = 1;
        self.bytes_to_send = self.write_buf.len();
        self.bytes_sent = 0;
        true
    }

    /// Drive the gather write until done or the socket pushes back.
    pub fn write(&mut self) -> WriteOutcome {
        if self.bytes_to_send == 0 {
            // Spurious write readiness with nothing staged.
            return WriteOutcome::Complete { keep_alive: true };
        }

        loop {
            let header_len = self.write_buf.len();
            let header_rest: &[u8] = if self.bytes_sent < header_len {
                &self.write_buf[self.bytes_sent..]
            } else {
                &[]
            };

            let result = if self.iov_count == 2 {
                let file_off = self.bytes_sent.saturating_sub(header_len);
                let file_rest = match &self.file_map {
                    Some(map) => &map[file_off..self.file_len],
                    None => &[],
                };
                if header_rest.is_empty() {
                    syscalls::writev(self.fd, &[file_rest])
                } else {
                    syscalls::writev(self.fd, &[header_rest, file_rest])
                }
            } else {
                syscalls::writev(self.fd, &[header_rest])
            };

            match result {
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return WriteOutcome::Again;
                }
                Err(_) => {
                    self.unmap();
                    return WriteOutcome::Error;
                }
                Ok(n) => {
                    self.bytes_sent += n;
                    self.bytes_to_send -= n.min(self.bytes_to_send);
                    if self.bytes_to_send == 0 {
                        self.unmap();
                        return WriteOutcome::Complete {
                            keep_alive: self.keep_alive,
                        };
                    }
                }
            }
        }
    }

    /// Clear any half-built response so a fallback can be staged.
    pub(crate) fn reset_write(&mut self) {
        self.write_buf.clear();
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
        self.iov_count = 0;
        self.unmap();
    }

    fn error_page(&mut self, status: u16, title: &str, form: &str) -> bool {
        self.add_status_line(status, title) && self.add_headers(form.len()) && self.add_content(form)
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(&format!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_content_length(content_len) && self.add_linger() && self.add_blank_line()
    }

    fn add_content_length(&mut self, content_len: usize) -> bool {
        self.add_response(&format!("Content-Length: {}\r\n", content_len))
    }

    fn add_linger(&mut self) -> bool {
        let value = if self.keep_alive { "keep-alive" } else { "close" };
        self.add_response(&format!("Connection: {}\r\n", value))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response("\r\n")
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(content)
    }

    fn add_response(&mut self, text: &str) -> bool {
        if self.write_buf.len() + text.len() > WRITE_BUFFER_SIZE {
            return false;
        }
        self.write_buf.extend_from_slice(text.as_bytes());
        true
    }

    /// Remaining gather-vector lengths `(headers, file)`.
    #[cfg(test)]
    pub(crate) fn iov_lens(&self) -> (usize, usize) {
        let header_len = self.write_buf.len();
        let header_rest = header_len.saturating_sub(self.bytes_sent);
        let file_rest = if self.iov_count == 2 {
            self.file_len - self.bytes_sent.saturating_sub(header_len).min(self.file_len)
        } else {
            0
        };
        (header_rest, file_rest)
    }
}
