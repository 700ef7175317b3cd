//! Response assembly
//!
//! Builds the status line, headers, and (for errors) an inline body into the
//! connection's fixed write buffer. A served file is never copied: its
//! mapping rides along as the second element of the gather vector the write
//! path constructs.
//!
//! Every `add_*` helper reports overflow instead of truncating. Overflow of
//! a response head is answered with a 500; overflow of the 500 itself gives
//! up and the connection closes.

use std::fmt::{self, Write};

use crate::conn::Conn;
use crate::parser::HttpCode;
use crate::WRITE_BUF_SIZE;

const OK_200_TITLE: &str = "OK";
const ERROR_400_TITLE: &str = "Bad Request";
const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
const ERROR_403_TITLE: &str = "Forbidden";
const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
const ERROR_404_TITLE: &str = "Not Found";
const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
const ERROR_500_TITLE: &str = "Internal Error";
const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";

/// Bounded formatter over the unused tail of the write buffer
struct Cursor<'a> {
    buf: &'a mut [u8],
    used: usize,
}

impl fmt::Write for Cursor<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.used + s.len() > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.used..self.used + s.len()].copy_from_slice(s.as_bytes());
        self.used += s.len();
        Ok(())
    }
}

impl Conn {
    /// Assemble the response `code` calls for
    ///
    /// Returns false when nothing sendable could be built; the caller
    /// closes the connection.
    pub(crate) fn build_response(&mut self, code: HttpCode) -> bool {
        if self.emit(code) {
            return true;
        }
        // The head outgrew the buffer. Start over with a plain 500.
        self.write_idx = 0;
        self.resolved = None;
        self.emit(HttpCode::InternalError)
    }

    fn emit(&mut self, code: HttpCode) -> bool {
        match code {
            HttpCode::FileRequest => {
                let size = self.resolved.as_ref().map(|r| r.size).unwrap_or(0);
                self.add_status_line(200, OK_200_TITLE) && self.add_headers(size)
            }
            HttpCode::BadRequest => self.emit_error(400, ERROR_400_TITLE, ERROR_400_FORM),
            HttpCode::ForbiddenRequest => self.emit_error(403, ERROR_403_TITLE, ERROR_403_FORM),
            HttpCode::NoResource => self.emit_error(404, ERROR_404_TITLE, ERROR_404_FORM),
            HttpCode::InternalError => self.emit_error(500, ERROR_500_TITLE, ERROR_500_FORM),
            // Nothing to say for the rest; the caller closes.
            _ => false,
        }
    }

    fn emit_error(&mut self, status: u16, title: &str, body: &str) -> bool {
        self.add_status_line(status, title) && self.add_headers(body.len()) && self.add_content(body)
    }

    fn add_response(&mut self, args: fmt::Arguments) -> bool {
        if self.write_idx >= WRITE_BUF_SIZE {
            return false;
        }
        let mut cursor = Cursor {
            buf: &mut self.write_buf[self.write_idx..],
            used: 0,
        };
        if cursor.write_fmt(args).is_err() {
            return false;
        }
        self.write_idx += cursor.used;
        true
    }

    fn add_status_line(&mut self, status: u16, title: &str) -> bool {
        self.add_response(format_args!("HTTP/1.1 {} {}\r\n", status, title))
    }

    fn add_headers(&mut self, content_len: usize) -> bool {
        self.add_content_length(content_len)
            && self.add_content_type()
            && self.add_linger()
            && self.add_blank_line()
    }

    fn add_content_length(&mut self, content_len: usize) -> bool {
        self.add_response(format_args!("Content-Length: {}\r\n", content_len))
    }

    fn add_content_type(&mut self) -> bool {
        self.add_response(format_args!("Content-Type:{}\r\n", "text/html"))
    }

    fn add_linger(&mut self) -> bool {
        self.add_response(format_args!(
            "Connection: {}\r\n",
            if self.keep_alive { "keep-alive" } else { "close" }
        ))
    }

    fn add_blank_line(&mut self) -> bool {
        self.add_response(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.add_response(format_args!("{}", content))
    }

    /// The response bytes assembled so far (head and any inline body)
    pub fn head(&self) -> &[u8] {
        &self.write_buf[..self.write_idx]
    }
}
