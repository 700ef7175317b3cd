//! Incremental HTTP/1.1 request parsing
//!
//! A two-level state machine over the connection's read buffer. The inner
//! machine ([`Conn::parse_line`]) classifies one CRLF-terminated line at a
//! time and tolerates the terminator being split across TCP segments. The
//! outer machine ([`Conn::process_read`]) dispatches completed lines to the
//! request-line, header, and body stages.
//!
//! Parsing is zero-copy: tokens are `(offset, len)` spans into the read
//! buffer, valid until the connection resets.

use log::{trace, warn};

use crate::conn::Conn;
use crate::filemap;

/// Outcome of a parse step, and the response it calls for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// Request incomplete; need more bytes
    NoRequest,
    /// A full request was parsed
    GetRequest,
    /// Malformed request, unsupported method or version
    BadRequest,
    /// Target file does not exist
    NoResource,
    /// Target file is not world-readable
    ForbiddenRequest,
    /// Target file resolved and mapped
    FileRequest,
    /// The server tripped over itself
    InternalError,
    /// Peer closed the connection
    ClosedConnection,
}

/// Which part of the request the outer machine is consuming
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CheckState {
    RequestLine,
    Header,
    Content,
}

/// Classification of one scan for a line terminator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineStatus {
    /// A full line ends (exclusive) at the carried offset
    Complete(usize),
    /// No terminator yet; wait for more bytes
    Open,
    /// A bare CR or LF where it cannot be part of CRLF
    Bad,
}

/// Request methods this parser recognizes
///
/// Only GET is served; the rest parse far enough to be refused cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Options,
    Connect,
}

impl Method {
    fn from_token(token: &[u8]) -> Option<Method> {
        const TABLE: [(&[u8], Method); 8] = [
            (b"GET", Method::Get),
            (b"POST", Method::Post),
            (b"HEAD", Method::Head),
            (b"PUT", Method::Put),
            (b"DELETE", Method::Delete),
            (b"TRACE", Method::Trace),
            (b"OPTIONS", Method::Options),
            (b"CONNECT", Method::Connect),
        ];
        TABLE
            .iter()
            .find(|(name, _)| token.eq_ignore_ascii_case(name))
            .map(|&(_, m)| m)
    }
}

/// A token's position inside the read buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Span {
    pub start: usize,
    pub len: usize,
}

impl Span {
    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.start + self.len]
    }
}

fn is_ws(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

/// Leading space/tab count of `s`
fn skip_ws(s: &[u8]) -> usize {
    s.iter().take_while(|&&b| is_ws(b)).count()
}

/// Case-insensitive prefix test
fn has_prefix(s: &[u8], prefix: &[u8]) -> bool {
    s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Parse the leading decimal digits of `s`, like atol
fn parse_decimal(s: &[u8]) -> usize {
    let mut n: usize = 0;
    for &b in s {
        if !b.is_ascii_digit() {
            break;
        }
        n = n.saturating_mul(10).saturating_add((b - b'0') as usize);
    }
    n
}

impl Conn {
    /// The inner machine: scan for one CRLF
    ///
    /// Scans `[checked_idx, read_idx)`. A CR as the last buffered byte is
    /// [`LineStatus::Open`] (the LF may still be in flight) and the scan
    /// resumes at that CR after the next read. On a complete line
    /// `checked_idx` moves past the terminator and the returned offset
    /// excludes it.
    pub(crate) fn parse_line(&mut self) -> LineStatus {
        while self.checked_idx < self.read_idx {
            match self.read_buf[self.checked_idx] {
                b'\r' => {
                    if self.checked_idx + 1 == self.read_idx {
                        return LineStatus::Open;
                    }
                    if self.read_buf[self.checked_idx + 1] == b'\n' {
                        let end = self.checked_idx;
                        self.checked_idx += 2;
                        return LineStatus::Complete(end);
                    }
                    return LineStatus::Bad;
                }
                b'\n' => {
                    if self.checked_idx > self.start_line
                        && self.read_buf[self.checked_idx - 1] == b'\r'
                    {
                        let end = self.checked_idx - 1;
                        self.checked_idx += 1;
                        return LineStatus::Complete(end);
                    }
                    return LineStatus::Bad;
                }
                _ => self.checked_idx += 1,
            }
        }
        LineStatus::Open
    }

    /// The outer machine: consume whatever complete lines are buffered
    ///
    /// Returns [`HttpCode::NoRequest`] when the buffered bytes run out
    /// mid-request; the worker then re-arms for readable and the next drain
    /// resumes exactly where this left off.
    pub fn process_read(&mut self, doc_root: &str) -> HttpCode {
        loop {
            if self.check_state == CheckState::Content {
                // The body is not line-structured; completion is a byte count.
                self.start_line = self.checked_idx;
                if self.parse_content() == HttpCode::GetRequest {
                    return self.do_request(doc_root);
                }
                return HttpCode::NoRequest;
            }

            let line_end = match self.parse_line() {
                LineStatus::Complete(end) => end,
                LineStatus::Open => return HttpCode::NoRequest,
                LineStatus::Bad => return HttpCode::BadRequest,
            };
            let line = Span {
                start: self.start_line,
                len: line_end - self.start_line,
            };
            self.start_line = self.checked_idx;
            trace!(
                "line: {:?}",
                String::from_utf8_lossy(line.slice(&self.read_buf))
            );

            match self.check_state {
                CheckState::RequestLine => {
                    if self.parse_request_line(line) == HttpCode::BadRequest {
                        return HttpCode::BadRequest;
                    }
                }
                CheckState::Header => match self.parse_headers(line) {
                    HttpCode::BadRequest => return HttpCode::BadRequest,
                    HttpCode::GetRequest => return self.do_request(doc_root),
                    _ => {}
                },
                CheckState::Content => unreachable!("content handled above"),
            }
        }
    }

    /// `GET /index.html HTTP/1.1`
    ///
    /// Splits method, URL and version on single space/tab separators, the
    /// way the wire format prescribes. An absolute-form URL
    /// (`http://host/path`) is reduced to its path.
    fn parse_request_line(&mut self, line: Span) -> HttpCode {
        let text = line.slice(&self.read_buf);

        let method_end = match text.iter().position(|&b| is_ws(b)) {
            Some(p) => p,
            None => return HttpCode::BadRequest,
        };
        let method = match Method::from_token(&text[..method_end]) {
            Some(m) => m,
            None => return HttpCode::BadRequest,
        };
        self.method = method;
        if method != Method::Get {
            return HttpCode::BadRequest;
        }

        let rest = &text[method_end + 1..];
        let url_end = match rest.iter().position(|&b| is_ws(b)) {
            Some(p) => p,
            None => return HttpCode::BadRequest,
        };
        let version = &rest[url_end + 1..];
        if !version.eq_ignore_ascii_case(b"HTTP/1.1") {
            return HttpCode::BadRequest;
        }

        let mut url = &rest[..url_end];
        let mut url_off = method_end + 1;
        if has_prefix(url, b"http://") {
            url = &url[7..];
            url_off += 7;
            match url.iter().position(|&b| b == b'/') {
                Some(p) => {
                    url = &url[p..];
                    url_off += p;
                }
                None => return HttpCode::BadRequest,
            }
        }
        if url.first() != Some(&b'/') {
            return HttpCode::BadRequest;
        }

        self.url = Span {
            start: line.start + url_off,
            len: url.len(),
        };
        self.version = Span {
            start: line.start + method_end + 1 + url_end + 1,
            len: version.len(),
        };
        self.check_state = CheckState::Header;
        HttpCode::NoRequest
    }

    /// One header line, or the empty line that ends the header block
    fn parse_headers(&mut self, line: Span) -> HttpCode {
        if line.len == 0 {
            // Header block done. A declared body moves us to CONTENT.
            if self.content_length > 0 {
                self.check_state = CheckState::Content;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        let text = line.slice(&self.read_buf);
        if has_prefix(text, b"Connection:") {
            let rest = &text[11..];
            let value = &rest[skip_ws(rest)..];
            if value.eq_ignore_ascii_case(b"keep-alive") {
                self.keep_alive = true;
            }
        } else if has_prefix(text, b"Content-Length:") {
            let rest = &text[15..];
            self.content_length = parse_decimal(&rest[skip_ws(rest)..]);
        } else if has_prefix(text, b"Host:") {
            let rest = &text[5..];
            let ws = skip_ws(rest);
            self.host = Span {
                start: line.start + 5 + ws,
                len: rest.len() - ws,
            };
        } else {
            warn!(
                "ignoring unknown header: {:?}",
                String::from_utf8_lossy(text)
            );
        }
        HttpCode::NoRequest
    }

    /// Body completeness check; the body itself is never inspected
    fn parse_content(&mut self) -> HttpCode {
        // content_length saturates when parsed, so the comparison must too.
        if self.read_idx >= self.content_length.saturating_add(self.checked_idx) {
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }

    /// A complete request arrived; resolve and map the target file
    fn do_request(&mut self, doc_root: &str) -> HttpCode {
        let url = self.url;
        filemap::resolve(
            doc_root,
            url.slice(&self.read_buf),
            &mut self.path_buf,
            &mut self.resolved,
        )
    }
}
