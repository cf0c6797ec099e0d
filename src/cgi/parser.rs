//! Incremental parser for CGI script output.
//!
//! ```text
//!   Header ──Content-Length──▶ Body(Length) ──▶ Done
//!     │
//!     └──────(no length)─────▶ Body(Chunked) ──EOF──▶ Done
//!
//!   any state ──▶ Error (status 500)
//! ```
//!
//! The parser never re-chunks: in streaming mode it only hands over whatever
//! bytes arrived. Framing for the client is the builder's job.

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use crate::http::parser::{find_subsequence, is_tchar};
use crate::http::response::StatusCode;

/// Header block larger than this without a terminator is an error.
pub const MAX_CGI_HEADER: usize = 8192;
/// Longest single header line.
pub const MAX_CGI_HEADER_LINE: usize = 1000;
/// Largest declared `Content-Length` accepted from a script.
pub const MAX_CGI_BODY: usize = 1024 * 1024;

/// How the script's body is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Exactly this many bytes follow the header block.
    Length(usize),
    /// Unknown length; the body ends when the script closes stdout.
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiParseState {
    Header,
    Body(Framing),
    Done,
    Error,
}

#[derive(Debug)]
pub struct CgiParser {
    state: CgiParseState,
    status: StatusCode,
    status_seen: bool,
    buffer: BytesMut,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Default for CgiParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CgiParser {
    pub fn new() -> Self {
        Self {
            state: CgiParseState::Header,
            status: StatusCode::OK,
            status_seen: false,
            buffer: BytesMut::new(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Advances as far as the buffered output allows.
    ///
    /// Returns `true` when there is something for the builder: the parse
    /// finished (successfully or not) or a streaming body is in progress.
    pub fn parse(&mut self, eof: bool) -> bool {
        if self.buffer.is_empty() && !eof {
            return self.is_done();
        }

        if self.state == CgiParseState::Header {
            self.parse_headers();
        }
        if let CgiParseState::Body(Framing::Length(len)) = self.state {
            self.parse_body(len, eof);
        }
        if self.is_streaming() {
            self.parse_streamed_body(eof);
        }
        if eof && self.state == CgiParseState::Header {
            debug!("cgi output ended inside the header block");
            self.set_error();
        }

        self.is_done() || self.is_streaming()
    }

    pub fn state(&self) -> CgiParseState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, CgiParseState::Done | CgiParseState::Error)
    }

    pub fn is_streaming(&self) -> bool {
        self.state == CgiParseState::Body(Framing::Chunked)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Hands over the body parsed so far, leaving it empty.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    fn parse_headers(&mut self) {
        let (end, terminator) = match find_subsequence(&self.buffer, b"\r\n\r\n") {
            Some(pos) => (pos, 4),
            None => match find_subsequence(&self.buffer, b"\n\n") {
                Some(pos) => (pos, 2),
                None => {
                    if self.buffer.len() > MAX_CGI_HEADER {
                        warn!(size = self.buffer.len(), "cgi header block too large");
                        self.set_error();
                    }
                    return;
                }
            },
        };

        let block = self.buffer.split_to(end);
        self.buffer.advance(terminator);

        let Ok(text) = std::str::from_utf8(&block) else {
            warn!("cgi header block is not valid utf-8");
            self.set_error();
            return;
        };
        for line in text.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() {
                break;
            }
            if !self.parse_header_line(line) {
                warn!(line, "invalid cgi header line");
                self.set_error();
                return;
            }
        }

        if self.header("Content-Type").is_none() {
            warn!("cgi output has no Content-Type");
            self.set_error();
            return;
        }

        if self.status == StatusCode::OK && self.header("Location").is_some() {
            self.set_status(StatusCode::FOUND);
        }

        // Framing is decided here; a script's own Transfer-Encoding is dropped.
        if self.header("Transfer-Encoding").is_some() {
            debug!("dropping Transfer-Encoding from cgi output");
            self.headers
                .retain(|(k, _)| !k.eq_ignore_ascii_case("Transfer-Encoding"));
        }

        let declared = self.header("Content-Length").map(str::to_string);
        match declared {
            Some(value) => match value.parse::<usize>() {
                Ok(len) if len <= MAX_CGI_BODY => {
                    self.state = CgiParseState::Body(Framing::Length(len));
                }
                _ => {
                    warn!(value = %value, "bad cgi Content-Length");
                    self.set_error();
                }
            },
            None => {
                self.headers
                    .push(("Transfer-Encoding".to_string(), "chunked".to_string()));
                self.state = CgiParseState::Body(Framing::Chunked);
            }
        }
    }

    fn parse_header_line(&mut self, line: &str) -> bool {
        if line.len() > MAX_CGI_HEADER_LINE || line.starts_with(|c: char| c.is_whitespace()) {
            return false;
        }
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        if name.is_empty() || !name.bytes().all(is_tchar) {
            return false;
        }

        let value = value.trim();
        if name.eq_ignore_ascii_case("Status") {
            let code = value.split_whitespace().next().unwrap_or("");
            return match code.parse::<u16>().ok().and_then(StatusCode::from_u16) {
                Some(status) => {
                    if !self.status_seen {
                        self.status_seen = true;
                        self.set_status(status);
                    }
                    true
                }
                None => false,
            };
        }

        if !value.is_empty() {
            self.headers.push((name.to_string(), value.to_string()));
        }
        true
    }

    fn parse_body(&mut self, len: usize, eof: bool) {
        if len == 0 {
            self.state = CgiParseState::Done;
            return;
        }
        if self.buffer.len() < len {
            if eof {
                warn!(expected = len, got = self.buffer.len(), "cgi body truncated");
                self.set_error();
            }
            return;
        }
        if self.buffer.len() > len {
            warn!(
                expected = len,
                got = self.buffer.len(),
                "cgi output exceeds declared Content-Length"
            );
        }
        self.body = self.buffer.split_to(len).to_vec();
        self.buffer.clear();
        self.state = CgiParseState::Done;
    }

    fn parse_streamed_body(&mut self, eof: bool) {
        if !self.buffer.is_empty() {
            self.body.extend_from_slice(&self.buffer);
            self.buffer.clear();
        }
        if eof {
            self.state = CgiParseState::Done;
        }
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 500 is never downgraded.
    fn set_status(&mut self, status: StatusCode) {
        if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            return;
        }
        self.status = status;
    }

    fn set_error(&mut self) {
        self.state = CgiParseState::Error;
        self.status = StatusCode::INTERNAL_SERVER_ERROR;
    }
}
