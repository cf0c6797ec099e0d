use bytes::{Buf, BytesMut};

use crate::http::request::{split_target, Method, Request};
use crate::http::response::StatusCode;

/// Longest accepted request line.
pub const MAX_REQUEST_LINE: usize = 8 * 1024;
/// Longest accepted request-target.
pub const MAX_TARGET: usize = 2 * 1024;
/// Largest accepted header block, request line included.
pub const MAX_HEADER_BLOCK: usize = 16 * 1024;
/// Hard cap on a decoded request body.
pub const MAX_BODY: usize = 10 * 1024 * 1024;
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    InvalidRequest,
    InvalidMethod,
    UnsupportedMethod,
    UnsupportedVersion,
    UriTooLong,
    InvalidHeader,
    HeaderTooLarge,
    MissingHost,
    InvalidContentLength,
    UnsupportedTransferEncoding,
    BodyTooLarge,
    Incomplete,
}

impl ParseError {
    /// Status code the client receives for this failure.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::UnsupportedMethod | ParseError::UnsupportedTransferEncoding => {
                StatusCode::NOT_IMPLEMENTED
            }
            ParseError::UnsupportedVersion => StatusCode::HTTP_VERSION_NOT_SUPPORTED,
            ParseError::UriTooLong => StatusCode::URI_TOO_LONG,
            ParseError::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(usize),
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Header,
    Body(BodyFraming),
    Done,
    Error,
}

/// Incremental request parser.
///
/// Bytes are appended as they arrive; [`parse`](Self::parse) advances as far
/// as the buffer allows. Bytes past the end of a request stay buffered for
/// the next pipelined request, picked up after [`clear`](Self::clear).
#[derive(Debug)]
pub struct RequestParser {
    buffer: BytesMut,
    state: ParseState,
    chunk: ChunkState,
    request: Request,
    error: Option<ParseError>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            state: ParseState::Header,
            chunk: ChunkState::Size,
            request: Request::default(),
            error: None,
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Advances parsing. Returns `true` once the request is complete or
    /// failed; check [`state`](Self::state) to tell which.
    pub fn parse(&mut self) -> bool {
        loop {
            match self.state {
                ParseState::Header => match self.parse_header() {
                    Ok(true) => continue,
                    Ok(false) => return false,
                    Err(e) => return self.fail(e),
                },
                ParseState::Body(framing) => {
                    let result = match framing {
                        BodyFraming::Length(len) => Ok(self.parse_fixed_body(len)),
                        BodyFraming::Chunked => self.parse_chunked_body(),
                    };
                    match result {
                        Ok(true) => {
                            self.state = ParseState::Done;
                            return true;
                        }
                        Ok(false) => return false,
                        Err(e) => return self.fail(e),
                    }
                }
                ParseState::Done | ParseState::Error => return true,
            }
        }
    }

    /// Resets for the next request, keeping any buffered bytes.
    pub fn clear(&mut self) {
        self.state = ParseState::Header;
        self.chunk = ChunkState::Size;
        self.request = Request::default();
        self.error = None;
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ParseState::Done
    }

    pub fn is_error(&self) -> bool {
        self.state == ParseState::Error
    }

    pub fn error(&self) -> Option<ParseError> {
        self.error
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn take_request(&mut self) -> Request {
        std::mem::take(&mut self.request)
    }

    /// Bytes received but not yet consumed by a request.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    fn fail(&mut self, error: ParseError) -> bool {
        self.state = ParseState::Error;
        self.error = Some(error);
        self.request.status = Some(error.status());
        true
    }

    fn parse_header(&mut self) -> Result<bool, ParseError> {
        // Tolerate stray CRLFs between pipelined requests.
        while self.buffer.starts_with(b"\r\n") {
            self.buffer.advance(2);
        }

        let Some(end) = find_subsequence(&self.buffer, b"\r\n\r\n") else {
            self.check_unterminated()?;
            return Ok(false);
        };
        if end + 4 > MAX_HEADER_BLOCK {
            return Err(ParseError::HeaderTooLarge);
        }

        let head = self.buffer.split_to(end + 4);
        let text = std::str::from_utf8(&head[..end]).map_err(|_| ParseError::InvalidRequest)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(ParseError::InvalidRequest)?;
        parse_request_line(request_line, &mut self.request)?;

        for line in lines {
            parse_header_line(line, &mut self.request)?;
        }

        self.state = ParseState::Body(body_framing(&self.request)?);
        Ok(true)
    }

    /// Applies size ceilings before the header terminator has arrived.
    fn check_unterminated(&self) -> Result<(), ParseError> {
        let first_line = find_subsequence(&self.buffer, b"\r\n");
        if first_line.is_none() && self.buffer.len() > MAX_REQUEST_LINE {
            return Err(oversized_line(&self.buffer));
        }
        if let Some(pos) = first_line {
            if pos > MAX_REQUEST_LINE {
                return Err(oversized_line(&self.buffer[..pos]));
            }
        }
        if self.buffer.len() > MAX_HEADER_BLOCK {
            return Err(ParseError::HeaderTooLarge);
        }
        Ok(())
    }

    fn parse_fixed_body(&mut self, len: usize) -> bool {
        if self.buffer.len() < len {
            return false;
        }
        self.request.body = self.buffer.split_to(len).to_vec();
        true
    }

    fn parse_chunked_body(&mut self) -> Result<bool, ParseError> {
        loop {
            match self.chunk {
                ChunkState::Size => {
                    let Some(pos) = find_subsequence(&self.buffer, b"\r\n") else {
                        if self.buffer.len() > MAX_CHUNK_LINE {
                            return Err(ParseError::InvalidRequest);
                        }
                        return Ok(false);
                    };
                    let line = std::str::from_utf8(&self.buffer[..pos])
                        .map_err(|_| ParseError::InvalidRequest)?;
                    let size_text = line.split(';').next().unwrap_or("").trim();
                    let size = usize::from_str_radix(size_text, 16)
                        .map_err(|_| ParseError::InvalidRequest)?;
                    self.buffer.advance(pos + 2);

                    if size == 0 {
                        self.chunk = ChunkState::Trailers;
                    } else {
                        if self.request.body.len().saturating_add(size) > MAX_BODY {
                            return Err(ParseError::BodyTooLarge);
                        }
                        self.chunk = ChunkState::Data(size);
                    }
                }
                ChunkState::Data(left) => {
                    let take = left.min(self.buffer.len());
                    self.request.body.extend_from_slice(&self.buffer[..take]);
                    self.buffer.advance(take);
                    if take < left {
                        self.chunk = ChunkState::Data(left - take);
                        return Ok(false);
                    }
                    self.chunk = ChunkState::DataEnd;
                }
                ChunkState::DataEnd => {
                    if self.buffer.len() < 2 {
                        return Ok(false);
                    }
                    if &self.buffer[..2] != b"\r\n" {
                        return Err(ParseError::InvalidRequest);
                    }
                    self.buffer.advance(2);
                    self.chunk = ChunkState::Size;
                }
                ChunkState::Trailers => {
                    let Some(pos) = find_subsequence(&self.buffer, b"\r\n") else {
                        return Ok(false);
                    };
                    self.buffer.advance(pos + 2);
                    if pos == 0 {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

fn oversized_line(line: &[u8]) -> ParseError {
    // METHOD SP target ...: blame the target when it alone is too long.
    let mut parts = line.splitn(3, |&b| b == b' ');
    let _method = parts.next();
    match parts.next() {
        Some(target) if target.len() > MAX_TARGET => ParseError::UriTooLong,
        _ => ParseError::InvalidRequest,
    }
}

fn parse_request_line(line: &str, request: &mut Request) -> Result<(), ParseError> {
    if line.len() > MAX_REQUEST_LINE {
        return Err(oversized_line(line.as_bytes()));
    }

    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::InvalidRequest);
    };
    if method.is_empty() || target.is_empty() {
        return Err(ParseError::InvalidRequest);
    }

    request.method = match Method::from_str(method) {
        Some(m) => m,
        None if method.bytes().all(is_tchar) => return Err(ParseError::UnsupportedMethod),
        None => return Err(ParseError::InvalidMethod),
    };

    if target.len() > MAX_TARGET {
        return Err(ParseError::UriTooLong);
    }
    let (path, query) = split_target(target).ok_or(ParseError::InvalidRequest)?;
    request.target = target.to_string();
    request.path = path;
    request.query = query;

    request.version = match version {
        "HTTP/1.1" | "HTTP/1.0" => version.to_string(),
        v if is_http_version(v) => return Err(ParseError::UnsupportedVersion),
        _ => return Err(ParseError::InvalidRequest),
    };
    Ok(())
}

fn parse_header_line(line: &str, request: &mut Request) -> Result<(), ParseError> {
    if line.starts_with(' ') || line.starts_with('\t') {
        // obsolete line folding
        return Err(ParseError::InvalidHeader);
    }
    let (name, value) = line.split_once(':').ok_or(ParseError::InvalidHeader)?;
    if name.is_empty() || !name.bytes().all(is_tchar) {
        return Err(ParseError::InvalidHeader);
    }
    request.headers.append(name, value.trim());
    Ok(())
}

fn body_framing(request: &Request) -> Result<BodyFraming, ParseError> {
    if request.version == "HTTP/1.1" {
        let hosts = request.headers.get_all("Host");
        if hosts.len() != 1 {
            return Err(ParseError::MissingHost);
        }
    }

    let transfer_encoding = request.headers.get_all("Transfer-Encoding");
    if !transfer_encoding.is_empty() {
        if request.headers.contains("Content-Length") {
            return Err(ParseError::InvalidContentLength);
        }
        let chunked_last = transfer_encoding
            .last()
            .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
        let others = transfer_encoding[..transfer_encoding.len() - 1]
            .iter()
            .any(|v| !v.eq_ignore_ascii_case("identity"));
        if !chunked_last || others {
            return Err(ParseError::UnsupportedTransferEncoding);
        }
        return Ok(BodyFraming::Chunked);
    }

    if !request.headers.contains("Content-Length") {
        return Ok(BodyFraming::Length(0));
    }
    let values = request.headers.get_all("Content-Length");
    let first = values.first().ok_or(ParseError::InvalidContentLength)?;
    if values.iter().any(|v| v != first) || !first.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::InvalidContentLength);
    }
    let len: usize = first.parse().map_err(|_| ParseError::InvalidContentLength)?;
    if len > MAX_BODY {
        return Err(ParseError::BodyTooLarge);
    }
    Ok(BodyFraming::Length(len))
}

fn is_http_version(v: &str) -> bool {
    let b = v.as_bytes();
    b.len() == 8
        && v.starts_with("HTTP/")
        && b[5].is_ascii_digit()
        && b[6] == b'.'
        && b[7].is_ascii_digit()
}

pub(crate) fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

pub(crate) fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
