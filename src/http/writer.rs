use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, Write};

use crate::http::response::{ConnectionPolicy, Response, StatusCode};

const HTTP_VERSION: &str = "HTTP/1.1";

/// Terminal chunk of a chunked body.
pub const LAST_CHUNK: &[u8] = b"0\r\n\r\n";

/// Status line plus header block, including the blank separator line.
pub fn serialize_head(status: StatusCode, headers: &[(String, String)]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(128 + headers.len() * 32);

    let status_line = format!(
        "{} {} {}\r\n",
        HTTP_VERSION,
        status.as_u16(),
        status.reason_phrase()
    );
    buf.put_slice(status_line.as_bytes());

    for (k, v) in headers {
        buf.put_slice(k.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(v.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf
}

pub fn serialize_response(resp: &Response) -> Bytes {
    let mut buf = serialize_head(resp.status, &resp.headers);
    buf.put_slice(&resp.body);
    buf.freeze()
}

/// Frames `body` as one chunk: hex size, CRLF, data, CRLF.
///
/// An empty body yields an empty buffer, never a terminal chunk.
pub fn serialize_chunk(body: &[u8]) -> Bytes {
    if body.is_empty() {
        return Bytes::new();
    }
    let mut buf = BytesMut::with_capacity(body.len() + 12);
    buf.put_slice(format!("{:x}\r\n", body.len()).as_bytes());
    buf.put_slice(body);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// One queued unit of output: a full response, a chunked header, or a chunk.
///
/// Tracks how much of the buffer has reached the socket so a partial send
/// resumes where it stopped.
#[derive(Debug)]
pub struct ResponseEntry {
    policy: ConnectionPolicy,
    buffer: Bytes,
    written: usize,
}

impl ResponseEntry {
    pub fn new(buffer: Bytes, policy: ConnectionPolicy) -> Self {
        Self {
            policy,
            buffer,
            written: 0,
        }
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes sent so far.
    pub fn offset(&self) -> usize {
        self.written
    }

    pub fn remaining(&self) -> &[u8] {
        &self.buffer[self.written..]
    }

    pub fn is_complete(&self) -> bool {
        self.written >= self.buffer.len()
    }

    /// One non-blocking write attempt of the unsent tail.
    ///
    /// Returns the byte count the writer accepted. `Ok(0)` with bytes left
    /// means the peer is gone; the caller decides what that means.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> io::Result<usize> {
        if self.is_complete() {
            return Ok(0);
        }
        let n = out.write(&self.buffer[self.written..])?;
        self.written += n;
        Ok(n)
    }
}
