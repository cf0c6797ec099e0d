//! Turns parsed CGI output into queued response entries.
//!
//! A builder emits at most one terminal response per session. After that
//! every call is a no-op, so a late timeout or abort cannot put a second
//! response on the wire.

use tracing::{debug, warn};

use crate::cgi::parser::{CgiParser, Framing};
use crate::http::queue::ResponseQueue;
use crate::http::response::{ConnectionPolicy, ResponseBuilder, StatusCode};

#[derive(Debug)]
pub struct CgiResponseBuilder {
    status: StatusCode,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    framing: Framing,
    policy: ConnectionPolicy,
    header_sent: bool,
    sent: bool,
}

impl Default for CgiResponseBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CgiResponseBuilder {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: Vec::new(),
            body: Vec::new(),
            framing: Framing::Length(0),
            policy: ConnectionPolicy::KeepAlive,
            header_sent: false,
            sent: false,
        }
    }

    /// Takes over the parser's current status, headers and body.
    pub fn apply(&mut self, parser: &mut CgiParser) {
        self.status = parser.status();
        self.headers = parser.headers().to_vec();
        let body = parser.take_body();

        let chunked = self.headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("Transfer-Encoding") && v.eq_ignore_ascii_case("chunked")
        });
        self.framing = if chunked {
            Framing::Chunked
        } else {
            Framing::Length(body.len())
        };

        // Streaming output accumulates until it is framed.
        self.body.extend_from_slice(&body);
    }

    pub fn set_policy(&mut self, policy: ConnectionPolicy) {
        self.policy = policy;
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Whether the terminal response has been queued.
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub fn build_response(&mut self, queue: &mut ResponseQueue, eof: bool) {
        if self.sent {
            warn!(status = self.status.as_u16(), "cgi response already sent; dropping duplicate");
            return;
        }

        if self.status == StatusCode::INTERNAL_SERVER_ERROR {
            self.finish_with_error(queue, StatusCode::INTERNAL_SERVER_ERROR, self.policy);
            return;
        }

        match self.framing {
            Framing::Chunked => {
                if !self.header_sent {
                    queue.generate_chunk_response_header(self.status, &self.headers, self.policy);
                    self.header_sent = true;
                }
                if !self.body.is_empty() {
                    queue.generate_chunk_response_body(&self.body);
                    self.body.clear();
                }
                if eof {
                    queue.generate_chunk_response_last(self.policy);
                    self.sent = true;
                }
            }
            Framing::Length(_) => {
                let response = ResponseBuilder::new(self.status)
                    .headers(&self.headers)
                    .body(std::mem::take(&mut self.body))
                    .build();
                queue.generate_response(response, self.policy);
                self.sent = true;
            }
        }
    }

    /// Ends the exchange with `status`, ignoring parsed output.
    ///
    /// If a chunked header already went out the stream can only be closed
    /// with the terminal chunk.
    pub fn build_error_response(
        &mut self,
        queue: &mut ResponseQueue,
        status: StatusCode,
        policy: ConnectionPolicy,
    ) {
        if self.sent {
            debug!(status = status.as_u16(), "cgi response already sent; error response skipped");
            return;
        }
        self.finish_with_error(queue, status, policy);
    }

    fn finish_with_error(
        &mut self,
        queue: &mut ResponseQueue,
        status: StatusCode,
        policy: ConnectionPolicy,
    ) {
        if self.framing == Framing::Chunked && self.header_sent {
            queue.generate_chunk_response_last(policy);
        } else {
            queue.generate_error_response(status, policy);
        }
        self.body.clear();
        self.sent = true;
    }
}
