//! Ordered output of one connection.
//!
//! Request handling and the CGI builder push entries, the connection's write
//! handler drains them. Nothing looks inside an entry once it is queued.

use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;

use crate::http::response::{ConnectionPolicy, Response, StatusCode};
use crate::http::writer::{self, ResponseEntry, LAST_CHUNK};

#[derive(Debug, Default)]
pub struct ResponseQueue {
    entries: VecDeque<ResponseEntry>,
}

impl ResponseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an entry; empty entries are dropped.
    pub fn push(&mut self, entry: ResponseEntry) {
        if entry.is_empty() {
            return;
        }
        self.entries.push_back(entry);
    }

    pub fn front(&self) -> Option<&ResponseEntry> {
        self.entries.front()
    }

    pub fn front_mut(&mut self) -> Option<&mut ResponseEntry> {
        self.entries.front_mut()
    }

    pub fn pop(&mut self) -> Option<ResponseEntry> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any queued entry ends the connection.
    pub fn has_terminal(&self) -> bool {
        self.entries
            .iter()
            .any(|e| e.policy() != ConnectionPolicy::KeepAlive)
    }

    /// Serializes a complete response with the matching `Connection` header.
    pub fn generate_response(&mut self, response: Response, policy: ConnectionPolicy) {
        let mut response = response;
        set_connection(&mut response.headers, policy);
        let bytes = writer::serialize_response(&response);
        self.push(ResponseEntry::new(bytes, policy));
    }

    /// Generic error page for `status`.
    pub fn generate_error_response(&mut self, status: StatusCode, policy: ConnectionPolicy) {
        self.generate_response(Response::error(status, policy), policy);
    }

    /// Header block of a chunked response. The stream stays open, so the
    /// entry itself is always keep-alive; the last chunk carries the policy.
    pub fn generate_chunk_response_header(
        &mut self,
        status: StatusCode,
        headers: &[(String, String)],
        policy: ConnectionPolicy,
    ) {
        let mut headers = headers.to_vec();
        if !headers
            .iter()
            .any(|(k, _)| k.eq_ignore_ascii_case("Transfer-Encoding"))
        {
            headers.push(("Transfer-Encoding".to_string(), "chunked".to_string()));
        }
        set_connection(&mut headers, policy);
        let head = writer::serialize_head(status, &headers);
        self.push(ResponseEntry::new(head.freeze(), ConnectionPolicy::KeepAlive));
    }

    pub fn generate_chunk_response_body(&mut self, body: &[u8]) {
        self.push(ResponseEntry::new(
            writer::serialize_chunk(body),
            ConnectionPolicy::KeepAlive,
        ));
    }

    pub fn generate_chunk_response_last(&mut self, policy: ConnectionPolicy) {
        let mut buf = BytesMut::with_capacity(LAST_CHUNK.len());
        buf.put_slice(LAST_CHUNK);
        self.push(ResponseEntry::new(buf.freeze(), policy));
    }

    /// 408 for an idle client; always closes.
    pub fn generate_timeout_response(&mut self) {
        self.generate_error_response(StatusCode::REQUEST_TIMEOUT, ConnectionPolicy::MustClose);
    }
}

fn set_connection(headers: &mut Vec<(String, String)>, policy: ConnectionPolicy) {
    headers.retain(|(k, _)| !k.eq_ignore_ascii_case("Connection"));
    headers.push(("Connection".to_string(), policy.header_value().to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::response::ResponseBuilder;

    #[test]
    fn empty_entries_are_not_queued() {
        let mut queue = ResponseQueue::new();
        queue.generate_chunk_response_body(b"");
        assert!(queue.is_empty());
    }

    #[test]
    fn connection_header_follows_policy() {
        let mut queue = ResponseQueue::new();
        let response = ResponseBuilder::new(StatusCode::OK)
            .header("Connection", "keep-alive")
            .build();
        queue.generate_response(response, ConnectionPolicy::WillClose);

        let entry = queue.pop().unwrap();
        let text = String::from_utf8_lossy(entry.bytes()).to_string();
        assert!(text.contains("Connection: close\r\n"));
        assert!(!text.contains("keep-alive"));
        assert_eq!(entry.policy(), ConnectionPolicy::WillClose);
    }
}
