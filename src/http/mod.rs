//! HTTP protocol implementation.
//!
//! This module implements the HTTP/1.1 side of the server: keep-alive,
//! pipelining and the response queue that sits between request handling and
//! the socket.
//!
//! # Architecture
//!
//! - **`connection`**: non-blocking socket I/O and the client lifecycle
//! - **`transaction`**: request/response cycle, pipelining, CGI hand-off
//! - **`parser`**: incremental request parser
//! - **`request`**: HTTP request representation and header map
//! - **`handler`**: static files, uploads, deletes, redirects
//! - **`queue`**: ordered response entries with their close policy
//! - **`response`**: status codes, policies, response builder
//! - **`writer`**: wire serialization and partial-write tracking
//! - **`mime`**: MIME type detection based on file extensions
//!
//! # Connection State Machine
//!
//! ```text
//!        ┌─────────────┐
//!        │    Alive    │ ← read, parse, queue, write
//!        └──────┬──────┘
//!               │ idle timeout: 408 queued
//!               ▼
//!        ┌──────────────────┐
//!        │    TimedOut      │ ← input discarded
//!        └──────┬───────────┘
//!               │ MustClose response sent
//!               ▼
//!        ┌──────────────────┐
//!        │   HalfClosed     │ ← write side shut, wait for peer close
//!        └──────────────────┘
//! ```
//!
//! An `Alive` connection also goes straight to `HalfClosed` after any
//! MustClose response (parse errors), and is dropped after a WillClose one.

pub mod connection;
pub mod handler;
pub mod mime;
pub mod parser;
pub mod queue;
pub mod request;
pub mod response;
pub mod transaction;
pub mod writer;
