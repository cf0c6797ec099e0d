//! Portico - event-driven HTTP/1.1 server with a CGI gateway
//!
//! Core library: readiness backends, HTTP state machines, CGI sessions and
//! the dispatcher tying them together.

pub mod cgi;
pub mod config;
pub mod event;
pub mod http;
pub mod route;
pub mod server;
pub mod signals;
