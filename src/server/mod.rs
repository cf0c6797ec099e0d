//! Descriptor ownership and the event loop.
//!
//! - **`listener`**: bound listening sockets ([`listener::ServerRegistry`])
//! - **`clients`**: accepted connections ([`clients::ClientRegistry`])
//! - **`context`**: backend plus CGI state shared with every handler
//! - **`dispatcher`**: the loop itself

pub mod clients;
pub mod context;
pub mod dispatcher;
pub mod listener;
