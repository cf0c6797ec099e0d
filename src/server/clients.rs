use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::http::connection::Connection;

/// Client connections by socket descriptor.
///
/// The registry owns each socket: removing an entry and dropping it is the
/// only way a client descriptor gets closed.
#[derive(Default)]
pub struct ClientRegistry {
    clients: HashMap<RawFd, Connection>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, connection: Connection) {
        self.clients.insert(connection.fd(), connection);
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.clients.contains_key(&fd)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Connection> {
        self.clients.get(&fd)
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        self.clients.get_mut(&fd)
    }

    pub fn remove(&mut self, fd: RawFd) -> Option<Connection> {
        self.clients.remove(&fd)
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.clients.keys().copied().collect()
    }

    /// Serving clients idle for longer than `idle`.
    pub fn timed_out(&self, now: Instant, idle: Duration) -> Vec<RawFd> {
        self.clients
            .values()
            .filter(|c| c.is_timed_out(now, idle))
            .map(Connection::fd)
            .collect()
    }

    /// Closing clients that outstayed the `linger` window.
    pub fn unresponsive(&self, now: Instant, linger: Duration) -> Vec<RawFd> {
        self.clients
            .values()
            .filter(|c| c.is_unresponsive(now, linger))
            .map(Connection::fd)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
