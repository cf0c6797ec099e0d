use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::http::response::ConnectionPolicy;
use crate::http::transaction::HttpTransaction;
use crate::route::Resolve;
use crate::server::context::Context;

const READ_CHUNK: usize = 4096;

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Serving requests.
    Alive,
    /// A 408 has been queued; input is ignored from now on.
    TimedOut,
    /// Write side shut down; waiting for the peer to close.
    HalfClosed,
}

/// What the dispatcher should do after a connection handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    Continue,
    /// Responses are queued: watch for write readiness.
    ReadyToWrite,
    /// Queue drained: stop watching for writes.
    WriteComplete,
    /// Shut down the write side, keep reading until the peer closes.
    ShouldShutdown,
    /// Drop the connection.
    ShouldClose,
}

pub struct Connection {
    stream: TcpStream,
    fd: RawFd,
    peer: Option<SocketAddr>,
    state: ClientState,
    last_activity: Instant,
    transaction: HttpTransaction,
}

impl Connection {
    pub fn new(stream: TcpStream, hosts: Rc<dyn Resolve>, now: Instant) -> Self {
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            fd,
            peer,
            state: ClientState::Alive,
            last_activity: now,
            transaction: HttpTransaction::new(fd, hosts),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state == ClientState::Alive
    }

    pub fn transaction(&self) -> &HttpTransaction {
        &self.transaction
    }

    pub fn transaction_mut(&mut self) -> &mut HttpTransaction {
        &mut self.transaction
    }

    /// Read-ready handler.
    pub fn on_read(&mut self, ctx: &mut Context, now: Instant) -> IoStatus {
        let mut buf = [0u8; READ_CHUNK];
        let n = match self.stream.read(&mut buf) {
            Ok(0) => {
                debug!(client = self.fd, "peer closed");
                self.abort(ctx, now);
                return IoStatus::ShouldClose;
            }
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return IoStatus::Continue;
            }
            Err(e) => {
                warn!(client = self.fd, error = %e, "read failed");
                self.abort(ctx, now);
                return IoStatus::ShouldClose;
            }
        };

        if !self.is_alive() {
            debug!(client = self.fd, bytes = n, "discarding input after close was decided");
            return IoStatus::Continue;
        }

        self.last_activity = now;
        self.transaction.append_data(&buf[..n]);
        self.transaction.process_data(ctx, now);
        if self.transaction.has_response() {
            IoStatus::ReadyToWrite
        } else {
            IoStatus::Continue
        }
    }

    /// Write-ready handler. Writes at most once per call.
    pub fn on_write(&mut self, ctx: &mut Context, now: Instant) -> IoStatus {
        if self.state == ClientState::HalfClosed {
            return IoStatus::WriteComplete;
        }
        let Some(entry) = self.transaction.front_response() else {
            return IoStatus::WriteComplete;
        };

        match entry.write_to(&mut self.stream) {
            Ok(0) => {
                warn!(client = self.fd, "socket accepted no bytes");
                self.abort(ctx, now);
                return IoStatus::ShouldClose;
            }
            Ok(_) => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                return IoStatus::Continue;
            }
            Err(e) => {
                warn!(client = self.fd, error = %e, "write failed");
                self.abort(ctx, now);
                return IoStatus::ShouldClose;
            }
        }
        self.last_activity = now;
        if !entry.is_complete() {
            return IoStatus::Continue;
        }

        let policy = entry.policy();
        self.transaction.pop_response();
        match policy {
            ConnectionPolicy::WillClose => {
                debug!(client = self.fd, "closing after response");
                IoStatus::ShouldClose
            }
            ConnectionPolicy::MustClose => {
                debug!(client = self.fd, "half-closing after response");
                self.state = ClientState::HalfClosed;
                IoStatus::ShouldShutdown
            }
            ConnectionPolicy::KeepAlive if self.transaction.has_response() => IoStatus::Continue,
            ConnectionPolicy::KeepAlive => IoStatus::WriteComplete,
        }
    }

    /// Idle timeout: queue a 408 and stop accepting requests.
    pub fn on_timeout(&mut self, ctx: &mut Context, now: Instant) -> IoStatus {
        if !self.is_alive() {
            return IoStatus::Continue;
        }
        info!(client = self.fd, peer = ?self.peer, "client timed out");
        self.last_activity = now;
        self.transaction.handle_client_timeout(ctx, now);
        self.state = ClientState::TimedOut;
        IoStatus::ReadyToWrite
    }

    /// Idle for longer than `limit` while still serving requests.
    pub fn is_timed_out(&self, now: Instant, limit: Duration) -> bool {
        self.is_alive() && now.saturating_duration_since(self.last_activity) > limit
    }

    /// Closing but the peer has not finished within `linger`.
    pub fn is_unresponsive(&self, now: Instant, linger: Duration) -> bool {
        !self.is_alive() && now.saturating_duration_since(self.last_activity) > linger
    }

    pub fn shutdown_write(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            debug!(client = self.fd, error = %e, "shutdown failed");
        }
    }

    /// Lets go of any CGI session before the socket is dropped.
    pub fn abort(&mut self, ctx: &mut Context, now: Instant) {
        self.transaction.handle_client_abort(ctx, now);
    }
}
