//! One CGI exchange: request body into the child, output back to the client.
//!
//! ```text
//!   Idle ──spawn──▶ Writing ──body sent──▶ Reading ──stdout EOF──▶ Eof
//!                      │                      │
//!                      └──────┬───────────────┘
//!                             ▼
//!                    Error | TimedOut   (absorbing)
//! ```
//!
//! The session owns both pipe ends. Each is closed exactly once, by dropping
//! it in [`CgiSession::close_fd`]; the registry decides when that happens.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cgi::builder::CgiResponseBuilder;
use crate::cgi::parser::CgiParser;
use crate::cgi::spawn::{CgiLaunch, CgiProcess, Signal, Spawn};
use crate::http::queue::ResponseQueue;
use crate::http::response::{ConnectionPolicy, StatusCode};

const READ_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiState {
    Idle,
    Writing,
    Reading,
    Eof,
    Error,
    TimedOut,
}

/// Outcome of one pipe I/O step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiIo {
    /// Wait for the next readiness event.
    Continue,
    /// Request body fully written; switch from stdin to stdout.
    WriteComplete,
    /// Child closed stdout.
    ReadComplete,
    /// Fatal; the child has been signalled.
    Error,
}

pub struct CgiSession {
    client_fd: RawFd,
    process: Option<Box<dyn CgiProcess>>,
    pid: u32,
    stdin: Option<File>,
    stdout: Option<File>,
    state: CgiState,
    input: Vec<u8>,
    offset: usize,
    last_activity: Instant,
    parser: CgiParser,
    builder: CgiResponseBuilder,
    client_alive: bool,
}

impl CgiSession {
    /// A session for `client_fd` that has not started a process yet.
    pub fn new(client_fd: RawFd, policy: ConnectionPolicy, now: Instant) -> Self {
        let mut builder = CgiResponseBuilder::new();
        builder.set_policy(policy);
        Self {
            client_fd,
            process: None,
            pid: 0,
            stdin: None,
            stdout: None,
            state: CgiState::Idle,
            input: Vec::new(),
            offset: 0,
            last_activity: now,
            parser: CgiParser::new(),
            builder,
            client_alive: true,
        }
    }

    /// Spawns the program and moves to `Writing`.
    ///
    /// The caller registers [`stdin_fd`](Self::stdin_fd) for write
    /// readiness; stdout is only watched once the body is through.
    pub fn start(
        &mut self,
        spawner: &mut dyn Spawn,
        launch: &CgiLaunch,
        body: Vec<u8>,
        now: Instant,
    ) -> io::Result<()> {
        let spawned = spawner.spawn(launch)?;
        self.pid = spawned.process.pid();
        self.process = Some(spawned.process);
        self.stdin = Some(spawned.stdin);
        self.stdout = Some(spawned.stdout);
        self.input = body;
        self.offset = 0;
        self.last_activity = now;
        self.state = CgiState::Writing;
        info!(pid = self.pid, client = self.client_fd, "cgi session started");
        Ok(())
    }

    pub fn client_fd(&self) -> RawFd {
        self.client_fd
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn state(&self) -> CgiState {
        self.state
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(AsRawFd::as_raw_fd)
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Bytes of the request body already written to the child.
    pub fn written(&self) -> usize {
        self.offset
    }

    pub fn is_processing(&self) -> bool {
        matches!(self.state, CgiState::Writing | CgiState::Reading)
    }

    pub fn is_eof(&self) -> bool {
        self.state == CgiState::Eof
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, CgiState::Error | CgiState::TimedOut)
    }

    /// Child output fully read and parsed.
    pub fn is_completed(&self) -> bool {
        self.is_eof() && self.parser.is_done()
    }

    pub fn is_timed_out(&self, now: Instant, limit: Duration) -> bool {
        self.is_processing() && now.saturating_duration_since(self.last_activity) > limit
    }

    pub fn is_client_alive(&self) -> bool {
        self.client_alive
    }

    pub fn mark_client_dead(&mut self) {
        self.client_alive = false;
    }

    /// Write-ready handler for the stdin pipe.
    pub fn on_write(&mut self, now: Instant) -> CgiIo {
        if !self.is_processing() {
            return CgiIo::Error;
        }
        if self.offset >= self.input.len() {
            return self.finish_writing();
        }
        let Some(stdin) = self.stdin.as_mut() else {
            return self.fail("stdin already closed");
        };

        match stdin.write(&self.input[self.offset..]) {
            Ok(0) => self.fail("cgi stdin accepted no bytes"),
            Ok(n) => {
                self.last_activity = now;
                self.offset += n;
                if self.offset < self.input.len() {
                    return CgiIo::Continue;
                }
                self.finish_writing()
            }
            Err(e) if is_transient(&e) => CgiIo::Continue,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "cgi stdin write failed");
                self.fail("write error")
            }
        }
    }

    /// Read-ready handler for the stdout pipe.
    pub fn on_read(&mut self, now: Instant) -> CgiIo {
        if !self.is_processing() {
            return CgiIo::Error;
        }
        let Some(stdout) = self.stdout.as_mut() else {
            return self.fail("stdout already closed");
        };

        let mut buf = [0u8; READ_CHUNK];
        match stdout.read(&mut buf) {
            Ok(0) => {
                self.last_activity = now;
                self.state = CgiState::Eof;
                debug!(pid = self.pid, "cgi stdout reached eof");
                CgiIo::ReadComplete
            }
            Ok(n) => {
                self.last_activity = now;
                self.parser.append(&buf[..n]);
                CgiIo::Continue
            }
            Err(e) if is_transient(&e) => CgiIo::Continue,
            Err(e) => {
                warn!(pid = self.pid, error = %e, "cgi stdout read failed");
                self.fail("read error")
            }
        }
    }

    /// Forces the session into `TimedOut` and signals the child. Closing the
    /// pipes is left to the registry.
    pub fn on_timeout(&mut self) {
        if self.is_failed() {
            return;
        }
        warn!(pid = self.pid, client = self.client_fd, "cgi timed out");
        self.state = CgiState::TimedOut;
        self.terminate();
    }

    /// Gives up on the child, e.g. when its pipes cannot be watched.
    pub fn abort(&mut self) {
        if !self.is_failed() {
            self.fail("aborted");
        }
    }

    /// Offers whatever output arrived to the builder.
    pub fn build_response(&mut self, queue: &mut ResponseQueue) {
        if self.is_failed() {
            let policy = self.builder.policy();
            self.builder
                .build_error_response(queue, StatusCode::INTERNAL_SERVER_ERROR, policy);
            return;
        }

        let eof = self.is_eof();
        if self.parser.parse(eof) && !self.builder.is_sent() {
            self.builder.apply(&mut self.parser);
            self.builder.build_response(queue, eof);
        }
    }

    pub fn build_error_response(
        &mut self,
        queue: &mut ResponseQueue,
        status: StatusCode,
        policy: ConnectionPolicy,
    ) {
        self.builder.build_error_response(queue, status, policy);
    }

    pub fn is_response_sent(&self) -> bool {
        self.builder.is_sent()
    }

    /// Closes `fd` if it is one of this session's pipe ends. Returns whether
    /// anything was closed; a second call for the same end is a no-op.
    pub fn close_fd(&mut self, fd: RawFd) -> bool {
        if self.stdin_fd() == Some(fd) {
            self.stdin = None;
            return true;
        }
        if self.stdout_fd() == Some(fd) {
            self.stdout = None;
            return true;
        }
        false
    }

    /// Hands the child over, e.g. to the zombie registry.
    pub fn take_process(&mut self) -> Option<Box<dyn CgiProcess>> {
        self.process.take()
    }

    fn finish_writing(&mut self) -> CgiIo {
        self.input = Vec::new();
        self.state = CgiState::Reading;
        CgiIo::WriteComplete
    }

    fn fail(&mut self, reason: &str) -> CgiIo {
        debug!(pid = self.pid, reason, "cgi session failed");
        self.state = CgiState::Error;
        self.terminate();
        CgiIo::Error
    }

    fn terminate(&mut self) {
        if let Some(process) = self.process.as_mut() {
            process.signal(Signal::Terminate);
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
