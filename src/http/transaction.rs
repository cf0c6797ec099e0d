use std::os::fd::RawFd;
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::cgi::registry::SessionId;
use crate::cgi::spawn::CgiLaunch;
use crate::http::handler::{self, Outcome};
use crate::http::parser::{RequestParser, MAX_BODY, MAX_HEADER_BLOCK};
use crate::http::queue::ResponseQueue;
use crate::http::request::Request;
use crate::http::response::{ConnectionPolicy, StatusCode};
use crate::http::writer::ResponseEntry;
use crate::route::{EffectiveConfig, Resolve};
use crate::server::context::Context;

/// Most unconsumed input held for one connection. Past this a client that
/// keeps sending while its CGI request runs is cut off.
const MAX_PENDING_INPUT: usize = MAX_HEADER_BLOCK + MAX_BODY;

/// Request/response cycle of one connection.
///
/// Survives across pipelined requests: after each exchange the parser is
/// cleared, not replaced, so bytes of the next request stay buffered.
pub struct HttpTransaction {
    client_fd: RawFd,
    parser: RequestParser,
    queue: ResponseQueue,
    hosts: Rc<dyn Resolve>,
    cgi: Option<SessionId>,
    policy: ConnectionPolicy,
}

impl HttpTransaction {
    pub fn new(client_fd: RawFd, hosts: Rc<dyn Resolve>) -> Self {
        Self {
            client_fd,
            parser: RequestParser::new(),
            queue: ResponseQueue::new(),
            hosts,
            cgi: None,
            policy: ConnectionPolicy::KeepAlive,
        }
    }

    /// Buffers request bytes. Once a closing response is queued nothing more
    /// will be parsed, so later input is dropped.
    pub fn append_data(&mut self, data: &[u8]) {
        if self.policy != ConnectionPolicy::KeepAlive {
            debug!(client = self.client_fd, len = data.len(), "connection closing; input dropped");
            return;
        }
        self.parser.append(data);
    }

    /// Handles every complete request in the buffer, in order.
    ///
    /// Stops at the first non-keep-alive response and while a CGI session
    /// is running; the CGI path resumes pipelining when it finishes.
    pub fn process_data(&mut self, ctx: &mut Context, now: Instant) {
        if self.parser.buffered() > MAX_PENDING_INPUT {
            self.reject_pending_input(ctx, now);
            return;
        }
        if self.cgi.is_some() {
            self.process_cgi_session(ctx, now);
            return;
        }

        while self.policy == ConnectionPolicy::KeepAlive && self.parser.parse() {
            self.handle_request(ctx, now);
            if self.cgi.is_some() {
                return;
            }
            if self.policy != ConnectionPolicy::KeepAlive {
                return;
            }
            self.parser.clear();
        }
    }

    /// Moves CGI output into the queue; retires the session once it is done.
    pub fn process_cgi_session(&mut self, ctx: &mut Context, now: Instant) {
        let Some(id) = self.cgi else {
            return;
        };
        let Some(session) = ctx.cgi.get_mut(id) else {
            self.cgi = None;
            return;
        };

        session.build_response(&mut self.queue);
        if !(session.is_failed() || session.is_completed()) {
            return;
        }

        debug!(
            client = self.client_fd,
            pid = session.pid(),
            failed = session.is_failed(),
            "cgi exchange finished"
        );
        self.cgi = None;
        ctx.retire_session(id, now);
        self.parser.clear();
        if self.policy == ConnectionPolicy::KeepAlive {
            self.process_data(ctx, now);
        }
    }

    /// Idle timeout: queue a 408 and close once it is sent. A close that is
    /// already queued stays the last response.
    pub fn handle_client_timeout(&mut self, ctx: &mut Context, now: Instant) {
        match self.cgi.take() {
            Some(id) => {
                self.policy = ConnectionPolicy::MustClose;
                self.end_cgi_with(ctx, id, StatusCode::REQUEST_TIMEOUT, now);
            }
            None if self.policy != ConnectionPolicy::KeepAlive || self.queue.has_terminal() => {
                debug!(client = self.client_fd, "closing response already queued; no 408");
            }
            None => {
                self.policy = ConnectionPolicy::MustClose;
                self.queue.generate_timeout_response();
            }
        }
    }

    /// The peer is gone. A running CGI session keeps its pipes until they
    /// close on their own.
    pub fn handle_client_abort(&mut self, ctx: &mut Context, now: Instant) {
        if let Some(id) = self.cgi.take() {
            release_session(ctx, id, now);
        }
    }

    /// Too much input piled up behind an unfinished exchange: answer 413,
    /// drop the backlog and close.
    fn reject_pending_input(&mut self, ctx: &mut Context, now: Instant) {
        warn!(
            client = self.client_fd,
            buffered = self.parser.buffered(),
            "pending input over limit; closing connection"
        );
        self.parser = RequestParser::new();
        self.policy = ConnectionPolicy::MustClose;
        match self.cgi.take() {
            Some(id) => self.end_cgi_with(ctx, id, StatusCode::PAYLOAD_TOO_LARGE, now),
            None => self
                .queue
                .generate_error_response(StatusCode::PAYLOAD_TOO_LARGE, ConnectionPolicy::MustClose),
        }
    }

    fn end_cgi_with(&mut self, ctx: &mut Context, id: SessionId, status: StatusCode, now: Instant) {
        if let Some(session) = ctx.cgi.get_mut(id) {
            session.build_error_response(&mut self.queue, status, ConnectionPolicy::MustClose);
        }
        release_session(ctx, id, now);
    }

    pub fn has_response(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn front_response(&mut self) -> Option<&mut ResponseEntry> {
        self.queue.front_mut()
    }

    pub fn pop_response(&mut self) -> Option<ResponseEntry> {
        self.queue.pop()
    }

    pub fn has_cgi(&self) -> bool {
        self.cgi.is_some()
    }

    pub fn cgi_session(&self) -> Option<SessionId> {
        self.cgi
    }

    pub fn policy(&self) -> ConnectionPolicy {
        self.policy
    }

    pub fn queue(&self) -> &ResponseQueue {
        &self.queue
    }

    fn handle_request(&mut self, ctx: &mut Context, now: Instant) {
        let request = self.parser.take_request();
        self.policy = request.connection_policy();

        if let Some(status) = request.status {
            let path = if request.path.is_empty() { "/" } else { request.path.as_str() };
            let config = self.hosts.resolve(request.host(), path);
            info!(client = self.client_fd, status = status.as_u16(), "rejecting malformed request");
            self.queue
                .generate_response(handler::error_response(status, &config), self.policy);
            return;
        }

        let config = self.hosts.resolve(request.host(), &request.path);
        info!(
            client = self.client_fd,
            method = request.method.as_str(),
            path = %request.path,
            "request"
        );

        match handler::handle(&request, &config) {
            Outcome::Respond(response) => {
                debug!(client = self.client_fd, status = response.status.as_u16(), "response queued");
                self.queue.generate_response(response, self.policy);
            }
            Outcome::Cgi(program) => self.start_cgi(ctx, request, &program, now, &config),
        }
    }

    fn start_cgi(
        &mut self,
        ctx: &mut Context,
        request: Request,
        program: &Path,
        now: Instant,
        config: &EffectiveConfig,
    ) {
        let launch = CgiLaunch::from_request(program, &request);
        match ctx.launch_cgi(self.client_fd, &launch, request.body, self.policy, now) {
            Ok(id) => self.cgi = Some(id),
            Err(e) => {
                warn!(client = self.client_fd, program = %program.display(), error = %e, "cgi launch failed");
                self.queue.generate_response(
                    handler::error_response(StatusCode::INTERNAL_SERVER_ERROR, config),
                    self.policy,
                );
            }
        }
    }
}

/// Lets go of a session the client no longer waits on. A finished one is
/// retired now; a running one keeps its pipes until they close.
fn release_session(ctx: &mut Context, id: SessionId, now: Instant) {
    let finished = ctx
        .cgi
        .get(id)
        .is_none_or(|s| s.is_failed() || s.is_completed());
    if finished {
        ctx.retire_session(id, now);
    } else {
        ctx.detach_session(id, now);
    }
}
