use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use tracing::{debug, error};

use crate::cgi::registry::{CgiRegistry, SessionId};
use crate::cgi::session::{CgiSession, CgiState};
use crate::cgi::spawn::{CgiLaunch, Signal, Spawn};
use crate::cgi::zombie::ZombieRegistry;
use crate::config::Timeouts;
use crate::event::{Interest, Readiness};
use crate::http::response::ConnectionPolicy;

/// Shared runtime state handed to every handler by `&mut`.
///
/// Owns the readiness backend and every CGI pipe. Moving a descriptor
/// between purposes always goes through unwatch, then close or re-register,
/// never two owners at once.
pub struct Context {
    pub backend: Box<dyn Readiness>,
    pub cgi: CgiRegistry,
    pub zombies: ZombieRegistry,
    pub spawner: Box<dyn Spawn>,
    pub timeouts: Timeouts,
}

impl Context {
    pub fn new(backend: Box<dyn Readiness>, spawner: Box<dyn Spawn>, timeouts: Timeouts) -> Self {
        Self {
            backend,
            cgi: CgiRegistry::new(),
            zombies: ZombieRegistry::new(timeouts.zombie_grace()),
            spawner,
            timeouts,
        }
    }

    pub fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.backend.watch(fd, interest).inspect_err(|e| {
            error!(fd, error = %e, backend = self.backend.name(), "watch failed");
        })
    }

    pub fn unwatch(&mut self, fd: RawFd, interest: Interest) {
        if let Err(e) = self.backend.unwatch(fd, interest) {
            error!(fd, error = %e, backend = self.backend.name(), "unwatch failed");
        }
    }

    /// Spawns a CGI program for `client_fd` and starts watching its stdin.
    pub fn launch_cgi(
        &mut self,
        client_fd: RawFd,
        launch: &CgiLaunch,
        body: Vec<u8>,
        policy: ConnectionPolicy,
        now: Instant,
    ) -> io::Result<SessionId> {
        let mut session = CgiSession::new(client_fd, policy, now);
        session.start(self.spawner.as_mut(), launch, body, now)?;
        let stdin = session
            .stdin_fd()
            .ok_or_else(|| io::Error::other("spawned cgi has no stdin"))?;

        let id = self.cgi.insert(session);
        self.cgi.add_fd(stdin, id);
        if let Err(e) = self.watch(stdin, Interest::WRITABLE) {
            if let Some(session) = self.cgi.get_mut(id) {
                session.abort();
            }
            self.release_session_fds(id, now);
            self.detach_session(id, now);
            return Err(e);
        }
        Ok(id)
    }

    /// stdin is done: close it and start watching stdout.
    pub fn switch_to_stdout(&mut self, id: SessionId, stdin: RawFd, now: Instant) -> io::Result<()> {
        self.release_cgi_fd(stdin, now);
        let Some(stdout) = self.cgi.get(id).and_then(CgiSession::stdout_fd) else {
            return Err(io::Error::other("cgi session has no stdout"));
        };
        self.cgi.add_fd(stdout, id);
        self.watch(stdout, Interest::READABLE)
    }

    /// Unwatches, unregisters and closes one pipe end.
    pub fn release_cgi_fd(&mut self, fd: RawFd, now: Instant) {
        if !self.cgi.has_fd(fd) {
            return;
        }
        self.unwatch(fd, Interest::BOTH);
        if let Some(session) = self.cgi.remove_fd(fd) {
            self.bury(session, now);
        }
    }

    pub fn release_session_fds(&mut self, id: SessionId, now: Instant) {
        for fd in self.cgi.fds_of(id) {
            self.release_cgi_fd(fd, now);
        }
    }

    /// The client no longer needs session `id`.
    pub fn detach_session(&mut self, id: SessionId, now: Instant) {
        if let Some(session) = self.cgi.detach_client(id) {
            self.bury(session, now);
        }
    }

    /// Session `id` is finished from the client's point of view: close
    /// whatever pipes remain and let it go.
    pub fn retire_session(&mut self, id: SessionId, now: Instant) {
        self.release_session_fds(id, now);
        self.detach_session(id, now);
    }

    /// Terminates every live session, for shutdown.
    pub fn terminate_all(&mut self, now: Instant) {
        for fd in self.cgi.all_fds() {
            self.unwatch(fd, Interest::BOTH);
        }
        for mut session in self.cgi.drain() {
            let running = matches!(session.state(), CgiState::Writing | CgiState::Reading);
            if let Some(mut process) = session.take_process() {
                if running {
                    process.signal(Signal::Terminate);
                }
                self.zombies.track(process, now);
            }
        }
    }

    fn bury(&mut self, mut session: CgiSession, now: Instant) {
        debug!(pid = session.pid(), "cgi session released");
        if let Some(process) = session.take_process() {
            self.zombies.track(process, now);
        }
    }
}
