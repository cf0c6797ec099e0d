//! The event loop.
//!
//! One thread, one blocking wait per iteration. Every ready descriptor is
//! routed to its owner (listening socket, then client, then CGI pipe) and
//! the owner's handler decides what the descriptor should be watched for
//! next. After the events, a sweep handles every time-based transition.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::cgi::registry::SessionId;
use crate::cgi::session::CgiIo;
use crate::cgi::spawn::Spawn;
use crate::cgi::zombie::reap_all;
use crate::config::Config;
use crate::event::{Event, Interest, Readiness};
use crate::http::connection::{Connection, IoStatus};
use crate::server::clients::ClientRegistry;
use crate::server::context::Context;
use crate::server::listener::ServerRegistry;

pub struct Dispatcher {
    ctx: Context,
    servers: ServerRegistry,
    clients: ClientRegistry,
    events: Vec<Event>,
}

impl Dispatcher {
    /// Binds every listen address and registers the listeners for reads.
    pub fn new(
        config: &Config,
        backend: Box<dyn Readiness>,
        spawner: Box<dyn Spawn>,
    ) -> anyhow::Result<Self> {
        let servers = ServerRegistry::bind(config)?;
        let mut ctx = Context::new(backend, spawner, config.timeouts.clone());
        for fd in servers.fds() {
            ctx.watch(fd, Interest::READABLE)?;
        }

        Ok(Self {
            ctx,
            servers,
            clients: ClientRegistry::new(),
            events: Vec::with_capacity(256),
        })
    }

    /// Runs until `shutdown` is raised. `sigchld` is the flag set by the
    /// SIGCHLD handler.
    pub fn run(&mut self, shutdown: &AtomicBool, sigchld: &AtomicBool) -> io::Result<()> {
        info!(
            backend = self.ctx.backend.name(),
            listeners = self.servers.len(),
            "event loop started"
        );

        while !shutdown.load(Ordering::Relaxed) {
            if sigchld.swap(false, Ordering::Relaxed) {
                let reaped = reap_all();
                if reaped > 0 {
                    debug!(reaped, "children reaped");
                }
            }
            self.run_once(self.ctx.timeouts.poll_interval())?;
        }

        info!("shutting down");
        self.shutdown();
        Ok(())
    }

    /// One iteration: wait for readiness, handle it, then sweep timeouts.
    pub fn run_once(&mut self, timeout: Duration) -> io::Result<()> {
        let mut events = std::mem::take(&mut self.events);
        if let Err(e) = self.ctx.backend.poll(timeout, &mut events) {
            self.events = events;
            return Err(e);
        }

        let now = Instant::now();
        for event in &events {
            self.process_event(*event, now);
        }
        self.events = events;

        self.handle_timeouts(Instant::now());
        Ok(())
    }

    /// Time-based transitions: CGI inactivity, idle clients, clients that
    /// never finished closing, and stubborn zombies.
    pub fn handle_timeouts(&mut self, now: Instant) {
        let timeouts = self.ctx.timeouts.clone();

        for id in self.ctx.cgi.timed_out(now, timeouts.cgi()) {
            let Some(session) = self.ctx.cgi.get_mut(id) else {
                continue;
            };
            session.on_timeout();
            let client_fd = session.client_fd();
            self.ctx.release_session_fds(id, now);
            self.pump_client(client_fd, id, now);
        }

        for fd in self.clients.timed_out(now, timeouts.client_idle()) {
            if let Some(client) = self.clients.get_mut(fd) {
                let status = client.on_timeout(&mut self.ctx, now);
                self.apply_status(fd, status, now);
            }
        }

        for fd in self.clients.unresponsive(now, timeouts.client_linger()) {
            warn!(client = fd, "peer never closed, dropping");
            self.remove_client(fd, now);
        }

        self.ctx.zombies.manage(now);
    }

    /// Closes every client and terminates every CGI child.
    pub fn shutdown(&mut self) {
        let now = Instant::now();
        for fd in self.clients.fds() {
            self.remove_client(fd, now);
        }
        self.ctx.terminate_all(now);
        for fd in self.servers.fds() {
            self.ctx.unwatch(fd, Interest::READABLE);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn cgi_session_count(&self) -> usize {
        self.ctx.cgi.len()
    }

    pub fn zombie_count(&self) -> usize {
        self.ctx.zombies.len()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.servers.local_addrs()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    fn process_event(&mut self, event: Event, now: Instant) {
        let fd = event.fd;

        if self.servers.contains(fd) {
            if event.readable {
                self.accept_clients(fd, now);
            }
            return;
        }

        if self.clients.contains(fd) {
            if event.readable {
                if let Some(client) = self.clients.get_mut(fd) {
                    let status = client.on_read(&mut self.ctx, now);
                    self.apply_status(fd, status, now);
                }
            }
            if event.writable {
                if let Some(client) = self.clients.get_mut(fd) {
                    let status = client.on_write(&mut self.ctx, now);
                    self.apply_status(fd, status, now);
                }
            }
            return;
        }

        if let Some(id) = self.ctx.cgi.session_for(fd) {
            self.process_cgi_event(id, event, now);
            return;
        }

        debug!(fd, "event for unknown descriptor");
    }

    fn accept_clients(&mut self, server_fd: RawFd, now: Instant) {
        let Some(listener) = self.servers.get(server_fd) else {
            return;
        };

        loop {
            match listener.accept() {
                Ok(Some((stream, peer))) => {
                    let fd = stream.as_raw_fd();
                    let connection = Connection::new(stream, listener.hosts(), now);
                    if self.ctx.watch(fd, Interest::READABLE).is_err() {
                        continue;
                    }
                    info!(client = fd, %peer, "accepted");
                    self.clients.insert(connection);
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(server = server_fd, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn apply_status(&mut self, fd: RawFd, status: IoStatus, now: Instant) {
        match status {
            IoStatus::Continue => {}
            IoStatus::ReadyToWrite => {
                if self.ctx.watch(fd, Interest::WRITABLE).is_err() {
                    self.remove_client(fd, now);
                }
            }
            IoStatus::WriteComplete => self.ctx.unwatch(fd, Interest::WRITABLE),
            IoStatus::ShouldShutdown => {
                if let Some(client) = self.clients.get_mut(fd) {
                    client.shutdown_write();
                }
                self.ctx.unwatch(fd, Interest::WRITABLE);
            }
            IoStatus::ShouldClose => self.remove_client(fd, now),
        }
    }

    fn remove_client(&mut self, fd: RawFd, now: Instant) {
        let Some(mut client) = self.clients.remove(fd) else {
            return;
        };
        self.ctx.unwatch(fd, Interest::BOTH);
        client.abort(&mut self.ctx, now);
        info!(client = fd, "connection closed");
    }

    fn process_cgi_event(&mut self, id: SessionId, event: Event, now: Instant) {
        let fd = event.fd;
        let Some(session) = self.ctx.cgi.get_mut(id) else {
            return;
        };
        let client_fd = session.client_fd();

        if event.writable && session.stdin_fd() == Some(fd) {
            match session.on_write(now) {
                CgiIo::Continue => {}
                CgiIo::WriteComplete => {
                    if let Err(e) = self.ctx.switch_to_stdout(id, fd, now) {
                        warn!(session = id, error = %e, "cannot watch cgi stdout");
                        if let Some(session) = self.ctx.cgi.get_mut(id) {
                            session.abort();
                        }
                        self.ctx.release_session_fds(id, now);
                        self.pump_client(client_fd, id, now);
                    }
                }
                CgiIo::ReadComplete | CgiIo::Error => {
                    self.ctx.release_session_fds(id, now);
                    self.pump_client(client_fd, id, now);
                }
            }
            return;
        }

        if event.readable && session.stdout_fd() == Some(fd) {
            match session.on_read(now) {
                CgiIo::Continue => self.pump_client(client_fd, id, now),
                CgiIo::ReadComplete => {
                    self.ctx.release_cgi_fd(fd, now);
                    self.pump_client(client_fd, id, now);
                }
                CgiIo::WriteComplete | CgiIo::Error => {
                    self.ctx.release_session_fds(id, now);
                    self.pump_client(client_fd, id, now);
                }
            }
        }
    }

    /// Lets the client owning session `id` pick up new CGI output.
    fn pump_client(&mut self, client_fd: RawFd, id: SessionId, now: Instant) {
        let Some(client) = self.clients.get_mut(client_fd) else {
            return;
        };
        if client.transaction().cgi_session() != Some(id) {
            return;
        }

        client.transaction_mut().process_cgi_session(&mut self.ctx, now);
        if client.transaction().has_response() && self.ctx.watch(client_fd, Interest::WRITABLE).is_err() {
            self.remove_client(client_fd, now);
        }
    }
}
