use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::cgi::session::CgiSession;

pub type SessionId = u64;

/// Owns every live CGI session and maps pipe descriptors back to them.
///
/// A session is destroyed only when its client is gone *and* none of its
/// pipe descriptors is still registered. Whichever of the two happens last
/// triggers the removal, and the removed session is handed back so the
/// caller can adopt its process.
#[derive(Default)]
pub struct CgiRegistry {
    sessions: HashMap<SessionId, CgiSession>,
    fds: HashMap<RawFd, SessionId>,
    next_id: SessionId,
}

impl CgiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, session: CgiSession) -> SessionId {
        let id = self.next_id;
        self.next_id += 1;
        self.sessions.insert(id, session);
        id
    }

    /// Associates `fd` with session `id`. Duplicates are refused.
    pub fn add_fd(&mut self, fd: RawFd, id: SessionId) -> bool {
        if self.fds.contains_key(&fd) {
            error!(fd, "duplicate cgi fd");
            return false;
        }
        if !self.sessions.contains_key(&id) {
            error!(fd, session = id, "cgi fd for unknown session");
            return false;
        }
        self.fds.insert(fd, id);
        true
    }

    pub fn has_fd(&self, fd: RawFd) -> bool {
        self.fds.contains_key(&fd)
    }

    pub fn session_for(&self, fd: RawFd) -> Option<SessionId> {
        self.fds.get(&fd).copied()
    }

    pub fn get(&self, id: SessionId) -> Option<&CgiSession> {
        self.sessions.get(&id)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut CgiSession> {
        self.sessions.get_mut(&id)
    }

    /// Registered descriptors of session `id`.
    pub fn fds_of(&self, id: SessionId) -> Vec<RawFd> {
        self.fds
            .iter()
            .filter(|(_, sid)| **sid == id)
            .map(|(fd, _)| *fd)
            .collect()
    }

    /// Unregisters and closes `fd`. Returns the session if this removal was
    /// the last thing keeping it alive.
    pub fn remove_fd(&mut self, fd: RawFd) -> Option<CgiSession> {
        let id = self.fds.remove(&fd)?;
        let session = self.sessions.get_mut(&id)?;
        session.close_fd(fd);
        debug!(fd, session = id, "cgi fd closed");
        self.collect(id)
    }

    /// The client side let go of session `id`.
    pub fn detach_client(&mut self, id: SessionId) -> Option<CgiSession> {
        let session = self.sessions.get_mut(&id)?;
        session.mark_client_dead();
        self.collect(id)
    }

    /// Sessions whose pipes were idle for longer than `limit`.
    pub fn timed_out(&self, now: Instant, limit: Duration) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.is_timed_out(now, limit))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn all_fds(&self) -> Vec<RawFd> {
        self.fds.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// Removes everything, for shutdown.
    pub fn drain(&mut self) -> Vec<CgiSession> {
        self.fds.clear();
        self.sessions.drain().map(|(_, s)| s).collect()
    }

    fn collect(&mut self, id: SessionId) -> Option<CgiSession> {
        let session = self.sessions.get(&id)?;
        if session.is_client_alive() || self.fds.values().any(|sid| *sid == id) {
            return None;
        }
        debug!(session = id, pid = session.pid(), "cgi session destroyed");
        self.sessions.remove(&id)
    }
}
