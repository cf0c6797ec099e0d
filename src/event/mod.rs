//! Readiness notification.
//!
//! Every backend answers the same three questions for the dispatcher: start
//! watching a descriptor, stop watching it, and tell me which watched
//! descriptors are ready. Exactly one backend exists per process and it is
//! chosen once at startup by [`select_backend`].
//!
//! ```text
//!   Dispatcher ──watch/unwatch──▶ dyn Readiness ──poll──▶ [Event]
//!                                    │
//!                 ┌──────────┬───────┴──┬──────────┬──────────┐
//!               epoll     kqueue      poll      select      lab
//! ```
//!
//! Backends are level-triggered: a descriptor that is still readable after a
//! handler ran is reported again on the next poll.

#[cfg(target_os = "linux")]
pub mod epoll;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub mod kqueue;
pub mod lab;
pub mod poll;
pub mod select;

use serde::Deserialize;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

/// Interest flags for a watched descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    /// No interest; a descriptor left with this is dropped from the backend.
    pub const NONE: Interest = Interest(0);
    /// Interest in readable events.
    pub const READABLE: Interest = Interest(0b01);
    /// Interest in writable events.
    pub const WRITABLE: Interest = Interest(0b10);
    /// Interest in both directions.
    pub const BOTH: Interest = Interest(0b11);

    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Combines interests.
    pub const fn add(self, other: Interest) -> Self {
        Interest(self.0 | other.0)
    }

    /// Removes interest.
    pub const fn remove(self, other: Interest) -> Self {
        Interest(self.0 & !other.0)
    }
}

/// One ready descriptor as reported by [`Readiness::poll`].
///
/// Readability and writability are independent; both may be set at once.
/// Hang-up and error conditions are folded into whichever direction the
/// descriptor is watched for, so the handler sees the failure on its next
/// `read`/`write`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
}

impl Event {
    pub fn readable(fd: RawFd) -> Self {
        Self { fd, readable: true, writable: false }
    }

    pub fn writable(fd: RawFd) -> Self {
        Self { fd, readable: false, writable: true }
    }
}

/// The capability every readiness backend provides.
pub trait Readiness {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Adds `interest` to whatever is already watched for `fd`.
    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Removes `interest` for `fd`. When nothing is left the descriptor is
    /// forgotten entirely. Unknown descriptors are ignored.
    fn unwatch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Blocks for at most `timeout` and fills `events` with ready
    /// descriptors. `events` is cleared first. An interrupted wait returns
    /// `Ok` with no events.
    fn poll(&mut self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<()>;

    /// Current interest for `fd`, if watched.
    fn interest(&self, fd: RawFd) -> Option<Interest>;
}

/// Which backend to build at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Best available for this platform.
    #[default]
    Auto,
    Epoll,
    Kqueue,
    Poll,
    Select,
}

/// Builds the process-wide readiness backend.
pub fn select_backend(kind: BackendKind) -> io::Result<Box<dyn Readiness>> {
    match kind {
        BackendKind::Auto => best_available(),
        BackendKind::Epoll => epoll_backend(),
        BackendKind::Kqueue => kqueue_backend(),
        BackendKind::Poll => Ok(Box::new(poll::PollBackend::new())),
        BackendKind::Select => Ok(Box::new(select::SelectBackend::new())),
    }
}

fn best_available() -> io::Result<Box<dyn Readiness>> {
    if let Ok(backend) = epoll_backend() {
        return Ok(backend);
    }
    if let Ok(backend) = kqueue_backend() {
        return Ok(backend);
    }
    Ok(Box::new(poll::PollBackend::new()))
}

#[cfg(target_os = "linux")]
fn epoll_backend() -> io::Result<Box<dyn Readiness>> {
    Ok(Box::new(epoll::EpollBackend::new()?))
}

#[cfg(not(target_os = "linux"))]
fn epoll_backend() -> io::Result<Box<dyn Readiness>> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "epoll is only available on Linux"))
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn kqueue_backend() -> io::Result<Box<dyn Readiness>> {
    Ok(Box::new(kqueue::KqueueBackend::new()?))
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn kqueue_backend() -> io::Result<Box<dyn Readiness>> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "kqueue is not available on this platform"))
}

/// Milliseconds for the C wait calls, rounded up so a tiny non-zero timeout
/// does not turn into a busy loop.
pub(crate) fn timeout_millis(timeout: Duration) -> libc::c_int {
    let mut ms = timeout.as_millis();
    if Duration::from_millis(ms as u64) < timeout {
        ms += 1;
    }
    ms.min(libc::c_int::MAX as u128) as libc::c_int
}
