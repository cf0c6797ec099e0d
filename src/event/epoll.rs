//! Linux epoll backend (level-triggered).

use super::{Event, Interest, Readiness, timeout_millis};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

const INITIAL_EVENTS: usize = 64;
const MAX_EVENTS: usize = 1 << 16;

pub struct EpollBackend {
    epfd: OwnedFd,
    interests: HashMap<RawFd, Interest>,
    buffer: Vec<libc::epoll_event>,
}

impl EpollBackend {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            interests: HashMap::new(),
            buffer: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENTS],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: epoll_bits(interest),
            u64: fd as u64,
        };

        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn epoll_bits(interest: Interest) -> u32 {
    let mut bits = 0;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl Readiness for EpollBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let current = self.interests.get(&fd).copied();
        let wanted = current.unwrap_or_default().add(interest);
        if current == Some(wanted) {
            return Ok(());
        }

        match current {
            None => self.ctl(libc::EPOLL_CTL_ADD, fd, wanted)?,
            Some(_) => self.ctl(libc::EPOLL_CTL_MOD, fd, wanted)?,
        }
        self.interests.insert(fd, wanted);
        Ok(())
    }

    fn unwatch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let Some(current) = self.interests.get(&fd).copied() else {
            return Ok(());
        };

        let left = current.remove(interest);
        if left == current {
            return Ok(());
        }

        if left.is_empty() {
            self.interests.remove(&fd);
            if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::NONE) {
                // Closing a descriptor drops it from the epoll set on its own.
                if e.raw_os_error() != Some(libc::ENOENT) && e.raw_os_error() != Some(libc::EBADF) {
                    return Err(e);
                }
            }
        } else {
            self.ctl(libc::EPOLL_CTL_MOD, fd, left)?;
            self.interests.insert(fd, left);
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<()> {
        events.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.buffer.as_mut_ptr(),
                self.buffer.len() as libc::c_int,
                timeout_millis(timeout),
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let n = n as usize;
        for raw in &self.buffer[..n] {
            let bits = raw.events;
            let fd = raw.u64 as RawFd;
            let Some(interest) = self.interests.get(&fd).copied() else {
                continue;
            };

            let failed = bits & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
            events.push(Event {
                fd,
                readable: bits & libc::EPOLLIN as u32 != 0 || (failed && interest.is_readable()),
                writable: bits & libc::EPOLLOUT as u32 != 0 || (failed && interest.is_writable()),
            });
        }

        if n == self.buffer.len() && self.buffer.len() < MAX_EVENTS {
            let grown = self.buffer.len() * 2;
            self.buffer.resize(grown, libc::epoll_event { events: 0, u64: 0 });
        }
        Ok(())
    }

    fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }
}
