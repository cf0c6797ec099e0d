//! Portable `poll(2)` backend.

use super::{Event, Interest, Readiness, timeout_millis};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

#[derive(Default)]
pub struct PollBackend {
    interests: BTreeMap<RawFd, Interest>,
    pollfds: Vec<libc::pollfd>,
}

impl PollBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Readiness for PollBackend {
    fn name(&self) -> &'static str {
        "poll"
    }

    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let entry = self.interests.entry(fd).or_default();
        *entry = entry.add(interest);
        Ok(())
    }

    fn unwatch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if let Some(current) = self.interests.get(&fd).copied() {
            let left = current.remove(interest);
            if left.is_empty() {
                self.interests.remove(&fd);
            } else {
                self.interests.insert(fd, left);
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<()> {
        events.clear();

        self.pollfds.clear();
        for (&fd, interest) in &self.interests {
            let mut bits = 0;
            if interest.is_readable() {
                bits |= libc::POLLIN;
            }
            if interest.is_writable() {
                bits |= libc::POLLOUT;
            }
            self.pollfds.push(libc::pollfd { fd, events: bits, revents: 0 });
        }

        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
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

        for pfd in &self.pollfds {
            if pfd.revents == 0 {
                continue;
            }
            let failed = pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0;
            let readable = pfd.revents & libc::POLLIN != 0 || (failed && pfd.events & libc::POLLIN != 0);
            let writable = pfd.revents & libc::POLLOUT != 0 || (failed && pfd.events & libc::POLLOUT != 0);
            if readable || writable {
                events.push(Event { fd: pfd.fd, readable, writable });
            }
        }
        Ok(())
    }

    fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn both_directions_reported_together() {
        let mut backend = PollBackend::new();
        let (mut a, b) = UnixStream::pair().unwrap();
        let fd = b.as_raw_fd();

        backend.watch(fd, Interest::BOTH).unwrap();
        a.write_all(b"x").unwrap();

        let mut events = Vec::new();
        backend.poll(Duration::from_millis(100), &mut events).unwrap();
        assert_eq!(events, vec![Event { fd, readable: true, writable: true }]);
    }

    #[test]
    fn timeout_without_events() {
        let mut backend = PollBackend::new();
        let (_a, b) = UnixStream::pair().unwrap();
        backend.watch(b.as_raw_fd(), Interest::READABLE).unwrap();

        let mut events = vec![Event::readable(99)];
        backend.poll(Duration::from_millis(10), &mut events).unwrap();
        assert!(events.is_empty());
    }
}
