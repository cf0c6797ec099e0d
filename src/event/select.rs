//! `select(2)` backend, the last-resort fallback.
//!
//! Descriptors at or above `FD_SETSIZE` cannot be represented in an
//! `fd_set` and are rejected at `watch` time.

use super::{Event, Interest, Readiness};
use std::collections::BTreeMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

#[derive(Default)]
pub struct SelectBackend {
    interests: BTreeMap<RawFd, Interest>,
}

impl SelectBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn empty_set() -> libc::fd_set {
    let mut set = MaybeUninit::<libc::fd_set>::uninit();
    unsafe {
        libc::FD_ZERO(set.as_mut_ptr());
        set.assume_init()
    }
}

impl Readiness for SelectBackend {
    fn name(&self) -> &'static str {
        "select"
    }

    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("descriptor {fd} does not fit in an fd_set"),
            ));
        }
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

        let mut read_set = empty_set();
        let mut write_set = empty_set();
        let mut max_fd = -1;
        for (&fd, interest) in &self.interests {
            if interest.is_readable() {
                unsafe { libc::FD_SET(fd, &mut read_set) };
            }
            if interest.is_writable() {
                unsafe { libc::FD_SET(fd, &mut write_set) };
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as _,
            tv_usec: timeout.subsec_micros() as _,
        };
        let n = unsafe {
            libc::select(max_fd + 1, &mut read_set, &mut write_set, ptr::null_mut(), &mut tv)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }

        for &fd in self.interests.keys() {
            let readable = unsafe { libc::FD_ISSET(fd, &read_set) };
            let writable = unsafe { libc::FD_ISSET(fd, &write_set) };
            if readable || writable {
                events.push(Event { fd, readable, writable });
            }
        }
        Ok(())
    }

    fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }
}
