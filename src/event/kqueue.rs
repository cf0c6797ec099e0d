//! kqueue backend for macOS and the BSDs.
//!
//! kqueue reports read and write readiness as separate filter events; they
//! are merged back into one [`Event`] per descriptor.

use super::{Event, Interest, Readiness};
use std::collections::HashMap;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

const INITIAL_EVENTS: usize = 64;
const MAX_EVENTS: usize = 1 << 16;

pub struct KqueueBackend {
    kq: OwnedFd,
    interests: HashMap<RawFd, Interest>,
    buffer: Vec<libc::kevent>,
}

fn change(fd: RawFd, filter: i32, flags: u32) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { std::mem::zeroed() };
    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev
}

impl KqueueBackend {
    pub fn new() -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self {
            kq: unsafe { OwnedFd::from_raw_fd(kq) },
            interests: HashMap::new(),
            buffer: vec![unsafe { std::mem::zeroed() }; INITIAL_EVENTS],
        })
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let ret = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as _,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn changes_between(fd: RawFd, from: Interest, to: Interest) -> Vec<libc::kevent> {
        let mut changes = Vec::with_capacity(2);
        let filters = [
            (libc::EVFILT_READ as i32, from.is_readable(), to.is_readable()),
            (libc::EVFILT_WRITE as i32, from.is_writable(), to.is_writable()),
        ];
        for (filter, before, after) in filters {
            match (before, after) {
                (false, true) => changes.push(change(fd, filter, libc::EV_ADD as u32)),
                (true, false) => changes.push(change(fd, filter, libc::EV_DELETE as u32)),
                _ => {}
            }
        }
        changes
    }
}

impl Readiness for KqueueBackend {
    fn name(&self) -> &'static str {
        "kqueue"
    }

    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let current = self.interests.get(&fd).copied().unwrap_or_default();
        let wanted = current.add(interest);
        if wanted == current {
            return Ok(());
        }

        self.apply(&Self::changes_between(fd, current, wanted))?;
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
        } else {
            self.interests.insert(fd, left);
        }
        if let Err(e) = self.apply(&Self::changes_between(fd, current, left)) {
            if e.raw_os_error() != Some(libc::ENOENT) && e.raw_os_error() != Some(libc::EBADF) {
                return Err(e);
            }
        }
        Ok(())
    }

    fn poll(&mut self, timeout: Duration, events: &mut Vec<Event>) -> io::Result<()> {
        events.clear();

        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as _,
            tv_nsec: timeout.subsec_nanos() as _,
        };
        let n = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.buffer.as_mut_ptr(),
                self.buffer.len() as _,
                &ts,
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
        let mut merged: Vec<Event> = Vec::with_capacity(n);
        for raw in &self.buffer[..n] {
            let fd = raw.ident as RawFd;
            let Some(interest) = self.interests.get(&fd).copied() else {
                continue;
            };

            let failed = raw.flags as u32 & (libc::EV_EOF as u32 | libc::EV_ERROR as u32) != 0;
            let readable = raw.filter as i32 == libc::EVFILT_READ as i32;
            let writable = raw.filter as i32 == libc::EVFILT_WRITE as i32;

            let idx = match merged.iter().position(|e| e.fd == fd) {
                Some(idx) => idx,
                None => {
                    merged.push(Event { fd, readable: false, writable: false });
                    merged.len() - 1
                }
            };
            let slot = &mut merged[idx];
            slot.readable |= readable || (failed && interest.is_readable());
            slot.writable |= writable || (failed && interest.is_writable());
        }
        events.extend(merged);

        if n == self.buffer.len() && self.buffer.len() < MAX_EVENTS {
            let grown = self.buffer.len() * 2;
            self.buffer.resize(grown, unsafe { std::mem::zeroed() });
        }
        Ok(())
    }

    fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.interests.get(&fd).copied()
    }
}
