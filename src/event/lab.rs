//! Deterministic in-memory backend.
//!
//! Nothing touches the OS: `watch`/`unwatch` only record interest, and `poll`
//! hands back whatever events the test injected, filtered by the current
//! interest of each descriptor. Clones share state, so a test can keep one
//! handle while the dispatcher owns another.

use super::{Event, Interest, Readiness};
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

#[derive(Default)]
struct LabState {
    interests: HashMap<RawFd, Interest>,
    injected: VecDeque<Event>,
    polls: usize,
}

#[derive(Clone, Default)]
pub struct LabBackend {
    state: Rc<RefCell<LabState>>,
}

impl LabBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for the next `poll`.
    pub fn inject(&self, event: Event) {
        self.state.borrow_mut().injected.push_back(event);
    }

    /// Whether `fd` is currently watched for every bit of `interest`.
    pub fn is_watched(&self, fd: RawFd, interest: Interest) -> bool {
        self.state
            .borrow()
            .interests
            .get(&fd)
            .is_some_and(|current| current.add(interest) == *current)
    }

    /// Number of watched descriptors.
    pub fn watched(&self) -> usize {
        self.state.borrow().interests.len()
    }

    /// Number of completed `poll` calls.
    pub fn polls(&self) -> usize {
        self.state.borrow().polls
    }
}

impl Readiness for LabBackend {
    fn name(&self) -> &'static str {
        "lab"
    }

    fn watch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let entry = state.interests.entry(fd).or_default();
        *entry = entry.add(interest);
        Ok(())
    }

    fn unwatch(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        if let Some(current) = state.interests.get(&fd).copied() {
            let left = current.remove(interest);
            if left.is_empty() {
                state.interests.remove(&fd);
            } else {
                state.interests.insert(fd, left);
            }
        }
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration, events: &mut Vec<Event>) -> io::Result<()> {
        events.clear();
        let mut state = self.state.borrow_mut();
        state.polls += 1;

        while let Some(event) = state.injected.pop_front() {
            let Some(interest) = state.interests.get(&event.fd).copied() else {
                continue;
            };
            let filtered = Event {
                fd: event.fd,
                readable: event.readable && interest.is_readable(),
                writable: event.writable && interest.is_writable(),
            };
            if filtered.readable || filtered.writable {
                events.push(filtered);
            }
        }
        Ok(())
    }

    fn interest(&self, fd: RawFd) -> Option<Interest> {
        self.state.borrow().interests.get(&fd).copied()
    }
}
