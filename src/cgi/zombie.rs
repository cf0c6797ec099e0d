use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::cgi::spawn::{CgiProcess, Signal};

struct Pending {
    process: Box<dyn CgiProcess>,
    since: Instant,
    killed: bool,
}

/// Children whose session is gone but which may not have exited yet.
///
/// Exited children are dropped as soon as they are seen; the rest get
/// SIGKILL once they outstay the grace period.
pub struct ZombieRegistry {
    pending: Vec<Pending>,
    grace: Duration,
}

impl ZombieRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            pending: Vec::new(),
            grace,
        }
    }

    pub fn track(&mut self, mut process: Box<dyn CgiProcess>, now: Instant) {
        if process.has_exited() {
            debug!(pid = process.pid(), "cgi child already exited");
            return;
        }
        debug!(pid = process.pid(), "tracking cgi child");
        self.pending.push(Pending {
            process,
            since: now,
            killed: false,
        });
    }

    /// Drops exited children and kills overdue ones.
    pub fn manage(&mut self, now: Instant) {
        let grace = self.grace;
        self.pending.retain_mut(|p| {
            if p.process.has_exited() {
                debug!(pid = p.process.pid(), "cgi child reaped");
                return false;
            }
            if !p.killed && now.saturating_duration_since(p.since) > grace {
                warn!(pid = p.process.pid(), "cgi child outlived grace period; killing");
                p.process.signal(Signal::Kill);
                p.killed = true;
            }
            true
        });
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Collects every exited child of this process without blocking.
///
/// Called when SIGCHLD was seen. Returns how many were collected.
pub fn reap_all() -> usize {
    let mut reaped = 0;
    loop {
        let mut status = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }
        debug!(pid, "reaped child");
        reaped += 1;
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Stubborn {
        exited: Rc<Cell<bool>>,
        kills: Rc<Cell<usize>>,
    }

    impl CgiProcess for Stubborn {
        fn pid(&self) -> u32 {
            4242
        }

        fn has_exited(&mut self) -> bool {
            self.exited.get()
        }

        fn signal(&mut self, signal: Signal) {
            if signal == Signal::Kill {
                self.kills.set(self.kills.get() + 1);
                self.exited.set(true);
            }
        }
    }

    #[test]
    fn overdue_child_is_killed_once() {
        let exited = Rc::new(Cell::new(false));
        let kills = Rc::new(Cell::new(0));
        let start = Instant::now();
        let mut zombies = ZombieRegistry::new(Duration::from_secs(10));

        zombies.track(
            Box::new(Stubborn { exited: exited.clone(), kills: kills.clone() }),
            start,
        );
        zombies.manage(start + Duration::from_secs(5));
        assert_eq!(kills.get(), 0);
        assert_eq!(zombies.len(), 1);

        zombies.manage(start + Duration::from_secs(11));
        assert_eq!(kills.get(), 1);

        zombies.manage(start + Duration::from_secs(12));
        assert!(zombies.is_empty());
        assert_eq!(kills.get(), 1);
    }

    #[test]
    fn exited_child_is_not_tracked() {
        let mut zombies = ZombieRegistry::new(Duration::from_secs(10));
        zombies.track(
            Box::new(Stubborn {
                exited: Rc::new(Cell::new(true)),
                kills: Rc::new(Cell::new(0)),
            }),
            Instant::now(),
        );
        assert!(zombies.is_empty());
    }
}
