#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use portico::cgi::spawn::{CgiLaunch, CgiProcess, Signal, Spawn, SpawnedCgi};

/// The child's side of a fake CGI process.
pub struct ChildEnds {
    /// Reads what the server wrote to the child's stdin.
    pub stdin: UnixStream,
    /// Whatever is written here is the child's stdout.
    pub stdout: UnixStream,
}

pub struct FakeProcess {
    pid: u32,
    exited: Rc<Cell<bool>>,
    signals: Rc<RefCell<Vec<Signal>>>,
}

impl CgiProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&mut self) -> bool {
        self.exited.get()
    }

    fn signal(&mut self, signal: Signal) {
        self.signals.borrow_mut().push(signal);
        if signal == Signal::Kill {
            self.exited.set(true);
        }
    }
}

/// Spawner backed by socket pairs. Clones share state, so a test keeps one
/// handle after giving another to a `Context`.
#[derive(Clone, Default)]
pub struct FakeSpawner {
    pub launches: Rc<RefCell<Vec<CgiLaunch>>>,
    pub children: Rc<RefCell<Vec<ChildEnds>>>,
    pub signals: Rc<RefCell<Vec<Signal>>>,
    pub exited: Rc<Cell<bool>>,
    pub refuse: Rc<Cell<bool>>,
}

impl FakeSpawner {
    pub fn take_child(&self) -> ChildEnds {
        self.children.borrow_mut().remove(0)
    }

    pub fn last_launch(&self) -> CgiLaunch {
        self.launches.borrow().last().cloned().unwrap()
    }
}

impl Spawn for FakeSpawner {
    fn spawn(&mut self, launch: &CgiLaunch) -> io::Result<SpawnedCgi> {
        if self.refuse.get() {
            return Err(io::Error::other("spawn refused"));
        }
        let (server_in, child_in) = UnixStream::pair()?;
        let (server_out, child_out) = UnixStream::pair()?;
        server_in.set_nonblocking(true)?;
        server_out.set_nonblocking(true)?;

        self.launches.borrow_mut().push(launch.clone());
        self.children.borrow_mut().push(ChildEnds {
            stdin: child_in,
            stdout: child_out,
        });

        let pid = 40_000 + self.launches.borrow().len() as u32;
        Ok(SpawnedCgi {
            process: Box::new(FakeProcess {
                pid,
                exited: Rc::clone(&self.exited),
                signals: Rc::clone(&self.signals),
            }),
            stdin: File::from(OwnedFd::from(server_in)),
            stdout: File::from(OwnedFd::from(server_out)),
        })
    }
}
