//! Starting CGI programs.
//!
//! Sessions never fork directly: they ask a [`Spawn`] implementation for a
//! running process plus the two non-blocking pipe ends. Production uses
//! [`CommandSpawner`]; tests plug in socket pairs.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tracing::debug;

use crate::http::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM, the polite request.
    Terminate,
    /// SIGKILL.
    Kill,
}

/// A child process as seen by sessions and the zombie registry.
pub trait CgiProcess {
    fn pid(&self) -> u32;

    /// Non-blocking check. A process that can no longer be queried counts
    /// as exited.
    fn has_exited(&mut self) -> bool;

    /// Best-effort; failures are ignored.
    fn signal(&mut self, signal: Signal);
}

/// What to run and with which environment.
#[derive(Debug, Clone)]
pub struct CgiLaunch {
    pub program: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CgiLaunch {
    /// Builds the CGI/1.1 environment for `request`.
    ///
    /// Only REQUEST_METHOD, CONTENT_LENGTH, CONTENT_TYPE and QUERY_STRING
    /// are passed. The body goes to stdin, never into QUERY_STRING.
    pub fn from_request(program: &Path, request: &Request) -> Self {
        let content_length = if request.body.is_empty() {
            request.header("Content-Length").unwrap_or("").to_string()
        } else {
            request.body.len().to_string()
        };

        let env = vec![
            ("REQUEST_METHOD".to_string(), request.method.as_str().to_string()),
            ("CONTENT_LENGTH".to_string(), content_length),
            (
                "CONTENT_TYPE".to_string(),
                request.content_type().unwrap_or("").to_string(),
            ),
            (
                "QUERY_STRING".to_string(),
                request.query.clone().unwrap_or_default(),
            ),
        ];

        Self {
            program: program.to_path_buf(),
            env,
        }
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A started CGI program. Both pipe ends are already non-blocking.
pub struct SpawnedCgi {
    pub process: Box<dyn CgiProcess>,
    /// Write end of the child's stdin.
    pub stdin: File,
    /// Read end of the child's stdout.
    pub stdout: File,
}

pub trait Spawn {
    fn spawn(&mut self, launch: &CgiLaunch) -> io::Result<SpawnedCgi>;
}

/// Runs the program directly, with no interpreter and no arguments.
#[derive(Debug, Default)]
pub struct CommandSpawner;

impl Spawn for CommandSpawner {
    fn spawn(&mut self, launch: &CgiLaunch) -> io::Result<SpawnedCgi> {
        let mut child = Command::new(&launch.program)
            .env_clear()
            .envs(launch.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(io::Error::other("cgi pipes were not created"));
        };

        let stdin = File::from(OwnedFd::from(stdin));
        let stdout = File::from(OwnedFd::from(stdout));
        if let Err(e) = set_nonblocking(stdin.as_raw_fd()).and(set_nonblocking(stdout.as_raw_fd())) {
            let _ = child.kill();
            return Err(e);
        }

        debug!(pid = child.id(), program = %launch.program.display(), "cgi spawned");
        Ok(SpawnedCgi {
            process: Box::new(ChildProcess { child }),
            stdin,
            stdout,
        })
    }
}

pub struct ChildProcess {
    child: Child,
}

impl CgiProcess for ChildProcess {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }

    /// Signals only a child that has not been waited for. A pid collected
    /// elsewhere may already name another process.
    fn signal(&mut self, signal: Signal) {
        if self.has_exited() {
            debug!(pid = self.child.id(), ?signal, "child already exited; not signalled");
            return;
        }
        match signal {
            Signal::Kill => {
                let _ = self.child.kill();
            }
            Signal::Terminate => {
                unsafe {
                    libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
                }
            }
        }
    }
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
