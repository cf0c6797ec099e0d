//! Process signal wiring.
//!
//! Handlers only raise flags; the event loop looks at them between polls.
//! A signal arriving during the wait interrupts it, which the backends
//! report as an empty set of events.

use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};
use signal_hook::flag;
use tracing::debug;

/// Flags raised by the registered handlers.
#[derive(Debug, Clone, Default)]
pub struct SignalFlags {
    /// SIGINT or SIGTERM.
    pub shutdown: Arc<AtomicBool>,
    /// A child changed state.
    pub child: Arc<AtomicBool>,
}

impl SignalFlags {
    /// Registers the handlers and ignores SIGPIPE, so writing to a closed
    /// peer fails with `EPIPE` instead of killing the process.
    pub fn install() -> io::Result<Self> {
        let flags = Self::default();
        flag::register(SIGINT, Arc::clone(&flags.shutdown))?;
        flag::register(SIGTERM, Arc::clone(&flags.shutdown))?;
        flag::register(SIGCHLD, Arc::clone(&flags.child))?;
        ignore_sigpipe()?;
        debug!("signal handlers installed");
        Ok(flags)
    }
}

fn ignore_sigpipe() -> io::Result<()> {
    if unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) } == libc::SIG_ERR {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
