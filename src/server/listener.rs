use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;

use anyhow::bail;
use tracing::{error, info};

use crate::config::Config;
use crate::route::{Resolve, VirtualHosts};

/// One bound listening socket and the virtual hosts reachable through it.
pub struct Listener {
    socket: TcpListener,
    addr: SocketAddr,
    hosts: Rc<dyn Resolve>,
}

impl Listener {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn hosts(&self) -> Rc<dyn Resolve> {
        Rc::clone(&self.hosts)
    }

    /// Accepts one pending connection, switched to non-blocking mode.
    /// `Ok(None)` when nothing is pending.
    pub fn accept(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        match self.socket.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(true)?;
                Ok(Some((stream, peer)))
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Listening sockets by descriptor. Dropping the registry closes them.
#[derive(Default)]
pub struct ServerRegistry {
    listeners: HashMap<RawFd, Listener>,
}

impl ServerRegistry {
    /// Binds every distinct listen address in `config`.
    ///
    /// An address that fails to bind is logged and skipped; having none
    /// bound at all is fatal.
    pub fn bind(config: &Config) -> anyhow::Result<Self> {
        let mut registry = Self::default();

        for addr in config.listen_addrs() {
            let servers: Vec<_> = config
                .servers
                .iter()
                .filter(|s| s.listen.contains(&addr))
                .cloned()
                .collect();
            let hosts: Rc<dyn Resolve> = Rc::new(VirtualHosts::new(&servers)?);

            match bind_nonblocking(addr) {
                Ok(socket) => {
                    let addr = socket.local_addr().unwrap_or(addr);
                    info!(%addr, servers = servers.len(), "listening");
                    registry
                        .listeners
                        .insert(socket.as_raw_fd(), Listener { socket, addr, hosts });
                }
                Err(e) => error!(%addr, error = %e, "bind failed"),
            }
        }

        if registry.listeners.is_empty() {
            bail!("no listen address could be bound");
        }
        Ok(registry)
    }

    pub fn get(&self, fd: RawFd) -> Option<&Listener> {
        self.listeners.get(&fd)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.listeners.contains_key(&fd)
    }

    pub fn fds(&self) -> Vec<RawFd> {
        self.listeners.keys().copied().collect()
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.values().map(Listener::local_addr).collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

fn bind_nonblocking(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = TcpListener::bind(addr)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}
