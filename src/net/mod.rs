//! Network layer: per-connection state machine and the reactor backends.
//!
//! All backends satisfy the same contract: `start` binds the listener and
//! launches the reactor loop(s), `stop` signals shutdown through the
//! backend's wakeup object, `join` blocks until every loop has returned.

pub mod connection;
pub mod coop;
pub mod mt;
pub mod session;
pub mod st;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::{Backend, Config};
use crate::error::Error;
use crate::net::connection::InterestMask;
use crate::storage::Storage;

/// External surface of a reactor backend.
pub trait Server {
    /// Bind the listening socket(s) and launch the reactor loop(s).
    /// Returns the bound address (useful when binding port 0).
    fn start(&mut self) -> Result<SocketAddr, Error>;

    /// Signal shutdown via the wakeup object. Idempotent; safe from any
    /// thread.
    fn stop(&self);

    /// Block until all reactor loops have returned.
    fn join(&mut self);
}

/// Construct the backend selected by the configuration.
pub fn build(config: &Config, storage: Arc<dyn Storage>) -> Box<dyn Server> {
    match config.backend {
        Backend::St => Box::new(st::StServer::new(config, storage)),
        Backend::Mt => Box::new(mt::MtServer::new(config, storage)),
        Backend::Coop => Box::new(coop::CoopServer::new(config, storage)),
    }
}

/// Create a non-blocking TCP listener, optionally with SO_REUSEPORT so
/// several reactors can share one port with kernel load balancing.
pub(crate) fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Translate a connection's interest mask into mio terms. mio registrations
/// are edge-style on epoll, which is what the mask's edge bit records.
pub(crate) fn mio_interest(mask: InterestMask) -> mio::Interest {
    match (mask.is_readable(), mask.is_writable()) {
        (true, true) => mio::Interest::READABLE | mio::Interest::WRITABLE,
        (false, true) => mio::Interest::WRITABLE,
        // A live connection always wants at least one of the two; default
        // to readable so the registration stays valid.
        _ => mio::Interest::READABLE,
    }
}

pub(crate) fn worker_count(configured: usize) -> usize {
    if configured == 0 {
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    } else {
        configured
    }
}
