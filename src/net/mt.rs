//! Multi-threaded non-blocking backend.
//!
//! N worker threads each run an independent reactor over a disjoint subset
//! of connections. Every worker binds its own SO_REUSEPORT listener, so the
//! kernel assigns each accepted socket to exactly one worker. Registrations
//! are edge-triggered; the read path drains until would-block.
//!
//! Each connection is guarded by a mutex around `start`/`do_read`/`do_write`
//! and mirrors its liveness into an atomic flag. Workers share no mutable
//! state beyond the storage capability, whose own locking is its business.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::net::connection::Connection;
use crate::net::{bind_listener, mio_interest, worker_count, Server};
use crate::storage::Storage;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// A connection slot in a worker's registry.
struct MtConn {
    conn: Mutex<Connection<TcpStream>>,
    alive: AtomicBool,
}

pub struct MtServer {
    config: Config,
    storage: Arc<dyn Storage>,
    wakers: Vec<Arc<Waker>>,
    handles: Vec<JoinHandle<()>>,
}

impl MtServer {
    pub fn new(config: &Config, storage: Arc<dyn Storage>) -> Self {
        Self {
            config: config.clone(),
            storage,
            wakers: Vec::new(),
            handles: Vec::new(),
        }
    }
}

impl Server for MtServer {
    fn start(&mut self) -> Result<SocketAddr, Error> {
        if !self.handles.is_empty() {
            return Err(Error::AlreadyStarted);
        }

        let workers = worker_count(self.config.workers);

        // Bind the first listener to resolve the port (the configured one may
        // be 0), then have the remaining workers share it via SO_REUSEPORT.
        let first = bind_listener(self.config.addr()?, true)?;
        let local_addr = first.local_addr()?;
        let mut listeners = vec![first];
        for _ in 1..workers {
            listeners.push(bind_listener(local_addr, true)?);
        }

        info!(addr = %local_addr, workers, "starting mt backend");

        for (worker_id, listener) in listeners.into_iter().enumerate() {
            let mut listener = TcpListener::from_std(listener);
            let poll = Poll::new()?;
            poll.registry()
                .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
            let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
            self.wakers.push(Arc::clone(&waker));

            let storage = Arc::clone(&self.storage);
            let config = self.config.clone();
            let handle = std::thread::Builder::new()
                .name(format!("embercache-mt-{worker_id}"))
                .spawn(move || {
                    if let Err(e) = worker_loop(worker_id, poll, listener, storage, &config) {
                        error!(worker = worker_id, error = %e, "worker failed");
                    }
                })
                .map_err(Error::Io)?;
            self.handles.push(handle);
        }

        Ok(local_addr)
    }

    fn stop(&self) {
        for waker in &self.wakers {
            let _ = waker.wake();
        }
    }

    fn join(&mut self) {
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(
    worker_id: usize,
    mut poll: Poll,
    listener: TcpListener,
    storage: Arc<dyn Storage>,
    config: &Config,
) -> io::Result<()> {
    let mut events = Events::with_capacity(256);
    let mut connections: Slab<MtConn> = Slab::new();

    debug!(worker = worker_id, "worker started");

    'reactor: loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {
                    debug!(worker = worker_id, "wakeup received, stopping worker");
                    break 'reactor;
                }
                LISTENER_TOKEN => {
                    accept_connections(
                        worker_id,
                        &listener,
                        &mut poll,
                        &mut connections,
                        &storage,
                        config,
                    )?;
                }
                Token(id) => {
                    handle_connection_event(id, event, &mut poll, &mut connections)?;
                }
            }
        }
    }

    let open = connections.len();
    for (_, slot) in connections {
        let mut conn = slot.conn.lock().unwrap_or_else(|p| p.into_inner());
        let _ = poll.registry().deregister(conn.stream_mut());
    }
    info!(worker = worker_id, closed = open, "worker stopped");
    Ok(())
}

fn accept_connections(
    worker_id: usize,
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<MtConn>,
    storage: &Arc<dyn Storage>,
    config: &Config,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= config.max_connections {
                    warn!(worker = worker_id, "connection limit reached, rejecting");
                    continue;
                }

                let entry = connections.vacant_entry();
                let id = entry.key();
                let mut conn = Connection::new(stream, Arc::clone(storage), config.buffer_size);
                conn.start(true);
                let interest = mio_interest(conn.interest());

                let slot = entry.insert(MtConn {
                    conn: Mutex::new(conn),
                    alive: AtomicBool::new(true),
                });
                let mut conn = slot.conn.lock().unwrap_or_else(|p| p.into_inner());
                poll.registry()
                    .register(conn.stream_mut(), Token(id), interest)?;
                debug!(worker = worker_id, conn_id = id, peer = %peer_addr, "accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(worker = worker_id, error = %e, "accept failed");
                break;
            }
        }
    }
    Ok(())
}

fn handle_connection_event(
    id: usize,
    event: &mio::event::Event,
    poll: &mut Poll,
    connections: &mut Slab<MtConn>,
) -> io::Result<()> {
    let Some(slot) = connections.get(id) else {
        return Ok(());
    };
    if !slot.alive.load(Ordering::SeqCst) {
        return Ok(());
    }

    let mut conn = slot.conn.lock().unwrap_or_else(|p| p.into_inner());
    let old_mask = conn.interest();

    if event.is_error() {
        conn.on_error();
    } else {
        if event.is_readable() {
            if let Err(e) = conn.do_read() {
                debug!(conn_id = id, error = %e, "read failed");
            }
        }
        if conn.is_alive() && event.is_writable() {
            if let Err(e) = conn.do_write() {
                debug!(conn_id = id, error = %e, "write failed");
            }
        }
        if conn.is_alive() && event.is_read_closed() && event.is_write_closed() {
            conn.on_close();
        }
    }

    slot.alive.store(conn.is_alive(), Ordering::SeqCst);

    if !conn.is_alive() {
        drop(conn);
        let slot = connections.remove(id);
        let mut conn = slot.conn.lock().unwrap_or_else(|p| p.into_inner());
        let _ = poll.registry().deregister(conn.stream_mut());
        debug!(conn_id = id, "connection closed");
    } else if conn.interest() != old_mask {
        let interest = mio_interest(conn.interest());
        poll.registry()
            .reregister(conn.stream_mut(), Token(id), interest)?;
    }

    Ok(())
}
