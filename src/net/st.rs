//! Single-threaded non-blocking backend.
//!
//! One thread runs a mio poll loop over the listening socket, a wakeup
//! object, and every client connection. All connection callbacks execute on
//! that thread, so per-connection state needs no synchronization.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::net::connection::Connection;
use crate::net::{bind_listener, mio_interest, Server};
use crate::storage::Storage;

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

pub struct StServer {
    config: Config,
    storage: Arc<dyn Storage>,
    waker: Option<Arc<Waker>>,
    handle: Option<JoinHandle<()>>,
}

impl StServer {
    pub fn new(config: &Config, storage: Arc<dyn Storage>) -> Self {
        Self {
            config: config.clone(),
            storage,
            waker: None,
            handle: None,
        }
    }
}

impl Server for StServer {
    fn start(&mut self) -> Result<SocketAddr, Error> {
        if self.handle.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let listener = bind_listener(self.config.addr()?, false)?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        self.waker = Some(Arc::clone(&waker));

        info!(addr = %local_addr, "starting st backend");

        let storage = Arc::clone(&self.storage);
        let config = self.config.clone();
        let handle = std::thread::Builder::new()
            .name("embercache-st".to_string())
            .spawn(move || {
                if let Err(e) = event_loop(poll, listener, storage, &config) {
                    error!(error = %e, "reactor failed");
                }
            })
            .map_err(Error::Io)?;
        self.handle = Some(handle);

        Ok(local_addr)
    }

    fn stop(&self) {
        if let Some(waker) = &self.waker {
            let _ = waker.wake();
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn event_loop(
    mut poll: Poll,
    listener: TcpListener,
    storage: Arc<dyn Storage>,
    config: &Config,
) -> io::Result<()> {
    let mut events = Events::with_capacity(256);
    let mut connections: Slab<Connection<TcpStream>> = Slab::new();

    'reactor: loop {
        poll.poll(&mut events, None)?;

        for event in events.iter() {
            match event.token() {
                WAKER_TOKEN => {
                    debug!("wakeup received, stopping reactor");
                    break 'reactor;
                }
                LISTENER_TOKEN => {
                    accept_connections(&listener, &mut poll, &mut connections, &storage, config)?;
                }
                Token(id) => {
                    handle_connection_event(id, event, &mut poll, &mut connections)?;
                }
            }
        }
    }

    // Shutdown: deregister and close every remaining connection.
    let open = connections.len();
    for (_, mut conn) in connections {
        let _ = poll.registry().deregister(conn.stream_mut());
    }
    info!(closed = open, "st backend stopped");
    Ok(())
}

fn accept_connections(
    listener: &TcpListener,
    poll: &mut Poll,
    connections: &mut Slab<Connection<TcpStream>>,
    storage: &Arc<dyn Storage>,
    config: &Config,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if connections.len() >= config.max_connections {
                    warn!("connection limit reached, rejecting");
                    continue;
                }

                let entry = connections.vacant_entry();
                let id = entry.key();
                let mut conn = Connection::new(stream, Arc::clone(storage), config.buffer_size);
                conn.start(true);

                let conn = entry.insert(conn);
                let interest = mio_interest(conn.interest());
                poll.registry()
                    .register(conn.stream_mut(), Token(id), interest)?;
                debug!(conn_id = id, peer = %peer_addr, "accepted connection");
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                error!(error = %e, "accept failed");
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
    connections: &mut Slab<Connection<TcpStream>>,
) -> io::Result<()> {
    let Some(conn) = connections.get_mut(id) else {
        return Ok(());
    };
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

    if !conn.is_alive() {
        let mut conn = connections.remove(id);
        let _ = poll.registry().deregister(conn.stream_mut());
        debug!(conn_id = id, "connection closed");
    } else if conn.interest() != old_mask {
        let interest = mio_interest(conn.interest());
        poll.registry()
            .reregister(conn.stream_mut(), Token(id), interest)?;
    }

    Ok(())
}
