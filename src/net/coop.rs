//! Single-threaded cooperative backend.
//!
//! One thread hosts a current-thread tokio runtime. The acceptor runs as one
//! task; every connection gets its own task running a long-lived
//! read/process/write loop whose suspension points are exactly the places
//! the non-blocking backends would see would-block. A watch channel is the
//! wakeup object: `stop` flips it, the acceptor breaks out, every connection
//! task observes it at its next suspension point, and the reactor waits for
//! all of them before returning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::Error;
use crate::net::session::Session;
use crate::net::{bind_listener, Server};
use crate::storage::Storage;

pub struct CoopServer {
    config: Config,
    storage: Arc<dyn Storage>,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<()>>,
}

impl CoopServer {
    pub fn new(config: &Config, storage: Arc<dyn Storage>) -> Self {
        Self {
            config: config.clone(),
            storage,
            shutdown: None,
            handle: None,
        }
    }
}

impl Server for CoopServer {
    fn start(&mut self) -> Result<SocketAddr, Error> {
        if self.handle.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let listener = bind_listener(self.config.addr()?, false)?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);

        info!(addr = %local_addr, "starting coop backend");

        let storage = Arc::clone(&self.storage);
        let buffer_size = self.config.buffer_size;
        let handle = std::thread::Builder::new()
            .name("embercache-coop".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_io()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "failed to build runtime");
                        return;
                    }
                };
                runtime.block_on(async move {
                    if let Err(e) = acceptor(listener, storage, buffer_size, rx).await {
                        error!(error = %e, "acceptor failed");
                    }
                });
            })
            .map_err(Error::Io)?;
        self.handle = Some(handle);

        Ok(local_addr)
    }

    fn stop(&self) {
        if let Some(tx) = &self.shutdown {
            let _ = tx.send(true);
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

async fn acceptor(
    listener: std::net::TcpListener,
    storage: Arc<dyn Storage>,
    buffer_size: usize,
    shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = TcpListener::from_std(listener)?;
    let mut tasks = JoinSet::new();
    let mut stop = shutdown.clone();

    loop {
        tokio::select! {
            _ = stop.changed() => {
                debug!("wakeup received, stopping acceptor");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "accepted connection");
                    let storage = Arc::clone(&storage);
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        serve_connection(stream, storage, buffer_size, shutdown).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    }

    // Let every connection task observe the shutdown and finish before the
    // reactor itself returns; no task is dropped while it may still run.
    let open = tasks.len();
    while tasks.join_next().await.is_some() {}
    info!(closed = open, "coop backend stopped");
    Ok(())
}

/// Long-lived per-connection loop. Suspension points: the read when no input
/// is available and the writes while the socket is backed up.
async fn serve_connection(
    mut stream: TcpStream,
    storage: Arc<dyn Storage>,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut session = Session::new(storage);
    let mut buf = BytesMut::with_capacity(buffer_size);

    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => {
                debug!("connection unblocked for shutdown");
                return;
            }
            read = stream.read_buf(&mut buf) => match read {
                Ok(n) => n,
                Err(e) => {
                    debug!(error = %e, "read failed");
                    return;
                }
            }
        };
        if n == 0 {
            debug!("connection closed by peer");
            return;
        }

        match session.feed(&buf) {
            Ok(feed) => {
                buf.advance(feed.consumed);
                for frame in feed.frames {
                    if let Err(e) = stream.write_all(&frame).await {
                        debug!(error = %e, "write failed");
                        return;
                    }
                }
            }
            Err(e) => {
                debug!(error = %e, "protocol error");
                let _ = stream.write_all(b"ERROR\r\n").await;
                return;
            }
        }
    }
}
