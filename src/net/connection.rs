//! Per-socket connection state machine.
//!
//! A [`Connection`] owns its socket, a fixed-size read buffer, the protocol
//! [`Session`], and the outbound frame queue. The reactor drives it through
//! `start` / `do_read` / `do_write` / `on_close` / `on_error`; the connection
//! answers by mutating its interest mask, which the reactor re-arms after
//! each callback.
//!
//! Lifecycle is monotonic: `New -> Active -> Draining -> Dead`. Draining
//! means no further input is wanted (peer half-close or protocol error) but
//! queued responses are still being flushed. Once `Dead`, the reactor
//! deregisters and drops the connection, closing the socket exactly once.

use std::collections::VecDeque;
use std::io::{self, IoSlice, Read, Write};
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::net::session::Session;
use crate::storage::Storage;

/// Default read buffer capacity.
pub const READ_BUFFER_SIZE: usize = 4096;

/// Event kinds the connection asks the reactor to deliver.
///
/// `EDGE` records which notification regime the reactor registered the
/// socket under; the read loop drains until would-block when it is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestMask {
    bits: u8,
}

impl InterestMask {
    pub const READABLE: u8 = 0b001;
    pub const WRITABLE: u8 = 0b010;
    pub const EDGE: u8 = 0b100;

    pub fn add(&mut self, bit: u8) {
        self.bits |= bit;
    }

    pub fn remove(&mut self, bit: u8) {
        self.bits &= !bit;
    }

    pub fn is_readable(&self) -> bool {
        self.bits & Self::READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.bits & Self::WRITABLE != 0
    }

    pub fn is_edge(&self) -> bool {
        self.bits & Self::EDGE != 0
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Constructed but not yet started.
    New,
    /// Reading requests and writing responses.
    Active,
    /// No further input wanted; flushing queued responses.
    Draining,
    /// Terminal. The socket is closed when the connection is dropped.
    Dead,
}

pub struct Connection<S> {
    stream: S,
    state: ConnState,
    interest: InterestMask,
    read_buf: Vec<u8>,
    read_filled: usize,
    session: Session,
    /// Response frames awaiting transmission, in request order.
    queue: VecDeque<Vec<u8>>,
    /// Bytes of the queue front already transmitted.
    head_written: usize,
}

impl<S: Read + Write> Connection<S> {
    pub fn new(stream: S, storage: Arc<dyn Storage>, buffer_size: usize) -> Self {
        Self {
            stream,
            state: ConnState::New,
            interest: InterestMask::default(),
            read_buf: vec![0u8; buffer_size],
            read_filled: 0,
            session: Session::new(storage),
            queue: VecDeque::new(),
            head_written: 0,
        }
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_alive(&self) -> bool {
        self.state != ConnState::Dead
    }

    pub fn interest(&self) -> InterestMask {
        self.interest
    }

    /// Begin the `New -> Active` transition, declaring the notification
    /// regime the reactor registered the socket under.
    pub fn start(&mut self, edge: bool) {
        debug_assert_eq!(self.state, ConnState::New, "start called twice");
        self.interest = InterestMask::default();
        self.interest.add(InterestMask::READABLE);
        if edge {
            self.interest.add(InterestMask::EDGE);
        }
        self.state = ConnState::Active;
    }

    /// Unrecoverable socket error reported by the reactor.
    pub fn on_error(&mut self) {
        warn!("connection error");
        self.state = ConnState::Dead;
    }

    /// Hangup reported by the reactor.
    pub fn on_close(&mut self) {
        debug!("connection closed by peer");
        self.state = ConnState::Dead;
    }

    /// Read and process input until would-block (edge) or after one
    /// successful read (level).
    pub fn do_read(&mut self) -> io::Result<()> {
        loop {
            match self.stream.read(&mut self.read_buf[self.read_filled..]) {
                Ok(0) => {
                    self.peer_closed();
                    return Ok(());
                }
                Ok(n) => {
                    trace!(n, "read from socket");
                    self.read_filled += n;
                    self.process();
                    if self.state != ConnState::Active {
                        return Ok(());
                    }
                    if !self.interest.is_edge() {
                        return Ok(());
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ConnState::Dead;
                    return Err(e);
                }
            }
        }
    }

    /// Run the session to fixpoint over the buffered input.
    fn process(&mut self) {
        let feed = match self.session.feed(&self.read_buf[..self.read_filled]) {
            Ok(feed) => feed,
            Err(e) => {
                debug!(error = %e, "protocol error");
                self.enqueue(b"ERROR\r\n".to_vec());
                self.interest.remove(InterestMask::READABLE);
                self.state = ConnState::Draining;
                self.read_filled = 0;
                return;
            }
        };

        if feed.consumed > 0 {
            self.read_buf.copy_within(feed.consumed..self.read_filled, 0);
            self.read_filled -= feed.consumed;
        }
        for frame in feed.frames {
            self.enqueue(frame);
        }
    }

    fn enqueue(&mut self, frame: Vec<u8>) {
        if self.queue.is_empty() {
            self.interest.add(InterestMask::WRITABLE);
        }
        self.queue.push_back(frame);
    }

    /// `read` returned 0: the peer half-closed.
    fn peer_closed(&mut self) {
        if self.queue.is_empty() {
            debug!("peer closed, nothing to flush");
            self.state = ConnState::Dead;
        } else {
            debug!(pending = self.queue.len(), "peer closed, draining output");
            self.interest.remove(InterestMask::READABLE);
            self.interest.add(InterestMask::WRITABLE);
            self.state = ConnState::Draining;
        }
    }

    /// Perform one vectored write over the output queue, resuming at byte
    /// `head_written` of the queue front.
    pub fn do_write(&mut self) -> io::Result<()> {
        if self.queue.is_empty() {
            self.interest.remove(InterestMask::WRITABLE);
            return Ok(());
        }

        let mut iovs: Vec<IoSlice<'_>> = Vec::with_capacity(self.queue.len());
        let mut frames = self.queue.iter();
        let front = frames.next().expect("queue front");
        iovs.push(IoSlice::new(&front[self.head_written..]));
        for frame in frames {
            iovs.push(IoSlice::new(frame));
        }

        let written = loop {
            match self.stream.write_vectored(&iovs) {
                Ok(0) => {
                    self.state = ConnState::Dead;
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket write returned 0",
                    ));
                }
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ConnState::Dead;
                    return Err(e);
                }
            }
        };
        trace!(written, "wrote to socket");

        // Consume whole frames; the remainder becomes the new front offset.
        let mut offset = self.head_written + written;
        while let Some(front) = self.queue.front() {
            if offset >= front.len() {
                offset -= front.len();
                self.queue.pop_front();
            } else {
                break;
            }
        }
        self.head_written = offset;

        if self.queue.is_empty() {
            debug_assert_eq!(self.head_written, 0);
            self.interest.remove(InterestMask::WRITABLE);
            if self.state == ConnState::Draining {
                debug!("output drained, closing");
                self.state = ConnState::Dead;
            }
        }

        Ok(())
    }
}
