//! Command sequencing over a byte stream.
//!
//! [`Session`] is the protocol-processing core shared by the readiness-based
//! connection and the cooperative backend: bytes in, response frames out.
//! It drives the parser, accumulates declared command bodies (including
//! their trailing CRLF), executes at most one command at a time against the
//! storage capability, and frames each response with a final `\r\n`.

use std::sync::Arc;

use tracing::trace;

use crate::error::ParseError;
use crate::protocol::{Command, Parser};
use crate::storage::Storage;

/// Result of feeding input into a session.
#[derive(Debug, Default)]
pub struct Feed {
    /// Bytes consumed from the front of the input.
    pub consumed: usize,
    /// Response frames produced, each terminated by `\r\n`, in request order.
    pub frames: Vec<Vec<u8>>,
}

pub struct Session {
    storage: Arc<dyn Storage>,
    parser: Parser,
    command: Option<Command>,
    body: Vec<u8>,
    /// Bytes still to receive for the current body, including the trailing
    /// `\r\n` that follows it on the wire.
    body_remaining: usize,
}

impl Session {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            parser: Parser::new(),
            command: None,
            body: Vec::new(),
            body_remaining: 0,
        }
    }

    /// Whether a command header has been recognized but not yet executed.
    pub fn command_in_progress(&self) -> bool {
        self.command.is_some()
    }

    /// Process `input` to fixpoint.
    ///
    /// Consumes as much as it can make progress on; unconsumed bytes must be
    /// offered again once more input arrives. A [`ParseError`] means the
    /// stream is unrecoverable and the caller should answer `ERROR` and stop
    /// reading.
    pub fn feed(&mut self, input: &[u8]) -> Result<Feed, ParseError> {
        let mut feed = Feed::default();

        loop {
            if self.command.is_none() {
                let progress = self.parser.parse(&input[feed.consumed..])?;
                feed.consumed += progress.consumed;
                if !progress.complete {
                    break;
                }

                let (command, body_len) = self.parser.build()?;
                trace!(command = self.parser.name(), body_len, "command recognized");
                self.body_remaining = if body_len > 0 { body_len + 2 } else { 0 };
                self.command = Some(command);
                self.parser.reset();
            }

            if self.body_remaining > 0 {
                let available = input.len() - feed.consumed;
                let take = self.body_remaining.min(available);
                if take == 0 {
                    break;
                }
                self.body
                    .extend_from_slice(&input[feed.consumed..feed.consumed + take]);
                feed.consumed += take;
                self.body_remaining -= take;
                if self.body_remaining > 0 {
                    break;
                }
            }

            let command = self.command.take().expect("command slot empty at execute");
            if command.body_len() > 0 {
                if !self.body.ends_with(b"\r\n") {
                    return Err(ParseError::InvalidCommand(
                        "data chunk must end with CRLF".to_string(),
                    ));
                }
                self.body.truncate(self.body.len() - 2);
            }

            let mut out = Vec::new();
            command.execute(self.storage.as_ref(), &self.body, &mut out);
            out.extend_from_slice(b"\r\n");
            if !command.noreply() {
                feed.frames.push(out);
            }
            self.body.clear();
        }

        Ok(feed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemStorage;

    fn session() -> Session {
        Session::new(Arc::new(MemStorage::new(1024 * 1024)))
    }

    fn frames_as_bytes(feed: &Feed) -> Vec<u8> {
        feed.frames.concat()
    }

    #[test]
    fn test_single_command() {
        let mut s = session();
        let feed = s.feed(b"set foo 0 0 3\r\nbar\r\n").unwrap();
        assert_eq!(feed.consumed, 20);
        assert_eq!(frames_as_bytes(&feed), b"STORED\r\n");
    }

    #[test]
    fn test_pipelined_commands() {
        let mut s = session();
        let feed = s.feed(b"set foo 0 0 3\r\nbar\r\nget foo\r\n").unwrap();
        assert_eq!(
            frames_as_bytes(&feed),
            b"STORED\r\nVALUE foo 0 3\r\nbar\r\nEND\r\n".to_vec()
        );
        assert!(!s.command_in_progress());
    }

    #[test]
    fn test_body_split_across_feeds() {
        let mut s = session();

        let feed = s.feed(b"set foo 0 0 5\r\nhel").unwrap();
        assert!(feed.frames.is_empty());
        assert!(s.command_in_progress());

        let feed = s.feed(b"lo\r\n").unwrap();
        assert_eq!(frames_as_bytes(&feed), b"STORED\r\n");
        assert!(!s.command_in_progress());
    }

    #[test]
    fn test_byte_at_a_time() {
        let input = b"set foo 0 0 3\r\nbar\r\nget foo\r\n";
        let mut s = session();
        let mut output = Vec::new();
        for &byte in input.iter() {
            let feed = s.feed(&[byte]).unwrap();
            assert_eq!(feed.consumed, 1);
            output.extend(frames_as_bytes(&feed));
        }
        assert_eq!(output, b"STORED\r\nVALUE foo 0 3\r\nbar\r\nEND\r\n");
    }

    #[test]
    fn test_noreply_suppresses_response() {
        let mut s = session();
        let feed = s.feed(b"set foo 0 0 3 noreply\r\nbar\r\nget foo\r\n").unwrap();
        assert_eq!(
            frames_as_bytes(&feed),
            b"VALUE foo 0 3\r\nbar\r\nEND\r\n".to_vec()
        );
    }

    #[test]
    fn test_protocol_error_propagates() {
        let mut s = session();
        assert!(s.feed(b"garbage\r\n").is_err());
    }

    #[test]
    fn test_bad_body_terminator() {
        let mut s = session();
        assert!(s.feed(b"set foo 0 0 3\r\nbarXX").is_err());
    }

    #[test]
    fn test_incomplete_header_consumes_into_state() {
        let mut s = session();
        let feed = s.feed(b"set fo").unwrap();
        assert_eq!(feed.consumed, 6);
        assert!(feed.frames.is_empty());

        let feed = s.feed(b"o 0 0 3\r\nbar\r\n").unwrap();
        assert_eq!(frames_as_bytes(&feed), b"STORED\r\n");
    }
}
