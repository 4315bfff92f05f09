//! Incremental parser for the memcached text protocol.
//!
//! The parser is a restartable state machine over a byte stream: feeding it
//! a request split at any byte boundary produces the same commands as feeding
//! the request whole. It consumes every byte it scans into internal
//! accumulators, so the caller can discard consumed input immediately.
//!
//! A command header is `<name> <args...>\r\n`. Once [`Parser::parse`] reports
//! completion, [`Parser::build`] yields the command and its declared body
//! length (0 for commands without a body), and [`Parser::reset`] prepares the
//! parser for the next header.

use crate::error::ParseError;
use crate::protocol::command::Command;

/// Maximum key length allowed by the memcached protocol.
pub const MAX_KEY_LENGTH: usize = 250;

/// Upper bound on a declared value size.
const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Longest recognized command name ("prepend" / "replace").
const MAX_NAME_LENGTH: usize = 16;

/// Parse phase within a single command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Scanning the command name.
    Name,
    /// Scanning whitespace-delimited positional arguments.
    Args,
    /// Saw `\r`, expecting `\n`.
    Terminator,
    /// A complete header has been recognized.
    Done,
}

/// Result of a single `parse` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// True iff a complete command header has been recognized.
    pub complete: bool,
    /// Bytes consumed from the front of the input.
    pub consumed: usize,
}

/// Restartable parser state.
#[derive(Debug)]
pub struct Parser {
    phase: Phase,
    name: String,
    args: Vec<String>,
    token: String,
}

impl Parser {
    pub fn new() -> Self {
        Self {
            phase: Phase::Name,
            name: String::new(),
            args: Vec::new(),
            token: String::new(),
        }
    }

    /// Name of the command recognized so far (for logging).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Examine up to `buf.len()` bytes, consuming from the front.
    ///
    /// Returns how many bytes were consumed and whether a complete header has
    /// been recognized. Bytes past the reported `consumed` count are never
    /// examined. A zero-consume, not-complete return means the caller must
    /// wait for more input.
    pub fn parse(&mut self, buf: &[u8]) -> Result<Progress, ParseError> {
        let mut consumed = 0;

        for &byte in buf {
            if self.phase == Phase::Done {
                break;
            }
            consumed += 1;

            match self.phase {
                Phase::Name => match byte {
                    b' ' => {
                        self.finish_name()?;
                        self.phase = Phase::Args;
                    }
                    b'\r' => {
                        self.finish_name()?;
                        self.phase = Phase::Terminator;
                    }
                    b'a'..=b'z' | b'A'..=b'Z' | b'_' => {
                        if self.name.len() >= MAX_NAME_LENGTH {
                            return Err(ParseError::UnknownCommand(self.name.clone()));
                        }
                        self.name.push(byte.to_ascii_lowercase() as char);
                    }
                    _ => {
                        return Err(ParseError::InvalidCommand(format!(
                            "unexpected byte 0x{byte:02x} in command name"
                        )));
                    }
                },

                Phase::Args => match byte {
                    b' ' => self.finish_token(),
                    b'\r' => {
                        self.finish_token();
                        self.phase = Phase::Terminator;
                    }
                    b'\n' => {
                        return Err(ParseError::InvalidCommand(
                            "bare LF in command line".to_string(),
                        ));
                    }
                    b'!'..=b'~' => {
                        if self.token.len() >= MAX_KEY_LENGTH {
                            return Err(ParseError::KeyTooLong(self.token.clone()));
                        }
                        self.token.push(byte as char);
                    }
                    _ => {
                        return Err(ParseError::InvalidCommand(format!(
                            "unexpected byte 0x{byte:02x} in argument"
                        )));
                    }
                },

                Phase::Terminator => {
                    if byte == b'\n' {
                        self.phase = Phase::Done;
                    } else {
                        return Err(ParseError::BareCarriageReturn);
                    }
                }

                Phase::Done => unreachable!(),
            }
        }

        Ok(Progress {
            complete: self.phase == Phase::Done,
            consumed,
        })
    }

    /// Build the recognized command; legal only after `parse` reported
    /// completion. Returns the command and its declared body length in
    /// bytes (0 for commands without a body).
    pub fn build(&self) -> Result<(Command, usize), ParseError> {
        debug_assert_eq!(self.phase, Phase::Done, "build before complete parse");

        match self.name.as_str() {
            "get" => {
                if self.args.is_empty() {
                    return Err(ParseError::InvalidCommand(
                        "get requires at least one key".to_string(),
                    ));
                }
                Ok((
                    Command::Get {
                        keys: self.args.clone(),
                    },
                    0,
                ))
            }

            "delete" => {
                let (key, noreply) = self.key_and_noreply("delete")?;
                Ok((Command::Delete { key, noreply }, 0))
            }

            "set" | "add" | "replace" | "append" | "prepend" => {
                let (key, flags, exptime, bytes, noreply) = self.storage_header()?;
                let command = match self.name.as_str() {
                    "set" => Command::Set {
                        key,
                        flags,
                        exptime,
                        bytes,
                        noreply,
                    },
                    "add" => Command::Add {
                        key,
                        flags,
                        exptime,
                        bytes,
                        noreply,
                    },
                    "replace" => Command::Replace {
                        key,
                        flags,
                        exptime,
                        bytes,
                        noreply,
                    },
                    "append" => Command::Append {
                        key,
                        flags,
                        exptime,
                        bytes,
                        noreply,
                    },
                    "prepend" => Command::Prepend {
                        key,
                        flags,
                        exptime,
                        bytes,
                        noreply,
                    },
                    _ => unreachable!(),
                };
                Ok((command, bytes))
            }

            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    /// Return the parser to its initial phase.
    pub fn reset(&mut self) {
        self.phase = Phase::Name;
        self.name.clear();
        self.args.clear();
        self.token.clear();
    }

    fn finish_name(&mut self) -> Result<(), ParseError> {
        match self.name.as_str() {
            "set" | "add" | "replace" | "append" | "prepend" | "get" | "delete" => Ok(()),
            "" => Err(ParseError::InvalidCommand("empty command".to_string())),
            other => Err(ParseError::UnknownCommand(other.to_string())),
        }
    }

    fn finish_token(&mut self) {
        if !self.token.is_empty() {
            self.args.push(std::mem::take(&mut self.token));
        }
    }

    fn key_and_noreply(&self, cmd: &str) -> Result<(String, bool), ParseError> {
        match self.args.len() {
            0 => Err(ParseError::InvalidCommand(format!("{cmd} requires a key"))),
            1 => Ok((self.args[0].clone(), false)),
            2 if self.args[1] == "noreply" => Ok((self.args[0].clone(), true)),
            _ => Err(ParseError::InvalidCommand(format!(
                "too many arguments for {cmd}"
            ))),
        }
    }

    /// `<key> <flags> <exptime> <bytes> [noreply]`
    fn storage_header(&self) -> Result<(String, u32, u32, usize, bool), ParseError> {
        if self.args.len() < 4 || self.args.len() > 5 {
            return Err(ParseError::InvalidCommand(format!(
                "{} requires key, flags, exptime and bytes",
                self.name
            )));
        }

        let key = self.args[0].clone();
        let flags = parse_number::<u32>(&self.args[1])?;
        let exptime = parse_number::<u32>(&self.args[2])?;
        let bytes = parse_number::<usize>(&self.args[3])?;
        if bytes > MAX_VALUE_SIZE {
            return Err(ParseError::InvalidCommand(format!(
                "value of {bytes} bytes exceeds the {MAX_VALUE_SIZE} byte limit"
            )));
        }

        let noreply = if self.args.len() == 5 {
            if self.args[4] != "noreply" {
                return Err(ParseError::InvalidCommand(format!(
                    "unexpected trailing argument '{}'",
                    self.args[4]
                )));
            }
            true
        } else {
            false
        };

        Ok((key, flags, exptime, bytes, noreply))
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_number<T: std::str::FromStr>(token: &str) -> Result<T, ParseError> {
    token
        .parse()
        .map_err(|_| ParseError::InvalidNumber(token.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut Parser, input: &[u8]) -> Progress {
        parser.parse(input).expect("parse failed")
    }

    #[test]
    fn test_parse_get() {
        let mut parser = Parser::new();
        let progress = parse_all(&mut parser, b"get foo\r\n");
        assert!(progress.complete);
        assert_eq!(progress.consumed, 9);

        let (command, body) = parser.build().unwrap();
        assert_eq!(
            command,
            Command::Get {
                keys: vec!["foo".to_string()]
            }
        );
        assert_eq!(body, 0);
    }

    #[test]
    fn test_parse_get_multi_key() {
        let mut parser = Parser::new();
        assert!(parse_all(&mut parser, b"get a b c\r\n").complete);
        let (command, _) = parser.build().unwrap();
        assert_eq!(
            command,
            Command::Get {
                keys: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn test_parse_set_header() {
        let mut parser = Parser::new();
        let progress = parse_all(&mut parser, b"set foo 7 60 3\r\n");
        assert!(progress.complete);

        let (command, body) = parser.build().unwrap();
        assert_eq!(body, 3);
        assert_eq!(
            command,
            Command::Set {
                key: "foo".to_string(),
                flags: 7,
                exptime: 60,
                bytes: 3,
                noreply: false,
            }
        );
    }

    #[test]
    fn test_parse_set_noreply() {
        let mut parser = Parser::new();
        assert!(parse_all(&mut parser, b"set foo 0 0 3 noreply\r\n").complete);
        let (command, _) = parser.build().unwrap();
        assert!(command.noreply());
    }

    #[test]
    fn test_parse_delete() {
        let mut parser = Parser::new();
        assert!(parse_all(&mut parser, b"delete foo\r\n").complete);
        let (command, body) = parser.build().unwrap();
        assert_eq!(
            command,
            Command::Delete {
                key: "foo".to_string(),
                noreply: false
            }
        );
        assert_eq!(body, 0);
    }

    #[test]
    fn test_byte_at_a_time_equals_whole() {
        let input = b"set foo 0 0 3\r\n";

        let mut whole = Parser::new();
        let progress = parse_all(&mut whole, input);
        assert!(progress.complete);
        let expected = whole.build().unwrap();

        let mut split = Parser::new();
        let mut complete = false;
        for &byte in input.iter() {
            let progress = split.parse(&[byte]).unwrap();
            assert_eq!(progress.consumed, 1);
            complete = progress.complete;
        }
        assert!(complete);
        assert_eq!(split.build().unwrap(), expected);
    }

    #[test]
    fn test_stops_consuming_after_header() {
        let mut parser = Parser::new();
        // Header plus three body bytes; the parser must not touch the body.
        let progress = parse_all(&mut parser, b"set foo 0 0 3\r\nbar");
        assert!(progress.complete);
        assert_eq!(progress.consumed, 15);
    }

    #[test]
    fn test_empty_input_makes_no_progress() {
        let mut parser = Parser::new();
        let progress = parse_all(&mut parser, b"");
        assert!(!progress.complete);
        assert_eq!(progress.consumed, 0);
    }

    #[test]
    fn test_unknown_command() {
        let mut parser = Parser::new();
        assert!(matches!(
            parser.parse(b"garbage\r\n"),
            Err(ParseError::UnknownCommand(name)) if name == "garbage"
        ));
    }

    #[test]
    fn test_bad_number_is_rejected_at_build() {
        let mut parser = Parser::new();
        assert!(parse_all(&mut parser, b"set foo 0 0 nope\r\n").complete);
        assert!(matches!(
            parser.build(),
            Err(ParseError::InvalidNumber(token)) if token == "nope"
        ));
    }

    #[test]
    fn test_oversized_value_rejected() {
        let mut parser = Parser::new();
        assert!(parse_all(&mut parser, b"set foo 0 0 999999999\r\n").complete);
        assert!(parser.build().is_err());
    }

    #[test]
    fn test_bare_cr_rejected() {
        let mut parser = Parser::new();
        assert_eq!(
            parser.parse(b"get foo\rX"),
            Err(ParseError::BareCarriageReturn)
        );
    }

    #[test]
    fn test_reset_clears_state() {
        let mut parser = Parser::new();
        assert!(parse_all(&mut parser, b"delete foo\r\n").complete);
        parser.reset();

        assert!(parse_all(&mut parser, b"get bar\r\n").complete);
        let (command, _) = parser.build().unwrap();
        assert_eq!(
            command,
            Command::Get {
                keys: vec!["bar".to_string()]
            }
        );
    }

    #[test]
    fn test_extra_spaces_between_args() {
        let mut parser = Parser::new();
        assert!(parse_all(&mut parser, b"set foo  0  0  3\r\n").complete);
        let (_, body) = parser.build().unwrap();
        assert_eq!(body, 3);
    }
}
