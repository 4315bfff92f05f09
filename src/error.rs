//! Error types shared across the crate.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error for server construction and the reactor loops.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to read config file '{path}': {source}", path = .0.display(), source = .1)]
    ConfigRead(PathBuf, #[source] io::Error),

    #[error("failed to parse config file '{path}': {source}", path = .0.display(), source = .1)]
    ConfigParse(PathBuf, #[source] toml::de::Error),

    #[error("invalid listen address '{0}': expected host:port")]
    InvalidAddress(String),

    #[error("server already started")]
    AlreadyStarted,
}

/// Protocol errors raised by the parser.
///
/// "Need more input" is not an error: the parser reports it through its
/// return value so callers can tell a malformed stream from a short one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("invalid number '{0}'")]
    InvalidNumber(String),

    #[error("key too long: {0}")]
    KeyTooLong(String),

    #[error("bare CR in command line")]
    BareCarriageReturn,
}

/// Failures from the storage capability.
///
/// Commands report these in-band as `SERVER_ERROR <msg>`; the connection
/// stays alive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("storage lock poisoned")]
    LockPoisoned,
}
