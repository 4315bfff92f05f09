//! Memcached commands and their execution against the storage capability.
//!
//! A [`Command`] is an immutable description of work built by the parser and
//! consumed by a single `execute` call. Execution is infallible from the
//! connection's perspective: storage failures are reported in-band as
//! `SERVER_ERROR <msg>`. Responses do not carry the trailing `\r\n`; the
//! connection layer appends it when framing.

use crate::storage::Storage;

/// Parsed memcached command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Store a value unconditionally.
    Set {
        key: String,
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },

    /// Store a value only if the key is absent.
    Add {
        key: String,
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },

    /// Store a value only if the key is present.
    Replace {
        key: String,
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },

    /// Append data to an existing value.
    Append {
        key: String,
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },

    /// Prepend data to an existing value.
    Prepend {
        key: String,
        flags: u32,
        exptime: u32,
        bytes: usize,
        noreply: bool,
    },

    /// Fetch one or more keys.
    Get { keys: Vec<String> },

    /// Delete a key.
    Delete { key: String, noreply: bool },
}

impl Command {
    /// Declared body length in bytes; 0 for commands without a body.
    pub fn body_len(&self) -> usize {
        match self {
            Command::Set { bytes, .. }
            | Command::Add { bytes, .. }
            | Command::Replace { bytes, .. }
            | Command::Append { bytes, .. }
            | Command::Prepend { bytes, .. } => *bytes,
            Command::Get { .. } | Command::Delete { .. } => 0,
        }
    }

    /// Whether the client asked for the response to be suppressed.
    pub fn noreply(&self) -> bool {
        match self {
            Command::Set { noreply, .. }
            | Command::Add { noreply, .. }
            | Command::Replace { noreply, .. }
            | Command::Append { noreply, .. }
            | Command::Prepend { noreply, .. }
            | Command::Delete { noreply, .. } => *noreply,
            Command::Get { .. } => false,
        }
    }

    /// Execute against `storage`, appending the response to `out`.
    ///
    /// `body` is the data block that followed the command header on the wire
    /// (empty for commands without a body). The response excludes the final
    /// `\r\n` terminator.
    pub fn execute(&self, storage: &dyn Storage, body: &[u8], out: &mut Vec<u8>) {
        match self {
            Command::Set { key, .. } => match storage.put(key, body) {
                Ok(true) => out.extend_from_slice(Response::STORED),
                Ok(false) => out.extend_from_slice(Response::NOT_STORED),
                Err(e) => Response::server_error(&e.to_string(), out),
            },

            Command::Add { key, .. } => match storage.put_if_absent(key, body) {
                Ok(true) => out.extend_from_slice(Response::STORED),
                Ok(false) => out.extend_from_slice(Response::NOT_STORED),
                Err(e) => Response::server_error(&e.to_string(), out),
            },

            Command::Replace { key, .. } => match storage.set(key, body) {
                Ok(true) => out.extend_from_slice(Response::STORED),
                Ok(false) => out.extend_from_slice(Response::NOT_STORED),
                Err(e) => Response::server_error(&e.to_string(), out),
            },

            Command::Append { key, .. } => Self::concat(storage, key, body, false, out),
            Command::Prepend { key, .. } => Self::concat(storage, key, body, true, out),

            Command::Get { keys } => {
                for key in keys {
                    match storage.get(key) {
                        Ok(Some(value)) => Response::value(key, 0, &value, out),
                        Ok(None) => {}
                        Err(e) => {
                            out.clear();
                            Response::server_error(&e.to_string(), out);
                            return;
                        }
                    }
                }
                out.extend_from_slice(Response::END);
            }

            Command::Delete { key, .. } => match storage.delete(key) {
                Ok(true) => out.extend_from_slice(Response::DELETED),
                Ok(false) => out.extend_from_slice(Response::NOT_FOUND),
                Err(e) => Response::server_error(&e.to_string(), out),
            },
        }
    }

    /// append/prepend are composed from get + set on the capability.
    fn concat(storage: &dyn Storage, key: &str, body: &[u8], front: bool, out: &mut Vec<u8>) {
        let existing = match storage.get(key) {
            Ok(Some(value)) => value,
            Ok(None) => {
                out.extend_from_slice(Response::NOT_STORED);
                return;
            }
            Err(e) => {
                Response::server_error(&e.to_string(), out);
                return;
            }
        };

        let mut combined = Vec::with_capacity(existing.len() + body.len());
        if front {
            combined.extend_from_slice(body);
            combined.extend_from_slice(&existing);
        } else {
            combined.extend_from_slice(&existing);
            combined.extend_from_slice(body);
        }

        match storage.set(key, &combined) {
            Ok(true) => out.extend_from_slice(Response::STORED),
            Ok(false) => out.extend_from_slice(Response::NOT_STORED),
            Err(e) => Response::server_error(&e.to_string(), out),
        }
    }
}

/// Response fragments for the text protocol.
///
/// None of these include the final `\r\n`; multi-line responses carry their
/// internal terminators only.
pub struct Response;

impl Response {
    pub const STORED: &'static [u8] = b"STORED";
    pub const NOT_STORED: &'static [u8] = b"NOT_STORED";
    pub const DELETED: &'static [u8] = b"DELETED";
    pub const NOT_FOUND: &'static [u8] = b"NOT_FOUND";
    pub const END: &'static [u8] = b"END";
    pub const ERROR: &'static [u8] = b"ERROR";

    /// `VALUE <key> <flags> <bytes>\r\n<data>\r\n`
    pub fn value(key: &str, flags: u32, data: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(format!("VALUE {} {} {}\r\n", key, flags, data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }

    pub fn server_error(msg: &str, out: &mut Vec<u8>) {
        out.extend_from_slice(format!("SERVER_ERROR {msg}").as_bytes());
    }
}
