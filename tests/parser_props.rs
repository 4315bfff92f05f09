//! Property-based tests for the incremental parser and session.
//!
//! The central law: splitting a request stream at any byte boundary and
//! feeding the chunks successively produces the same responses as feeding
//! the stream whole.

use std::sync::Arc;

use proptest::prelude::*;

use embercache::net::session::Session;
use embercache::protocol::Parser;
use embercache::storage::MemStorage;

#[derive(Debug, Clone)]
enum Request {
    Set {
        key: String,
        value: Vec<u8>,
        noreply: bool,
    },
    Add {
        key: String,
        value: Vec<u8>,
    },
    Get {
        keys: Vec<String>,
    },
    Delete {
        key: String,
    },
}

impl Request {
    fn render(&self, out: &mut Vec<u8>) {
        match self {
            Request::Set {
                key,
                value,
                noreply,
            } => {
                let tail = if *noreply { " noreply" } else { "" };
                out.extend_from_slice(
                    format!("set {} 0 0 {}{}\r\n", key, value.len(), tail).as_bytes(),
                );
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
            Request::Add { key, value } => {
                out.extend_from_slice(format!("add {} 0 0 {}\r\n", key, value.len()).as_bytes());
                out.extend_from_slice(value);
                out.extend_from_slice(b"\r\n");
            }
            Request::Get { keys } => {
                out.extend_from_slice(b"get");
                for key in keys {
                    out.push(b' ');
                    out.extend_from_slice(key.as_bytes());
                }
                out.extend_from_slice(b"\r\n");
            }
            Request::Delete { key } => {
                out.extend_from_slice(format!("delete {key}\r\n").as_bytes());
            }
        }
    }
}

fn arb_key() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9:_-]{1,32}").unwrap()
}

/// Values are opaque bytes; deliberately includes CR and LF.
fn arb_value() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 1..200)
}

fn arb_request() -> impl Strategy<Value = Request> {
    prop_oneof![
        (arb_key(), arb_value(), any::<bool>()).prop_map(|(key, value, noreply)| Request::Set {
            key,
            value,
            noreply
        }),
        (arb_key(), arb_value()).prop_map(|(key, value)| Request::Add { key, value }),
        prop::collection::vec(arb_key(), 1..4).prop_map(|keys| Request::Get { keys }),
        arb_key().prop_map(|key| Request::Delete { key }),
    ]
}

/// Run a byte stream through a fresh session over a fresh store, returning
/// the concatenated response frames.
fn responses_for(stream: &[u8], chunk_sizes: &[usize]) -> Vec<u8> {
    let mut session = Session::new(Arc::new(MemStorage::new(64 * 1024 * 1024)));
    let mut output = Vec::new();
    let mut pending: Vec<u8> = Vec::new();
    let mut offset = 0;
    let mut chunks = chunk_sizes.iter().cycle();

    while offset < stream.len() || !pending.is_empty() {
        if offset < stream.len() {
            let take = (*chunks.next().unwrap()).min(stream.len() - offset);
            pending.extend_from_slice(&stream[offset..offset + take]);
            offset += take;
        }

        let feed = session.feed(&pending).expect("valid stream must parse");
        for frame in &feed.frames {
            output.extend_from_slice(frame);
        }
        pending.drain(..feed.consumed);

        if offset >= stream.len() && feed.consumed == 0 {
            // No more input and no progress: the stream ended mid-command.
            break;
        }
    }

    output
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Feed associativity: any chunking of the stream produces the same
    /// response sequence as feeding it whole.
    #[test]
    fn prop_chunking_is_transparent(
        requests in prop::collection::vec(arb_request(), 1..8),
        chunk_sizes in prop::collection::vec(1usize..24, 1..8),
    ) {
        let mut stream = Vec::new();
        for request in &requests {
            request.render(&mut stream);
        }

        let whole = responses_for(&stream, &[stream.len().max(1)]);
        let chunked = responses_for(&stream, &chunk_sizes);
        prop_assert_eq!(whole, chunked);
    }

    /// The parser never panics and never consumes past the input on
    /// arbitrary bytes; errors are reported, not looped on.
    #[test]
    fn prop_parser_is_total(input in prop::collection::vec(any::<u8>(), 0..256)) {
        let mut parser = Parser::new();
        match parser.parse(&input) {
            Ok(progress) => prop_assert!(progress.consumed <= input.len()),
            Err(_) => {}
        }
    }

    /// Progress: feeding the remainder after a partial feed always reaches
    /// the same completion state as feeding everything at once.
    #[test]
    fn prop_split_header_completes(split in 0usize..15) {
        let input: &[u8] = b"set key 1 2 3\r\n";
        let split = split.min(input.len());

        let mut parser = Parser::new();
        let first = parser.parse(&input[..split]).unwrap();
        prop_assert_eq!(first.consumed, split);
        prop_assert!(!first.complete || split == input.len());

        let second = parser.parse(&input[split..]).unwrap();
        prop_assert!(second.complete);
        prop_assert_eq!(first.consumed + second.consumed, input.len());

        let (_, body_len) = parser.build().unwrap();
        prop_assert_eq!(body_len, 3);
    }
}
