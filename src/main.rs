//! embercache: a memcached-compatible cache server.
//!
//! Wire protocol: memcached text commands (set, add, replace, append,
//! prepend, get, delete) over TCP. Three interchangeable event-loop
//! backends: single-threaded non-blocking, multi-threaded non-blocking,
//! and single-threaded cooperative.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::EnvFilter;

use embercache::config::Config;
use embercache::net;
use embercache::storage::MemStorage;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backend = ?config.backend,
        workers = config.workers,
        max_memory_mb = config.max_memory / 1024 / 1024,
        "starting embercache"
    );

    let storage = Arc::new(MemStorage::new(config.max_memory));
    let mut server = net::build(&config, storage);

    server.start()?;
    server.join();

    Ok(())
}
