//! Event-driven in-memory key-value server: string values, sorted sets
//! ordered by (score, name), per-key TTL expiration, idle-connection
//! management. One thread runs the event loop; a small worker pool tears
//! down large detached containers.

use std::sync::OnceLock;
use std::time::Instant;

pub mod buf;
pub mod commands;
pub mod db;
pub mod heap;
pub mod list;
pub mod map;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod zset;

pub const BACKLOG: i32 = 128;
pub const K_MAX_MSG: usize = 32 << 20;
pub const K_MAX_ARGS: usize = 200_000;
/// Maximum load factor for the chaining hash table. A value > 1 is valid
/// because multiple items can occupy one bucket.
pub const K_MAX_LOAD_FACTOR: usize = 8;
pub const K_REHASHING_WORK: usize = 128;
pub const K_IDLE_TIMEOUT_MS: u64 = 5000;
pub const K_MAX_WORKS: usize = 2000;
pub const K_LARGE_CONTAINER_SIZE: usize = 1000;

/// Monotonic clock in milliseconds, measured from process start.
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let start = START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}
