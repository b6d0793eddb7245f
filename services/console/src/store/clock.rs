//! Write-order clock for document metadata.
//!
//! Stamps are wall-clock seconds with microsecond resolution. Within one
//! process the clock never repeats or goes backwards: when two writes land in
//! the same microsecond (or the wall clock steps back), the later write is
//! nudged one microsecond past the previous stamp.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Next strictly increasing timestamp, in seconds.
pub fn next_stamp() -> f64 {
    micros_to_seconds(next_micros())
}

fn wall_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_micros() as u64)
        .unwrap_or(0)
}

fn next_micros() -> u64 {
    let wall = wall_micros();
    let mut last = LAST_MICROS.load(Ordering::Acquire);
    loop {
        let next = wall.max(last + 1);
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

fn micros_to_seconds(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}
