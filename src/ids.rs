//! Human-readable, time-based identifiers
//!
//! Chain and report ids embed a millisecond timestamp and a random suffix
//! (`CHAIN-<base36>-<suffix>`, `MERGE-<ms>-<suffix>`, ...). Timestamps are
//! strictly increasing within a process; the suffix keeps two processes
//! sharing one database file apart.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;
use uuid::Uuid;

/// Monotonic id source shared by all services of one process
#[derive(Debug, Default)]
pub struct IdGenerator {
    last_millis: AtomicI64,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current time in milliseconds, bumped past the previous value if needed
    pub fn next_millis(&self) -> i64 {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_millis.load(Ordering::Relaxed);
        loop {
            let next = if now > last { now } else { last + 1 };
            match self.last_millis.compare_exchange_weak(
                last,
                next,
                Ordering::SeqCst,
                Ordering::Relaxed,
            ) {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    pub fn chain_id(&self) -> String {
        format!("CHAIN-{}-{}", to_base36(self.next_millis()), random_suffix())
    }

    pub fn split_id(&self) -> String {
        format!("SPLIT-{}-{}", self.next_millis(), random_suffix())
    }

    /// Merged chain id and its batch number share one timestamp and suffix
    pub fn merge_ids(&self) -> (String, String) {
        let stamp = format!("{}-{}", self.next_millis(), random_suffix());
        (format!("MERGE-{}", stamp), format!("MERGED-{}", stamp))
    }

    pub fn transform_id(&self) -> String {
        format!("TRANS-{}-{}", self.next_millis(), random_suffix())
    }

    pub fn report_id(&self) -> String {
        format!("LIN-{}-{}", to_base36(self.next_millis()), random_suffix())
    }
}

/// Event ids are opaque
pub fn event_id() -> String {
    Uuid::new_v4().to_string()
}

fn random_suffix() -> String {
    let simple = Uuid::new_v4().simple().to_string();
    simple[..8].to_uppercase()
}

/// Upper-case base36 rendering of a non-negative integer
pub fn to_base36(mut value: i64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    if value <= 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}
