//! Process-unique, time-ordered 64-bit id generation.
//!
//! Layout: millisecond timestamp in the high bits, a 22-bit sequence in the
//! low bits. A CAS loop over a single atomic guarantees strictly increasing
//! ids across threads for one process lifetime, which is all connection
//! ids, request ids, and generated subdomains need.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const SEQUENCE_BITS: u32 = 22;

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Next process-unique id, strictly greater than every id issued before it.
pub fn next_id() -> i64 {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    let base = now_ms << SEQUENCE_BITS;

    loop {
        let last = LAST_ID.load(Ordering::Relaxed);
        let next = if base > last { base } else { last + 1 };
        if LAST_ID
            .compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            return next;
        }
    }
}

/// Next id rendered as a decimal string.
pub fn next_string_id() -> String {
    next_id().to_string()
}
