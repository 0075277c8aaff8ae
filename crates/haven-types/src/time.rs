//! Clock helpers.
//!
//! Wall-clock time (unix milliseconds) drives message admission and expiry;
//! steady time ([`std::time::Instant`]) drives subscription lifetimes. The
//! two must never be mixed: wall time can jump, steady time cannot.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time in unix seconds.
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_monotonic_enough() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
        // Sanity: we are later than 2023 and earlier than 2100.
        assert!(a > 1_600_000_000_000);
        assert!(a < 4_100_000_000_000);
    }

    #[test]
    fn test_secs_derived_from_ms() {
        let s = now_secs();
        let ms = now_ms();
        assert!(ms / 1000 >= s);
        assert!(ms / 1000 - s <= 1);
    }
}
