//! Stats and log introspection, gated by an authorized key set.
//!
//! `get_stats` and `get_logs` only answer callers whose authenticated bus
//! identity appears in the configured access list; everyone else gets a
//! bodyless 403. The log ring buffer is fed by a `tracing` writer the
//! daemon installs at startup.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Default number of log lines retained for `get_logs`.
pub const LOG_BUFFER_LINES: usize = 500;

/// In-memory ring of recent formatted log lines.
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append one line, evicting the oldest beyond capacity.
    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// Snapshot the buffered lines, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(LOG_BUFFER_LINES)
    }
}

/// The set of peer identities allowed to read stats and logs.
pub struct AccessKeys {
    keys: HashSet<[u8; 32]>,
}

impl AccessKeys {
    pub fn new(keys: impl IntoIterator<Item = [u8; 32]>) -> Self {
        Self {
            keys: keys.into_iter().collect(),
        }
    }

    /// Whether the (authenticated) caller may read introspection data.
    /// An unauthenticated caller never may.
    pub fn allows(&self, caller: Option<&[u8; 32]>) -> bool {
        caller.is_some_and(|k| self.keys.contains(k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_buffer_eviction() {
        let buf = LogBuffer::new(3);
        for i in 0..5 {
            buf.push(format!("line {i}"));
        }
        assert_eq!(buf.snapshot(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_access_gate() {
        let keys = AccessKeys::new([[1u8; 32]]);
        assert!(keys.allows(Some(&[1u8; 32])));
        assert!(!keys.allows(Some(&[2u8; 32])));
        assert!(!keys.allows(None));
    }

    #[test]
    fn test_empty_access_list_denies_all() {
        let keys = AccessKeys::new([]);
        assert!(!keys.allows(Some(&[0u8; 32])));
    }
}
