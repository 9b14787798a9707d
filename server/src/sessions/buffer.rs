//! In-memory output ring buffer with `tokio::sync::Notify`-based wakeup.
//!
//! Backs the replay/catch-up semantics required of WebSocket and SSE
//! attachments (§4.8, §4.9, testable property 2): a subscriber that attaches
//! after some output has already been produced can still observe every byte
//! from its attachment point onward, up to the buffer's retention bound.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;

/// A single sequenced output entry (already passed through activity
/// detection and title injection where applicable).
#[derive(Debug, Clone)]
pub struct OutputEntry {
    /// Monotonically increasing sequence number, unique within a session.
    pub seq: u64,
    pub data: Vec<u8>,
    pub timestamp_ms: u64,
}

/// Ring buffer of [`OutputEntry`] items with subscriber notification.
pub struct OutputBuffer {
    entries: VecDeque<OutputEntry>,
    next_seq: u64,
    max_entries: usize,
    notify: Arc<Notify>,
}

impl OutputBuffer {
    /// Create a new buffer that holds at most `max_entries` items.
    pub fn new(max_entries: usize) -> Self {
        OutputBuffer {
            entries: VecDeque::with_capacity(max_entries.min(256)),
            next_seq: 1,
            max_entries,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Push a new entry, evicting the oldest if full, and wake all waiters.
    pub fn push(&mut self, data: Vec<u8>) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;

        #[allow(clippy::cast_possible_truncation)]
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64);

        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
        }
        self.entries.push_back(OutputEntry {
            seq,
            data,
            timestamp_ms,
        });
        self.notify.notify_waiters();
        seq
    }

    /// Read all entries with `seq > since`.
    ///
    /// Returns `(entries, dropped_count)` where `dropped_count > 0` if
    /// entries between `since` and the oldest available entry were evicted —
    /// the caller surfaces this as a discontinuity marker (§5 backpressure).
    pub fn read_since(&self, since: u64) -> (Vec<OutputEntry>, u64) {
        let oldest_available = self.entries.front().map_or(self.next_seq, |e| e.seq);
        let dropped = if oldest_available > since.saturating_add(1) {
            oldest_available - since - 1
        } else {
            0
        };
        let entries: Vec<OutputEntry> = self
            .entries
            .iter()
            .filter(|e| e.seq > since)
            .cloned()
            .collect();
        (entries, dropped)
    }

    /// Get a clone of the `Arc<Notify>` for external waiting.
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Current next sequence number (i.e. count of entries ever pushed, + 1).
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_since_reports_dropped_count_on_eviction() {
        let mut buf = OutputBuffer::new(2);
        buf.push(b"a".to_vec());
        buf.push(b"b".to_vec());
        buf.push(b"c".to_vec()); // evicts "a"
        let (entries, dropped) = buf.read_since(0);
        assert_eq!(dropped, 1);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn read_since_no_drop_when_within_window() {
        let mut buf = OutputBuffer::new(8);
        buf.push(b"a".to_vec());
        let seq = buf.push(b"b".to_vec());
        let (entries, dropped) = buf.read_since(seq - 1);
        assert_eq!(dropped, 0);
        assert_eq!(entries.len(), 1);
    }
}
