//! Bounded per-agent log capture with amortized trimming.

use std::collections::VecDeque;

use super::types::LogEntry;

/// Keeps the `cap` most recent entries.
///
/// Trimming runs once every `trim_interval` appends instead of on every push,
/// so the buffer may briefly hold up to `cap + trim_interval` entries.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    cap: usize,
    trim_interval: usize,
    since_trim: usize,
    dropped: u64,
}

impl LogBuffer {
    pub fn new(cap: usize, trim_interval: usize) -> Self {
        let cap = cap.max(1);
        let trim_interval = trim_interval.max(1);
        Self {
            entries: VecDeque::with_capacity(cap + trim_interval),
            cap,
            trim_interval,
            since_trim: 0,
            dropped: 0,
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push_back(entry);
        self.since_trim += 1;
        if self.since_trim >= self.trim_interval {
            self.trim();
        }
    }

    /// Drop everything older than the `cap` most recent entries.
    pub fn trim(&mut self) {
        self.since_trim = 0;
        let excess = self.entries.len().saturating_sub(self.cap);
        if excess > 0 {
            self.entries.drain(..excess);
            self.dropped += excess as u64;
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upper bound on `len()` at any point in time.
    pub fn max_len(&self) -> usize {
        self.cap + self.trim_interval
    }

    /// Total entries discarded by trimming.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Clone of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::LogKind;

    fn entry(i: usize) -> LogEntry {
        LogEntry::new(LogKind::Text, format!("line {i}"))
    }

    #[test]
    fn never_exceeds_cap_plus_slack() {
        let mut buf = LogBuffer::new(10, 4);
        for i in 0..1_000 {
            buf.push(entry(i));
            assert!(buf.len() <= buf.max_len(), "len {} at push {i}", buf.len());
        }
    }

    #[test]
    fn keeps_most_recent_entries() {
        let mut buf = LogBuffer::new(3, 2);
        for i in 0..8 {
            buf.push(entry(i));
        }
        buf.trim();
        let payloads: Vec<_> = buf.iter().map(|e| e.payload.as_str()).collect();
        assert_eq!(payloads, vec!["line 5", "line 6", "line 7"]);
        assert_eq!(buf.dropped(), 5);
    }

    #[test]
    fn trim_is_amortized_not_per_append() {
        let mut buf = LogBuffer::new(2, 5);
        for i in 0..4 {
            buf.push(entry(i));
        }
        // Four appends, no trim yet: buffer is allowed over cap.
        assert_eq!(buf.len(), 4);
        buf.push(entry(4));
        assert_eq!(buf.len(), 2);
    }
}
