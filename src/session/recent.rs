// src/session/recent.rs
//
// Bounded window of the most recently captured lines.
// Written by the reader thread, polled and drained by the validator.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// Default number of lines kept in the window.
pub const DEFAULT_RECENT_CAPACITY: usize = 100;

/// Order-preserving ring of recent lines.
///
/// `drain` is atomic with respect to `push`: a line pushed concurrently with a
/// drain lands either in the drained batch or in the window afterwards, never
/// both and never neither.
pub struct RecentLines {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for RecentLines {
    fn default() -> Self {
        RecentLines::new(DEFAULT_RECENT_CAPACITY)
    }
}

impl RecentLines {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RecentLines {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<String>> {
        // A panicking writer cannot leave the deque half-updated
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append a line, evicting the oldest when full.
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.guard();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// Copy of the current window, oldest first.
    pub fn snapshot(&self) -> Vec<String> {
        self.guard().iter().cloned().collect()
    }

    /// Take every line in the window and leave it empty.
    pub fn drain(&self) -> Vec<String> {
        self.guard().drain(..).collect()
    }

    /// First line matching `pred`; on a match the window is cleared in the
    /// same critical section.
    pub fn take_match(&self, pred: impl Fn(&str) -> bool) -> Option<String> {
        let mut lines = self.guard();
        let found = lines.iter().find(|l| pred(l)).cloned();
        if found.is_some() {
            lines.clear();
        }
        found
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_evicts_oldest() {
        let recent = RecentLines::new(3);
        for i in 0..5 {
            recent.push(format!("line {}", i));
        }
        assert_eq!(recent.snapshot(), vec!["line 2", "line 3", "line 4"]);
        assert_eq!(recent.capacity(), 3);
    }

    #[test]
    fn test_drain_clears() {
        let recent = RecentLines::default();
        recent.push("a");
        recent.push("b");
        assert_eq!(recent.drain(), vec!["a", "b"]);
        assert!(recent.is_empty());
        assert!(recent.drain().is_empty());
    }

    #[test]
    fn test_take_match_clears_only_on_match() {
        let recent = RecentLines::default();
        recent.push("*GET#APN#");
        recent.push("APN: internet");
        assert_eq!(recent.take_match(|l| l.contains("SERVER")), None);
        assert_eq!(recent.len(), 2);
        assert_eq!(
            recent.take_match(|l| l.starts_with("APN")).as_deref(),
            Some("APN: internet")
        );
        assert!(recent.is_empty());
    }

    #[test]
    fn test_concurrent_push_and_drain_lose_nothing() {
        let recent = Arc::new(RecentLines::new(100_000));
        let writer = {
            let recent = recent.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    recent.push(i.to_string());
                }
            })
        };

        let mut seen = Vec::new();
        while !writer.is_finished() {
            seen.extend(recent.drain());
        }
        writer.join().unwrap();
        seen.extend(recent.drain());

        let expected: Vec<String> = (0..10_000).map(|i| i.to_string()).collect();
        assert_eq!(seen, expected);
    }
}
