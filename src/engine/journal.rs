use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use crossbeam_channel::{Receiver, Sender, unbounded};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warn,
    Error,
}

#[derive(Debug)]
struct Entry {
    severity: Severity,
    source: String,
    message: String,
}

/// Log buffer shared by all task bodies of a run.
///
/// Workers only push; the orchestrator drains the buffer on each tick of its
/// wait loop and re-emits the entries as `tracing` events, so messages from
/// many threads come out in one place and do not tear progress bars.
pub struct Journal {
    tx: Sender<Entry>,
    rx: Receiver<Entry>,
    once: Mutex<HashSet<String>>,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new()
    }
}

impl Journal {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            once: Mutex::new(HashSet::new()),
        }
    }

    pub fn push(&self, severity: Severity, source: &str, message: String) {
        // both ends live in `self`, the channel cannot be disconnected
        let _ = self.tx.send(Entry {
            severity,
            source: source.to_string(),
            message,
        });
    }

    /// `true` the first time `key` is seen during the lifetime of the
    /// journal.
    pub fn first_time(&self, key: &str) -> bool {
        self.once
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string())
    }

    /// Emits every buffered entry. Returns how many there were.
    pub fn flush(&self) -> usize {
        let mut count = 0;

        for entry in self.rx.try_iter() {
            let Entry {
                severity,
                source,
                message,
            } = entry;

            match severity {
                Severity::Info => info!(task = %source, "{message}"),
                Severity::Warn => warn!(task = %source, "{message}"),
                Severity::Error => error!(task = %source, "{message}"),
            }

            count += 1;
        }

        count
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_drains() {
        let journal = Journal::new();
        journal.push(Severity::Info, "a", "one".into());
        journal.push(Severity::Error, "b", "two".into());

        assert!(!journal.is_empty());
        assert_eq!(journal.flush(), 2);
        assert!(journal.is_empty());
        assert_eq!(journal.flush(), 0);
    }

    #[test]
    fn test_push_from_many_threads() {
        let journal = Journal::new();

        std::thread::scope(|scope| {
            for n in 0..4 {
                let journal = &journal;
                scope.spawn(move || {
                    for i in 0..10 {
                        journal.push(Severity::Warn, "worker", format!("{n}/{i}"));
                    }
                });
            }
        });

        assert_eq!(journal.flush(), 40);
    }

    #[test]
    fn test_first_time() {
        let journal = Journal::new();

        assert!(journal.first_time("x"));
        assert!(!journal.first_time("x"));
        assert!(journal.first_time("y"));
    }
}
