//! Bounded per-process log buffer
//!
//! A single reader thread pushes lines; a single consumer pops them.
//! When the buffer is full the oldest unread line is evicted so the
//! reader never blocks on a slow consumer.

use crate::process::LineSink;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Statistics for a log buffer
#[derive(Debug, Default)]
pub struct LogStats {
    /// Lines pushed by the reader
    pub pushed: AtomicU64,

    /// Lines dropped to make room for newer ones
    pub evicted: AtomicU64,
}

impl LogStats {
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }
}

/// Consumer side of the buffer
pub struct LogBuffer {
    sender: Sender<String>,
    receiver: Receiver<String>,
    capacity: usize,
    stats: Arc<LogStats>,
}

impl LogBuffer {
    /// Create a buffer holding at most `capacity` unread lines
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);

        Self {
            sender,
            receiver,
            capacity,
            stats: Arc::new(LogStats::default()),
        }
    }

    /// Producer handle for the reader thread
    pub fn writer(&self) -> LogWriter {
        LogWriter {
            sender: self.sender.clone(),
            evictor: self.receiver.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    /// Pop the earliest unread line without blocking
    pub fn pop(&self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// Pop the earliest unread line, waiting up to `timeout`
    pub fn pop_timeout(&self, timeout: Duration) -> Option<String> {
        match self.receiver.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Remove and return every buffered line in order
    pub fn drain(&self) -> Vec<String> {
        self.receiver.try_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> Arc<LogStats> {
        Arc::clone(&self.stats)
    }
}

/// Producer side of the buffer
#[derive(Clone)]
pub struct LogWriter {
    sender: Sender<String>,
    evictor: Receiver<String>,
    stats: Arc<LogStats>,
}

impl LogWriter {
    /// Push a line, evicting the oldest one if the buffer is full
    pub fn push(&self, line: String) -> bool {
        let mut line = line;
        loop {
            match self.sender.try_send(line) {
                Ok(()) => {
                    self.stats.pushed.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(TrySendError::Full(rejected)) => {
                    if self.evictor.try_recv().is_ok() {
                        self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    }
                    line = rejected;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

impl LineSink for LogWriter {
    fn push_line(&self, line: String) -> bool {
        self.push(line)
    }
}
