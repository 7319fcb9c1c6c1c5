//! Child process supervision
//!
//! Every cluster process is a child with its stdout piped into a reader
//! thread. The reader hands each line to a [`LineSink`]: either a bounded
//! [`LogBuffer`] (node managers) or a node handler's inbox.

pub mod log_buffer;
pub mod supervisor;

pub use log_buffer::{LogBuffer, LogStats, LogWriter};
pub use supervisor::{Launch, ProcessSupervisor};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Destination for lines read from a child process
pub trait LineSink: Send + 'static {
    /// Accept one line. Returns false once the sink is closed.
    fn push_line(&self, line: String) -> bool;
}

/// A line of output from a cluster process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLine {
    /// Producing process, `<host>/<process tag>`
    pub source: String,

    /// Line text without the trailing newline
    pub text: String,
}

impl LogLine {
    pub fn new(source: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.source, self.text)
    }
}
