//! Bootstrap state machine
//!
//! The cluster is ready once every worker and the switch has logged its
//! server marker. Each distinct source counts once; repeated markers from
//! the same process are ignored.

use crate::config::LinePattern;
use crate::process::LogLine;
use crossbeam_channel::Sender;
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Bootstrap progress
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    /// Waiting for `pending` more servers
    Bootstrapping { pending: usize, seen: BTreeSet<String> },

    /// Every server is up
    Ready,
}

impl BootstrapState {
    /// Initial state for `workers` workers plus the switch
    pub fn new(workers: usize) -> Self {
        BootstrapState::Bootstrapping {
            pending: workers + 1,
            seen: BTreeSet::new(),
        }
    }

    /// Fold one log line into the state
    pub fn observe(self, line: &LogLine, marker: &LinePattern) -> Self {
        match self {
            BootstrapState::Ready => BootstrapState::Ready,
            BootstrapState::Bootstrapping { pending, mut seen } => {
                if !marker.is_match(&line.text) || !seen.insert(line.source.clone()) {
                    return BootstrapState::Bootstrapping { pending, seen };
                }
                match pending.saturating_sub(1) {
                    0 => BootstrapState::Ready,
                    pending => BootstrapState::Bootstrapping { pending, seen },
                }
            }
        }
    }

    /// Servers still expected
    pub fn pending(&self) -> usize {
        match self {
            BootstrapState::Bootstrapping { pending, .. } => *pending,
            BootstrapState::Ready => 0,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, BootstrapState::Ready)
    }
}

/// Progress notifications sent to whoever drives the bootstrap
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapEvent {
    /// `source` reported ready; `pending` servers remain
    ServerUp { source: String, pending: usize },

    /// All servers are up
    Ready,
}

/// Log processor installed on the master handler during bootstrap
pub struct BootstrapTracker {
    state: BootstrapState,
    marker: LinePattern,
    events: Sender<BootstrapEvent>,
}

impl BootstrapTracker {
    pub fn new(workers: usize, marker: LinePattern, events: Sender<BootstrapEvent>) -> Self {
        Self {
            state: BootstrapState::new(workers),
            marker,
            events,
        }
    }

    /// Process one line; returns true once the cluster is ready
    pub fn observe(&mut self, line: &LogLine) -> bool {
        let before = self.state.pending();
        let state = std::mem::replace(&mut self.state, BootstrapState::Ready);
        self.state = state.observe(line, &self.marker);

        let pending = self.state.pending();
        if pending < before {
            info!(source = %line.source, pending = pending, "Server up");
            let _ = self.events.send(BootstrapEvent::ServerUp {
                source: line.source.clone(),
                pending,
            });
        }

        if self.state.is_ready() {
            debug!("Bootstrap complete");
            let _ = self.events.send(BootstrapEvent::Ready);
            return true;
        }
        false
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }
}
