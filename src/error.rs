//! Error types for cumulus-slicer
//!
//! This module defines the error hierarchy for cluster orchestration:
//! - Process spawn errors (a node's process could not be started)
//! - Configuration errors (node/map inconsistencies, bad patterns)
//! - Control-protocol (RPC) errors
//! - Readiness timeouts and per-host poll failures
//!
//! Spawn and configuration errors abort a bootstrap; poll failures are
//! local to a single monitor cycle.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for cumulus-slicer
#[derive(Error, Debug)]
pub enum SlicerError {
    /// A process could not be started
    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    /// Configuration errors, detected before any process is spawned
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Control-protocol errors
    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    /// A node never logged its readiness marker within the configured bound
    #[error("'{host}' did not report ready within {}s", .waited.as_secs_f64())]
    ReadinessTimeout {
        host: String,
        waited: Duration,
        /// Log context collected from the node while waiting
        log: String,
    },

    /// A node's process exited before it reported ready
    #[error("Process for '{host}' exited before reporting ready")]
    NodeExited { host: String, log: String },

    /// Monitor poll failure
    #[error("Poll failure: {0}")]
    Poll(#[from] PollFailure),

    /// A helper thread panicked
    #[error("Thread '{name}' panicked")]
    Panicked { name: String },

    /// I/O errors (files, sockets)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel closed unexpectedly
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

impl SlicerError {
    /// Log text collected from the failing node, if this error carries any
    pub fn log_context(&self) -> Option<&str> {
        match self {
            SlicerError::ReadinessTimeout { log, .. } | SlicerError::NodeExited { log, .. } => {
                Some(log.as_str()).filter(|l| !l.is_empty())
            }
            _ => None,
        }
    }
}

/// Process spawn errors
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The OS refused to start the command (not found, permission denied, ...)
    #[error("Failed to spawn '{command}': {reason}")]
    Failed { command: String, reason: String },

    /// The child started but its output could not be captured
    #[error("No output pipe for '{command}'")]
    NoOutput { command: String },

    /// The output reader thread could not be started
    #[error("Failed to start reader for '{command}': {reason}")]
    Reader { command: String, reason: String },
}

impl SpawnError {
    /// The command string that failed to start
    pub fn command(&self) -> &str {
        match self {
            SpawnError::Failed { command, .. }
            | SpawnError::NoOutput { command }
            | SpawnError::Reader { command, .. } => command,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Cluster configuration could not be read
    #[error("Cannot load '{path}': {reason}")]
    Load { path: PathBuf, reason: String },

    /// A node is referenced that the cluster configuration does not define
    #[error("Unknown node '{node}' referenced by {context}")]
    UnknownNode { node: String, context: String },

    /// A map is referenced that the catalog does not define
    #[error("Unknown map '{map}'")]
    UnknownMap { map: String },

    /// Two nodes share a name
    #[error("Duplicate node name '{name}'")]
    DuplicateNode { name: String },

    /// At least one target node is required
    #[error("No nodes configured")]
    NoNodes,

    /// Address could not be parsed
    #[error("Invalid address '{value}': {reason}")]
    InvalidAddress { value: String, reason: String },

    /// Regex pattern failed to compile
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    /// Partition directive could not be parsed or applied
    #[error("Invalid partition directive '{value}': {reason}")]
    InvalidDirective { value: String, reason: String },

    /// Explicit ranges do not cover the key domain exactly once
    #[error("Invalid partition for map '{map}': {reason}")]
    InvalidPartition { map: String, reason: String },

    /// Key domain too small to split
    #[error("Domain of map '{map}' has {size} keys, cannot split across {nodes} nodes")]
    InvalidDomain { map: String, size: u64, nodes: usize },

    /// Interval or timeout must be positive
    #[error("Invalid {name}: must be greater than zero")]
    InvalidInterval { name: &'static str },

    /// Client start requested without a source file
    #[error("To run the client, the configuration must have a client source file")]
    MissingClientSource,

    /// A template or update spans several lines and cannot be written
    #[error("{kind} {index} contains a line break")]
    MultiLineEntry { kind: &'static str, index: usize },

    /// Deployment descriptor could not be parsed
    #[error("Malformed descriptor line {line}: {reason}")]
    MalformedDescriptor { line: usize, reason: String },
}

/// Control-protocol errors
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// Could not connect to the control port
    #[error("Failed to connect to '{addr}': {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// Transport failed mid-request
    #[error("I/O error talking to '{addr}': {reason}")]
    Transport { addr: String, reason: String },

    /// Peer closed the connection
    #[error("Connection to '{addr}' closed")]
    Disconnected { addr: String },

    /// Request or response could not be encoded/decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The remote side reported a failure
    #[error("Remote error: {0}")]
    Remote(String),
}

/// A monitor cycle in which a host did not produce stats
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollFailure {
    /// No answer within the per-host poll timeout
    #[error("no response from '{host}' within {}s", .waited.as_secs_f64())]
    NoResponse { host: String, waited: Duration },

    /// The previous request to this host is still outstanding
    #[error("'{host}' is still answering cycle {cycle}")]
    Stalled { host: String, cycle: u64 },

    /// The request failed
    #[error("poll of '{host}' failed: {reason}")]
    Failed { host: String, reason: String },
}

impl PollFailure {
    /// Host that failed
    pub fn host(&self) -> &str {
        match self {
            PollFailure::NoResponse { host, .. }
            | PollFailure::Stalled { host, .. }
            | PollFailure::Failed { host, .. } => host,
        }
    }
}

/// Result type alias for SlicerError
pub type Result<T> = std::result::Result<T, SlicerError>;

/// Result type alias for ConfigError
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for RpcError
pub type RpcResult<T> = std::result::Result<T, RpcError>;
