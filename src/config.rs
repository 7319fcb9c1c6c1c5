//! Configuration types for cumulus-slicer
//!
//! This module defines:
//! - CLI argument parsing using clap derive macros
//! - The cluster configuration file (JSON) with validation
//! - Line patterns used for readiness markers and process filtering
//! - Command templates for the processes a node launches

use crate::error::{ConfigError, ConfigResult};
use crate::node::{Node, NodeAddress, NodeRole};
use crate::planner::DEFAULT_KEY_DOMAIN;
use clap::{Parser, Subcommand};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default control port every slicer listens on
pub const DEFAULT_CONTROL_PORT: u16 = 52980;

/// Line a slicer prints once its control server accepts connections
pub const SLICER_READY_SENTINEL: &str = "====> Server Ready <====";

/// Line a worker or switch prints once its service is up
pub const SERVER_READY_SENTINEL: &str = "Starting Cumulus Server";

/// Default pattern for worker processes in `ps aux` output
pub const DEFAULT_PROCESS_PATTERN: &str = r"(org\.dbtoaster\.cumulus.*Node)";

/// Cluster bootstrap and partition planning for distributed view maintenance
#[derive(Parser, Debug, Clone)]
#[command(
    name = "cumulus-slicer",
    version,
    about = "Cluster bootstrap and partition planning for distributed view maintenance",
    long_about = "Launches and supervises the worker and switch processes of a cumulus cluster.\n\n\
                  The primary coordinator spins up a slicer on every remote host, starts the\n\
                  workers and the switch, waits for all of them to report ready, then polls\n\
                  the cluster for process statistics.",
    after_help = "EXAMPLES:\n    \
        cumulus-slicer plan catalog.json -n n1=w1:7000 -n n2=w2:7000 -p q:0 -o deploy.txt\n    \
        cumulus-slicer bootstrap cluster.json\n    \
        cumulus-slicer serve cluster.json\n    \
        cumulus-slicer status cluster.json"
)]
pub struct CliArgs {
    /// Subcommand to run
    #[command(subcommand)]
    pub command: Command,

    /// Quiet mode - suppress progress output
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Compute a partition plan and write the deployment descriptor
    Plan {
        /// Map catalog produced by the compiler (JSON)
        #[arg(value_name = "CATALOG")]
        catalog: PathBuf,

        /// Output file (stdout if not set)
        #[arg(short = 'o', long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Take the node list from a cluster configuration file
        #[arg(short = 'c', long, value_name = "FILE")]
        cluster: Option<PathBuf>,

        /// Node definition (can be repeated)
        #[arg(
            short = 'n',
            long = "node",
            value_name = "NAME=HOST:PORT",
            action = clap::ArgAction::Append
        )]
        nodes: Vec<String>,

        /// Partition directive: MAP:KEY or MAP:KEY=NODE@LO::HI,... (can be repeated)
        #[arg(
            short = 'p',
            long = "partition",
            value_name = "DIRECTIVE",
            action = clap::ArgAction::Append
        )]
        partitions: Vec<String>,

        /// Key domain size for one map (can be repeated)
        #[arg(
            short = 'd',
            long = "domain",
            value_name = "MAP=SIZE",
            action = clap::ArgAction::Append
        )]
        domains: Vec<String>,

        /// Key domain size for maps without a --domain override
        #[arg(long, default_value_t = DEFAULT_KEY_DOMAIN, value_name = "SIZE")]
        default_domain: u64,

        /// File with one test update operation per line
        #[arg(short = 't', long = "test", value_name = "FILE")]
        test: Option<PathBuf>,

        /// Ask workers to persist state after the test sequence
        #[arg(short = 's', long)]
        persist: bool,

        /// Ignore partition keys (replicate every map on every node)
        #[arg(short = 'k', long)]
        ignore_keys: bool,
    },

    /// Act as primary coordinator and bring up the whole cluster
    Bootstrap {
        /// Cluster configuration file (JSON)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Override the readiness timeout (seconds)
        #[arg(long, value_name = "SECS")]
        ready_timeout: Option<u64>,
    },

    /// Serve the control protocol for this host (run by the coordinator on remote hosts)
    Serve {
        /// Cluster configuration file (JSON)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,

        /// Override the control port
        #[arg(long, value_name = "PORT")]
        port: Option<u16>,
    },

    /// Poll every cluster host once and print process statistics
    Status {
        /// Cluster configuration file (JSON)
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

/// A compiled regex matched against single log lines
#[derive(Clone)]
pub struct LinePattern {
    regex: Regex,
}

impl LinePattern {
    /// Compile a pattern
    pub fn new(pattern: &str) -> ConfigResult<Self> {
        Regex::new(pattern)
            .map(|regex| Self { regex })
            .map_err(|e| ConfigError::InvalidPattern {
                pattern: pattern.to_string(),
                reason: e.to_string(),
            })
    }

    /// Pattern matching `text` literally
    pub fn literal(text: &str) -> ConfigResult<Self> {
        Self::new(&regex::escape(text))
    }

    /// Check whether a line matches
    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }

    /// Extract the interesting part of a matching line
    ///
    /// Returns the first capture group when the pattern has one,
    /// otherwise the whole match.
    pub fn extract<'a>(&self, line: &'a str) -> Option<&'a str> {
        let caps = self.regex.captures(line)?;
        caps.get(1).or_else(|| caps.get(0)).map(|m| m.as_str())
    }

    /// Source pattern
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

impl fmt::Debug for LinePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LinePattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for LinePattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for LinePattern {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LinePattern {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pattern = String::deserialize(deserializer)?;
        Self::new(&pattern).map_err(serde::de::Error::custom)
    }
}

/// How a node's slicer process is started
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Over ssh on the remote host
    #[default]
    Ssh,

    /// As a local child process (single-machine clusters and tests)
    Local,
}

/// Output level passed to launched processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    /// Command-line flag for launched scripts
    pub fn flag(&self) -> &'static str {
        match self {
            Verbosity::Quiet => "-q",
            Verbosity::Normal => "",
            Verbosity::Verbose => "-v",
        }
    }
}

/// Command templates
///
/// Placeholders: `{path}` installation path, `{config}` configuration
/// file, `{verbosity}` verbosity flag, `{port}` node port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    /// Slicer started on each remote host by the coordinator
    pub slicer: String,

    /// Worker process
    pub node: String,

    /// Switch process
    pub switch: String,

    /// Client launcher (options are appended)
    pub client: String,
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            slicer: "cd {path}; ./bin/slicer.sh --serve {config}".into(),
            node: "{path}/bin/node.sh -p {port} {verbosity} {config}".into(),
            switch: "{path}/bin/chef.sh {verbosity} {config}".into(),
            client: "{path}/bin/client.sh -q -s".into(),
        }
    }
}

/// Settings for the debugging client fed from a source file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Source file replayed into the cluster
    pub source_file: Option<String>,

    /// Tuples per second
    pub rate_limit: Option<u32>,

    /// Transform expressions (`-t`)
    pub transforms: Vec<String>,

    /// Projections (`-u`)
    pub projections: Vec<String>,

    /// Upfront tables (`--upfront`)
    pub upfront: Vec<String>,

    /// Start the client once every server is up
    pub autostart: bool,
}

/// Cluster configuration, loaded once and shared read-only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Worker nodes
    pub nodes: Vec<Node>,

    /// Switch/rendezvous address
    pub switch: NodeAddress,

    /// Name of the machine this process runs on
    #[serde(default = "default_local_host")]
    pub local_host: String,

    /// Installation directory on every host
    #[serde(default = "default_install_path")]
    pub install_path: String,

    /// Configuration file path handed to launched processes
    #[serde(default)]
    pub config_file: Option<PathBuf>,

    /// Port every slicer's control server listens on
    #[serde(default = "default_control_port")]
    pub control_port: u16,

    /// How slicers are launched on remote hosts
    #[serde(default)]
    pub launch: LaunchMode,

    /// Verbosity of launched processes
    #[serde(default)]
    pub verbosity: Verbosity,

    /// Command templates
    #[serde(default)]
    pub commands: CommandTemplates,

    /// Line a slicer prints when its control server is up
    #[serde(default = "default_slicer_marker")]
    pub slicer_marker: LinePattern,

    /// Line a worker or switch prints when it is ready
    #[serde(default = "default_server_marker")]
    pub server_marker: LinePattern,

    /// Worker process pattern for stats filtering
    #[serde(default = "default_process_pattern")]
    pub process_pattern: LinePattern,

    /// Bound on waiting for a node to become ready (seconds)
    #[serde(default = "default_readiness_timeout")]
    pub readiness_timeout_secs: u64,

    /// Monitor polling interval (seconds)
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Per-host answer bound within one monitor cycle (seconds)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Lines kept per process before the oldest are evicted
    #[serde(default = "default_log_buffer_lines")]
    pub log_buffer_lines: usize,

    /// Debugging client
    #[serde(default)]
    pub client: ClientConfig,
}

fn default_local_host() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn default_install_path() -> String {
    ".".to_string()
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_slicer_marker() -> LinePattern {
    LinePattern::literal(SLICER_READY_SENTINEL).expect("escaped sentinel is a valid regex")
}

fn default_server_marker() -> LinePattern {
    LinePattern::literal(SERVER_READY_SENTINEL).expect("escaped sentinel is a valid regex")
}

fn default_process_pattern() -> LinePattern {
    LinePattern::new(DEFAULT_PROCESS_PATTERN).expect("Invalid process pattern regex")
}

fn default_readiness_timeout() -> u64 {
    60
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_poll_timeout() -> u64 {
    10
}

fn default_log_buffer_lines() -> usize {
    4096
}

impl ClusterConfig {
    /// Create a configuration with default settings
    pub fn new(nodes: Vec<Node>, switch: NodeAddress) -> Self {
        Self {
            nodes,
            switch,
            local_host: default_local_host(),
            install_path: default_install_path(),
            config_file: None,
            control_port: default_control_port(),
            launch: LaunchMode::default(),
            verbosity: Verbosity::default(),
            commands: CommandTemplates::default(),
            slicer_marker: default_slicer_marker(),
            server_marker: default_server_marker(),
            process_pattern: default_process_pattern(),
            readiness_timeout_secs: default_readiness_timeout(),
            monitor_interval_secs: default_monitor_interval(),
            poll_timeout_secs: default_poll_timeout(),
            log_buffer_lines: default_log_buffer_lines(),
            client: ClientConfig::default(),
        }
    }

    /// Load and validate a configuration file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut config = Self::from_json(&text).map_err(|e| match e {
            ConfigError::Load { reason, .. } => ConfigError::Load {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        if config.config_file.is_none() {
            config.config_file = Some(path.to_path_buf());
        }

        Ok(config)
    }

    /// Parse and validate a configuration from JSON text
    pub fn from_json(text: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(text).map_err(|e| ConfigError::Load {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for inconsistencies
    pub fn validate(&self) -> ConfigResult<()> {
        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.trim().is_empty() {
                return Err(ConfigError::InvalidAddress {
                    value: node.address.to_string(),
                    reason: "node without a name".into(),
                });
            }
            if !names.insert(node.name.as_str()) {
                return Err(ConfigError::DuplicateNode {
                    name: node.name.clone(),
                });
            }
            validate_address(&node.address)?;
        }
        validate_address(&self.switch)?;

        if self.control_port == 0 {
            return Err(ConfigError::InvalidAddress {
                value: self.control_port.to_string(),
                reason: "control port must be non-zero".into(),
            });
        }

        let positive = [
            ("readiness timeout", self.readiness_timeout_secs),
            ("monitor interval", self.monitor_interval_secs),
            ("poll timeout", self.poll_timeout_secs),
            ("log buffer size", self.log_buffer_lines as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidInterval { name });
            }
        }

        Ok(())
    }

    /// Worker nodes
    pub fn workers(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of worker nodes
    pub fn worker_count(&self) -> usize {
        self.nodes.len()
    }

    /// The switch as a node
    pub fn switch_node(&self) -> Node {
        Node::switch(self.switch.clone())
    }

    /// Find a worker by name
    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Whether `host` names the machine this process runs on
    pub fn is_local(&self, host: &str) -> bool {
        host == self.local_host || host == "localhost" || host == "127.0.0.1"
    }

    /// Every host running a worker or the switch, in configuration order
    pub fn hosts(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.nodes
            .iter()
            .map(|n| n.host())
            .chain(std::iter::once(self.switch.host.as_str()))
            .filter(|h| seen.insert(*h))
            .map(str::to_string)
            .collect()
    }

    /// Hosts that need a slicer started on them
    pub fn remote_hosts(&self) -> Vec<String> {
        self.hosts()
            .into_iter()
            .filter(|h| !self.is_local(h))
            .collect()
    }

    /// Control-server address of a host
    pub fn control_address(&self, host: &str) -> NodeAddress {
        NodeAddress::new(host, self.control_port)
    }

    /// Role of the process(es) on `host`
    pub fn roles_on(&self, host: &str) -> Vec<NodeRole> {
        let mut roles: Vec<NodeRole> = self
            .nodes
            .iter()
            .filter(|n| n.host() == host)
            .map(|n| n.role)
            .collect();
        if self.switch.host == host {
            roles.push(NodeRole::Switch);
        }
        if roles.is_empty() && self.is_local(host) {
            roles.push(NodeRole::Local);
        }
        roles
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    /// Slicer command run on a remote host
    pub fn slicer_command(&self) -> String {
        self.render(&self.commands.slicer, None)
    }

    /// Worker command for a node listening on `port`
    pub fn node_command(&self, port: u16) -> String {
        self.render(&self.commands.node, Some(port))
    }

    /// Switch command
    pub fn switch_command(&self) -> String {
        self.render(&self.commands.switch, None)
    }

    /// Client command with its replay options
    pub fn client_command(&self) -> ConfigResult<String> {
        let source = self
            .client
            .source_file
            .as_deref()
            .ok_or(ConfigError::MissingClientSource)?;

        let mut parts = vec![self.render(&self.commands.client, None)];
        if let Some(rate) = self.client.rate_limit {
            parts.push(format!("-l {}", rate));
        }
        parts.extend(self.client.transforms.iter().map(|t| format!("-t '{}'", t)));
        parts.extend(self.client.projections.iter().map(|p| format!("-u '{}'", p)));
        parts.extend(self.client.upfront.iter().map(|u| format!("--upfront {}", u)));
        parts.push(format!("-h {}", source));

        Ok(parts.join(" "))
    }

    fn render(&self, template: &str, port: Option<u16>) -> String {
        let config_file = self
            .config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();

        let mut command = template
            .replace("{path}", &self.install_path)
            .replace("{config}", &config_file)
            .replace("{verbosity}", self.verbosity.flag());
        if let Some(port) = port {
            command = command.replace("{port}", &port.to_string());
        }
        command
    }
}

fn validate_address(address: &NodeAddress) -> ConfigResult<()> {
    if address.host.trim().is_empty() {
        return Err(ConfigError::InvalidAddress {
            value: address.to_string(),
            reason: "empty host".into(),
        });
    }
    if address.port == 0 {
        return Err(ConfigError::InvalidAddress {
            value: address.to_string(),
            reason: "port must be non-zero".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "nodes": [
            {"name": "n1", "host": "w1", "port": 7001},
            {"name": "n2", "host": "w2", "port": 7002}
        ],
        "switch": {"host": "localhost", "port": 7000},
        "local_host": "ctl",
        "install_path": "/opt/cumulus",
        "config_file": "/opt/cumulus/cluster.json",
        "verbosity": "quiet"
    }"#;

    #[test]
    fn test_load_defaults() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.worker_count(), 2);
        assert_eq!(config.control_port, DEFAULT_CONTROL_PORT);
        assert_eq!(config.launch, LaunchMode::Ssh);
        assert!(config.slicer_marker.is_match(SLICER_READY_SENTINEL));
        assert!(config.server_marker.is_match("INFO Starting Cumulus Server on 7001"));
        assert_eq!(config.readiness_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_hosts() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.hosts(), vec!["w1", "w2", "localhost"]);
        assert_eq!(config.remote_hosts(), vec!["w1", "w2"]);
        assert!(config.is_local("ctl"));
        assert_eq!(config.roles_on("localhost"), vec![NodeRole::Switch]);
    }

    #[test]
    fn test_commands() {
        let config = ClusterConfig::from_json(SAMPLE).unwrap();
        assert_eq!(
            config.node_command(7001),
            "/opt/cumulus/bin/node.sh -p 7001 -q /opt/cumulus/cluster.json"
        );
        assert_eq!(
            config.slicer_command(),
            "cd /opt/cumulus; ./bin/slicer.sh --serve /opt/cumulus/cluster.json"
        );
        assert!(matches!(
            config.client_command(),
            Err(ConfigError::MissingClientSource)
        ));

        let mut config = config;
        config.client.source_file = Some("ticks.csv".into());
        config.client.rate_limit = Some(100);
        config.client.transforms = vec!["bids".into()];
        assert_eq!(
            config.client_command().unwrap(),
            "/opt/cumulus/bin/client.sh -q -s -l 100 -t 'bids' -h ticks.csv"
        );
    }

    #[test]
    fn test_validation() {
        let duplicate = r#"{
            "nodes": [
                {"name": "n1", "host": "w1", "port": 7001},
                {"name": "n1", "host": "w2", "port": 7002}
            ],
            "switch": {"host": "localhost", "port": 7000}
        }"#;
        assert!(matches!(
            ClusterConfig::from_json(duplicate),
            Err(ConfigError::DuplicateNode { .. })
        ));

        let bad_pattern = r#"{
            "nodes": [],
            "switch": {"host": "localhost", "port": 7000},
            "server_marker": "Starting ("
        }"#;
        assert!(ClusterConfig::from_json(bad_pattern).is_err());

        let zero_interval = r#"{
            "nodes": [],
            "switch": {"host": "localhost", "port": 7000},
            "monitor_interval_secs": 0
        }"#;
        assert!(matches!(
            ClusterConfig::from_json(zero_interval),
            Err(ConfigError::InvalidInterval { .. })
        ));
    }

    #[test]
    fn test_line_pattern_extract() {
        let pattern = LinePattern::new(DEFAULT_PROCESS_PATTERN).unwrap();
        let line = "cumulus  4242  0.3  java -cp x.jar org.dbtoaster.cumulus.node.MapNode -p 7001";
        assert!(pattern.is_match(line));
        assert_eq!(
            pattern.extract(line),
            Some("org.dbtoaster.cumulus.node.MapNode")
        );
        assert_eq!(pattern.extract("bash"), None);

        let literal = LinePattern::literal("a.b").unwrap();
        assert!(literal.is_match("xa.by"));
        assert!(!literal.is_match("axb"));
    }
}
