//! Node manager - proxy for the slicer running on one remote host
//!
//! The manager starts the host's slicer, watches its output for the
//! readiness marker, and then connects to its control server. The client
//! is created at most once.

use crate::config::{ClusterConfig, LaunchMode, LinePattern};
use crate::error::{Result, SlicerError};
use crate::node::NodeAddress;
use crate::process::{Launch, LogBuffer, ProcessSupervisor};
use crate::rpc::{Connector, RemoteClient};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// How long a single wait on the log buffer blocks
const POLL_SLICE: Duration = Duration::from_millis(100);

/// Lines consumed while waiting for readiness, kept for error reports
const CONTEXT_LINES: usize = 200;

/// Readiness settings for a managed process
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Line announcing that the control server is up
    pub marker: LinePattern,

    /// Bound on waiting for the marker
    pub timeout: Duration,

    /// Capacity of the log buffer
    pub buffer_lines: usize,
}

impl ManagerSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            marker: config.slicer_marker.clone(),
            timeout: config.readiness_timeout(),
            buffer_lines: config.log_buffer_lines,
        }
    }
}

/// Owns one slicer process and, once it is ready, its client
pub struct NodeManager {
    host: String,
    address: NodeAddress,
    process: ProcessSupervisor,
    buffer: LogBuffer,
    settings: ManagerSettings,
    connector: Arc<dyn Connector>,
    client: Option<Arc<dyn RemoteClient>>,
    recent: VecDeque<String>,
}

impl NodeManager {
    /// Start the slicer for `host` as the configuration describes
    pub fn launch(
        host: &str,
        config: &ClusterConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let launch = match config.launch {
            LaunchMode::Ssh => Launch::Ssh {
                host: host.to_string(),
            },
            LaunchMode::Local => Launch::Local,
        };

        Self::spawn(
            host,
            config.control_address(host),
            &launch,
            &config.slicer_command(),
            ManagerSettings::from_config(config),
            connector,
        )
    }

    /// Start `command` and manage it as the slicer for `host`
    pub fn spawn(
        host: &str,
        address: NodeAddress,
        launch: &Launch,
        command: &str,
        settings: ManagerSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let buffer = LogBuffer::new(settings.buffer_lines);
        let process = ProcessSupervisor::spawn(launch, command, buffer.writer())?;

        info!(host = %host, pid = process.pid(), "Slicer launched");

        Ok(Self {
            host: host.to_string(),
            address,
            process,
            buffer,
            settings,
            connector,
            client: None,
            recent: VecDeque::new(),
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The control client, waiting for readiness on first use
    pub fn client(&mut self) -> Result<Arc<dyn RemoteClient>> {
        if let Some(client) = &self.client {
            return Ok(Arc::clone(client));
        }

        let started = Instant::now();
        let deadline = started + self.settings.timeout;

        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SlicerError::ReadinessTimeout {
                    host: self.host.clone(),
                    waited: started.elapsed(),
                    log: self.log(),
                });
            }

            match self.buffer.pop_timeout(POLL_SLICE.min(deadline - now)) {
                Some(line) => {
                    let ready = self.settings.marker.is_match(&line);
                    self.remember(line);
                    if ready {
                        break;
                    }
                }
                None => {
                    if !self.process.output_open() && self.buffer.is_empty() {
                        return Err(SlicerError::NodeExited {
                            host: self.host.clone(),
                            log: self.log(),
                        });
                    }
                }
            }
        }

        debug!(host = %self.host, addr = %self.address, "Slicer ready, connecting");
        let client = self.connector.connect(&self.address)?;
        self.client = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Buffered output: lines consumed while waiting plus unread lines
    pub fn log(&mut self) -> String {
        let mut lines: Vec<String> = self.recent.drain(..).collect();
        lines.extend(self.buffer.drain());
        lines.join("\n")
    }

    /// Whether the slicer process is alive
    pub fn running(&self) -> bool {
        self.process.running()
    }

    /// Fail with the buffered output if the process has exited
    pub fn check_error(&mut self) -> Result<()> {
        if self.running() {
            return Ok(());
        }
        Err(SlicerError::NodeExited {
            host: self.host.clone(),
            log: self.log(),
        })
    }

    /// Stop the slicer process
    pub fn terminate(&self) {
        self.process.terminate();
    }

    fn remember(&mut self, line: String) {
        if self.recent.len() == CONTEXT_LINES {
            self.recent.pop_front();
        }
        self.recent.push_back(line);
    }
}
