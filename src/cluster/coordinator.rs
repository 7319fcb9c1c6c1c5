//! Primary coordinator - brings up the whole cluster
//!
//! Bootstrap proceeds in order:
//! 1. Declare the local handler master with a fresh bootstrap tracker
//! 2. Start a slicer on every remote host (in parallel) and wait for each
//!    to become ready, then ask it to forward its logs here
//! 3. Register the local handler as the client for the local host
//! 4. Start every worker and the switch
//! 5. Start the monitor over the remote hosts
//!
//! Readiness is then reported through [`PrimaryCoordinator::wait_until_ready`].

use crate::cluster::bootstrap::{BootstrapEvent, BootstrapTracker};
use crate::cluster::handler::LocalNodeHandler;
use crate::cluster::manager::NodeManager;
use crate::cluster::monitor::{ClusterMonitor, MonitorOptions, MonitorReport, Reporter};
use crate::config::ClusterConfig;
use crate::error::{ConfigError, Result, SlicerError};
use crate::rpc::{Connector, RemoteClient};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Drives the bootstrap of a cluster from the local host
pub struct PrimaryCoordinator {
    config: Arc<ClusterConfig>,
    handler: LocalNodeHandler,
    connector: Arc<dyn Connector>,
    managers: Vec<NodeManager>,
    clients: BTreeMap<String, Arc<dyn RemoteClient>>,
    events: Option<Receiver<BootstrapEvent>>,
    monitor: Option<ClusterMonitor>,
    reporter: Reporter,
}

impl PrimaryCoordinator {
    pub fn new(
        config: Arc<ClusterConfig>,
        handler: LocalNodeHandler,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            config,
            handler,
            connector,
            managers: Vec::new(),
            clients: BTreeMap::new(),
            events: None,
            monitor: None,
            reporter: Arc::new(|report: &MonitorReport| {
                for host in &report.hosts {
                    println!("{}", host.render());
                }
            }),
        }
    }

    /// Replace the monitor's report callback
    pub fn with_reporter(mut self, reporter: Reporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn handler(&self) -> &LocalNodeHandler {
        &self.handler
    }

    /// Hosts that get their own slicer
    pub fn remote_hosts(&self) -> Vec<String> {
        self.config.remote_hosts()
    }

    /// Launch every cluster process
    pub fn bootstrap(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);
        let (events_tx, events_rx) = unbounded();
        self.handler.declare_master(BootstrapTracker::new(
            config.worker_count(),
            config.server_marker.clone(),
            events_tx,
        ));
        self.events = Some(events_rx);

        info!(
            workers = config.worker_count(),
            switch = %config.switch,
            "Bootstrapping cluster"
        );

        self.spin_up_slicers()?;

        let local: Arc<dyn RemoteClient> = Arc::new(self.handler.clone());
        self.clients.insert(config.local_host.clone(), local);

        for node in config.workers() {
            info!(node = %node.name, addr = %node.address, "Starting node");
            self.client_for(node.host())?.start_node(node.address.port)?;
        }

        let switch = config.switch_node();
        info!(node = %switch.name, addr = %switch.address, "Starting switch");
        self.client_for(switch.host())?.start_switch()?;

        let monitored: Vec<(String, Arc<dyn RemoteClient>)> = self
            .remote_hosts()
            .into_iter()
            .filter_map(|host| self.clients.get(&host).map(|c| (host, Arc::clone(c))))
            .collect();
        self.monitor = Some(ClusterMonitor::start(
            monitored,
            MonitorOptions::from_config(&config),
            Arc::clone(&self.reporter),
        )?);

        Ok(())
    }

    /// Wait until every server has reported ready
    ///
    /// `on_event` sees each progress event. Starts the replay client
    /// afterwards when the configuration asks for it.
    pub fn wait_until_ready(
        &mut self,
        timeout: Duration,
        mut on_event: impl FnMut(&BootstrapEvent),
    ) -> Result<()> {
        let events = self.events.clone().ok_or(SlicerError::ChannelClosed)?;
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match events.recv_timeout(remaining) {
                Ok(event) => {
                    on_event(&event);
                    if event == BootstrapEvent::Ready {
                        break;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SlicerError::ReadinessTimeout {
                        host: "cluster".into(),
                        waited: started.elapsed(),
                        log: self.collect_logs(),
                    });
                }
                Err(RecvTimeoutError::Disconnected) => return Err(SlicerError::ChannelClosed),
            }
        }

        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Cluster ready");

        if self.config.client.autostart {
            info!("Starting client");
            self.client_for(&self.config.switch.host)?.start_client()?;
        }
        Ok(())
    }

    /// Clients by host, including the local handler
    pub fn clients(&self) -> &BTreeMap<String, Arc<dyn RemoteClient>> {
        &self.clients
    }

    /// Hosts the monitor polls
    pub fn monitored_hosts(&self) -> Vec<String> {
        self.monitor
            .as_ref()
            .map(|m| m.hosts().to_vec())
            .unwrap_or_default()
    }

    /// Stop the monitor, every remote member and the local handler
    pub fn shutdown(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.stop();
        }

        for (host, client) in std::mem::take(&mut self.clients) {
            if self.config.is_local(&host) {
                continue;
            }
            if let Err(e) = client.shutdown() {
                warn!(host = %host, error = %e, "Remote shutdown failed");
            }
        }

        for manager in self.managers.drain(..) {
            manager.terminate();
        }

        if let Err(e) = self.handler.shutdown() {
            warn!(error = %e, "Local shutdown failed");
        }
    }

    fn client_for(&self, host: &str) -> Result<Arc<dyn RemoteClient>> {
        let key = if self.config.is_local(host) {
            self.config.local_host.as_str()
        } else {
            host
        };
        self.clients.get(key).cloned().ok_or_else(|| {
            ConfigError::UnknownNode {
                node: host.to_string(),
                context: "bootstrap (no slicer for host)".into(),
            }
            .into()
        })
    }

    /// Start and connect a slicer on every remote host
    fn spin_up_slicers(&mut self) -> Result<()> {
        let hosts = self.remote_hosts();
        if hosts.is_empty() {
            return Ok(());
        }

        let config = Arc::clone(&self.config);
        let connector = Arc::clone(&self.connector);

        let results: Vec<(String, Result<SpunUp>)> = thread::scope(|scope| {
            let handles: Vec<_> = hosts
                .iter()
                .map(|host| {
                    let config = &config;
                    let connector = Arc::clone(&connector);
                    let spawned = thread::Builder::new()
                        .name(format!("spin-up-{}", host))
                        .spawn_scoped(scope, move || spin_up(host, config, connector));
                    (host.clone(), spawned)
                })
                .collect();

            handles
                .into_iter()
                .map(|(host, spawned)| {
                    let result = match spawned {
                        Ok(handle) => handle.join().unwrap_or_else(|_| {
                            Err(SlicerError::Panicked {
                                name: format!("spin-up-{}", host),
                            })
                        }),
                        Err(e) => Err(SlicerError::Io(e)),
                    };
                    (host, result)
                })
                .collect()
        });

        let mut first_error = None;
        for (host, result) in results {
            match result {
                Ok((manager, client)) => {
                    self.managers.push(manager);
                    self.clients.insert(host, client);
                }
                Err(e) => {
                    error!(host = %host, error = %e, "Failed to start slicer");
                    if let Some(log) = e.log_context() {
                        eprintln!("---- output from {} ----\n{}", host, log);
                    }
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => {
                for manager in self.managers.drain(..) {
                    manager.terminate();
                }
                self.clients.clear();
                Err(e)
            }
            None => Ok(()),
        }
    }

    fn collect_logs(&mut self) -> String {
        self.managers
            .iter_mut()
            .map(|m| {
                let log = m.log();
                format!("---- {} ----\n{}", m.host(), log)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A running slicer and its control client
type SpunUp = (NodeManager, Arc<dyn RemoteClient>);

fn spin_up(host: &str, config: &ClusterConfig, connector: Arc<dyn Connector>) -> Result<SpunUp> {
    info!(host = %host, roles = ?config.roles_on(host), "Starting slicer");
    let mut manager = NodeManager::launch(host, config, connector)?;
    let client = manager.client()?;
    client.start_logging(&config.local_host)?;
    info!(host = %host, "Slicer ready");
    Ok((manager, client))
}
