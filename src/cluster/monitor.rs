//! Cluster monitor - periodic process-table polling
//!
//! Each monitored host gets a poller thread with a one-slot request
//! channel. A ticker thread starts a cycle every interval: it sends a
//! request to every idle poller, collects answers until the per-host
//! timeout, and hands one report to the reporter. A host that is slow or
//! failing only affects its own entry; the ticker never waits past the
//! timeout and keeps ticking.

use crate::config::{ClusterConfig, LinePattern};
use crate::error::{PollFailure, Result, RpcResult, SlicerError};
use crate::rpc::RemoteClient;
use chrono::{DateTime, Local};
use crossbeam_channel::{bounded, never, select, tick, unbounded, Receiver, Sender, TrySendError};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Callback receiving one report per cycle
pub type Reporter = Arc<dyn Fn(&MonitorReport) + Send + Sync>;

/// Monitor timing and filtering
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    /// Time between cycles
    pub interval: Duration,

    /// How long a cycle waits for each host
    pub poll_timeout: Duration,

    /// Worker-process pattern
    pub pattern: LinePattern,
}

impl MonitorOptions {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            interval: config.monitor_interval(),
            poll_timeout: config.poll_timeout(),
            pattern: config.process_pattern.clone(),
        }
    }
}

/// One worker process seen in a host's process table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStat {
    pub pid: Option<u32>,
    pub name: String,
}

impl ProcessStat {
    /// Parse a `ps aux` line; `None` if it does not match `pattern`
    pub fn parse(line: &str, pattern: &LinePattern) -> Option<Self> {
        let name = pattern.extract(line)?;
        let pid = line.split_whitespace().nth(1).and_then(|p| p.parse().ok());
        Some(Self {
            pid,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for ProcessStat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pid {
            Some(pid) => write!(f, "{} {}", pid, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Outcome for one host in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostReport {
    pub host: String,
    pub outcome: std::result::Result<Vec<ProcessStat>, PollFailure>,
}

impl HostReport {
    /// One-line summary
    pub fn render(&self) -> String {
        match &self.outcome {
            Ok(procs) if procs.is_empty() => format!("{}: no worker processes", self.host),
            Ok(procs) => format!(
                "{}: {} worker process(es) [{}]",
                self.host,
                procs.len(),
                procs.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(", ")
            ),
            Err(failure) => format!("{}: {}", self.host, failure),
        }
    }
}

/// Result of one polling cycle
#[derive(Debug, Clone)]
pub struct MonitorReport {
    pub cycle: u64,
    pub timestamp: DateTime<Local>,
    pub hosts: Vec<HostReport>,
}

impl MonitorReport {
    /// Hosts that did not produce stats this cycle
    pub fn failures(&self) -> usize {
        self.hosts.iter().filter(|h| h.outcome.is_err()).count()
    }
}

struct PollRequest {
    cycle: u64,
}

struct PollResponse {
    slot: usize,
    cycle: u64,
    outcome: RpcResult<String>,
}

/// Pollers plus per-host bookkeeping, driven one cycle at a time
struct Ticker {
    hosts: Vec<String>,
    requests: Vec<Sender<PollRequest>>,
    responses: Receiver<PollResponse>,
    in_flight: Vec<Option<u64>>,
    options: MonitorOptions,
    cycle: u64,
}

impl Ticker {
    fn new(clients: Vec<(String, Arc<dyn RemoteClient>)>, options: MonitorOptions) -> Result<Self> {
        let (response_tx, responses) = unbounded();
        let mut hosts = Vec::with_capacity(clients.len());
        let mut requests = Vec::with_capacity(clients.len());

        for (slot, (host, client)) in clients.into_iter().enumerate() {
            let (request_tx, request_rx) = bounded::<PollRequest>(1);
            let response_tx = response_tx.clone();

            thread::Builder::new()
                .name(format!("poll-{}", host))
                .spawn(move || {
                    for request in request_rx.iter() {
                        let outcome = client.poll_stats();
                        let response = PollResponse {
                            slot,
                            cycle: request.cycle,
                            outcome,
                        };
                        if response_tx.send(response).is_err() {
                            break;
                        }
                    }
                })?;

            hosts.push(host);
            requests.push(request_tx);
        }

        Ok(Self {
            in_flight: vec![None; hosts.len()],
            hosts,
            requests,
            responses,
            options,
            cycle: 0,
        })
    }

    /// Run one cycle; `None` if `stop` fired before it finished
    fn run_cycle(&mut self, stop: &Receiver<()>) -> Option<MonitorReport> {
        self.cycle += 1;
        let cycle = self.cycle;
        let timestamp = Local::now();

        // Answers that arrived after their cycle ended
        while let Ok(late) = self.responses.try_recv() {
            self.in_flight[late.slot] = None;
        }

        let mut outcomes: Vec<Option<std::result::Result<Vec<ProcessStat>, PollFailure>>> =
            (0..self.hosts.len()).map(|_| None).collect();

        for slot in 0..self.hosts.len() {
            let host = &self.hosts[slot];
            if let Some(outstanding) = self.in_flight[slot] {
                outcomes[slot] = Some(Err(PollFailure::Stalled {
                    host: host.clone(),
                    cycle: outstanding,
                }));
                continue;
            }
            match self.requests[slot].try_send(PollRequest { cycle }) {
                Ok(()) => self.in_flight[slot] = Some(cycle),
                Err(TrySendError::Full(_)) => {
                    outcomes[slot] = Some(Err(PollFailure::Stalled {
                        host: host.clone(),
                        cycle: cycle - 1,
                    }));
                }
                Err(TrySendError::Disconnected(_)) => {
                    outcomes[slot] = Some(Err(PollFailure::Failed {
                        host: host.clone(),
                        reason: "poller stopped".into(),
                    }));
                }
            }
        }

        let deadline = Instant::now() + self.options.poll_timeout;
        while self.in_flight.contains(&Some(cycle)) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            select! {
                recv(stop) -> _ => return None,
                recv(self.responses) -> msg => match msg {
                    Ok(response) => {
                        self.in_flight[response.slot] = None;
                        if response.cycle == cycle {
                            let outcome = self.interpret(response.slot, response.outcome);
                            outcomes[response.slot] = Some(outcome);
                        }
                    }
                    Err(_) => break,
                },
                default(remaining) => break,
            }
        }

        let hosts = self
            .hosts
            .iter()
            .zip(outcomes)
            .map(|(host, outcome)| HostReport {
                host: host.clone(),
                outcome: outcome.unwrap_or_else(|| {
                    Err(PollFailure::NoResponse {
                        host: host.clone(),
                        waited: self.options.poll_timeout,
                    })
                }),
            })
            .collect();

        Some(MonitorReport {
            cycle,
            timestamp,
            hosts,
        })
    }

    fn interpret(
        &self,
        slot: usize,
        outcome: RpcResult<String>,
    ) -> std::result::Result<Vec<ProcessStat>, PollFailure> {
        match outcome {
            Ok(text) => Ok(text
                .lines()
                .filter_map(|line| ProcessStat::parse(line, &self.options.pattern))
                .collect()),
            Err(e) => Err(PollFailure::Failed {
                host: self.hosts[slot].clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Periodic poller over a fixed set of hosts
pub struct ClusterMonitor {
    hosts: Vec<String>,
    stop: Option<Sender<()>>,
    ticker: Option<JoinHandle<()>>,
}

impl ClusterMonitor {
    /// Start polling `clients` every interval
    pub fn start(
        clients: Vec<(String, Arc<dyn RemoteClient>)>,
        options: MonitorOptions,
        reporter: Reporter,
    ) -> Result<Self> {
        let hosts: Vec<String> = clients.iter().map(|(host, _)| host.clone()).collect();
        let mut ticker = Ticker::new(clients, options)?;
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let handle = thread::Builder::new().name("monitor".into()).spawn(move || {
            let ticks = tick(ticker.options.interval);
            loop {
                select! {
                    recv(stop_rx) -> _ => break,
                    recv(ticks) -> _ => {
                        let Some(report) = ticker.run_cycle(&stop_rx) else { break };
                        if report.failures() > 0 {
                            warn!(
                                cycle = report.cycle,
                                failures = report.failures(),
                                "Monitor cycle incomplete"
                            );
                        } else {
                            debug!(cycle = report.cycle, "Monitor cycle complete");
                        }
                        reporter(&report);
                    }
                }
            }
        })?;

        debug!(hosts = hosts.len(), "Cluster monitor started");

        Ok(Self {
            hosts,
            stop: Some(stop_tx),
            ticker: Some(handle),
        })
    }

    /// Poll every client once and wait for the result
    pub fn collect_once(
        clients: Vec<(String, Arc<dyn RemoteClient>)>,
        options: MonitorOptions,
    ) -> Result<MonitorReport> {
        let mut ticker = Ticker::new(clients, options)?;
        let stop = never();
        ticker
            .run_cycle(&stop)
            .ok_or(SlicerError::ChannelClosed)
    }

    /// Monitored hosts in polling order
    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Stop ticking; pollers exit after their current request
    pub fn stop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.ticker.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for ClusterMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
