//! Local node handler - the in-process actor every cluster member runs
//!
//! The handler owns an inbox consumed by exactly one thread. Log lines
//! from locally launched processes are posted as `Data` messages and
//! forwarded, in arrival order, to every subscriber. A subscriber that
//! fails to accept a line is dropped.
//!
//! The handler on the coordinator is declared master: it subscribes
//! itself and feeds every line it receives to the bootstrap tracker.

use crate::cluster::bootstrap::BootstrapTracker;
use crate::config::{ClusterConfig, LinePattern};
use crate::error::{RpcError, RpcResult, SlicerError, SpawnError};
use crate::process::{Launch, LineSink, LogLine, ProcessSupervisor};
use crate::rpc::{Connector, RemoteClient};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Messages consumed by the handler's inbox loop
pub enum InboxMessage {
    /// A line of process output
    Data(LogLine),

    /// Forward subsequent lines to this client
    Subscribe(Arc<dyn RemoteClient>),

    /// Stop after this message; anything queued behind it is discarded
    Shutdown,
}

struct HandlerInner {
    host: String,
    config: Arc<ClusterConfig>,
    connector: Arc<dyn Connector>,
    inbox: Sender<InboxMessage>,
    master: AtomicBool,
    processor: Mutex<Option<BootstrapTracker>>,
    processes: Mutex<Vec<ProcessSupervisor>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a node handler (cheap to clone)
#[derive(Clone)]
pub struct LocalNodeHandler {
    inner: Arc<HandlerInner>,
}

/// Posts a process's lines into the inbox tagged with its source
struct TaggedSink {
    source: String,
    inbox: Sender<InboxMessage>,
}

impl LineSink for TaggedSink {
    fn push_line(&self, line: String) -> bool {
        self.inbox
            .send(InboxMessage::Data(LogLine::new(self.source.clone(), line)))
            .is_ok()
    }
}

impl LocalNodeHandler {
    /// Create a handler for `host` and start its inbox consumer
    pub fn new(
        host: impl Into<String>,
        config: Arc<ClusterConfig>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SlicerError> {
        let host = host.into();
        let (inbox, receiver) = unbounded();

        let consumer = thread::Builder::new()
            .name(format!("inbox-{}", host))
            .spawn(move || inbox_loop(receiver))?;

        debug!(host = %host, "Node handler started");

        Ok(Self {
            inner: Arc::new(HandlerInner {
                host,
                config,
                connector,
                inbox,
                master: AtomicBool::new(false),
                processor: Mutex::new(None),
                processes: Mutex::new(Vec::new()),
                consumer: Mutex::new(Some(consumer)),
            }),
        })
    }

    /// Host this handler runs on
    pub fn host(&self) -> &str {
        &self.inner.host
    }

    pub fn config(&self) -> &Arc<ClusterConfig> {
        &self.inner.config
    }

    pub fn is_master(&self) -> bool {
        self.inner.master.load(Ordering::SeqCst)
    }

    /// Whether a bootstrap processor is still installed
    pub fn is_bootstrapping(&self) -> bool {
        self.inner.processor.lock().is_some()
    }

    /// Become the master and install `tracker` as the log processor
    ///
    /// Declaring again only replaces the processor. The handler subscribes
    /// to its own inbox through a weak reference, so dropping the last
    /// handle still stops the inbox thread and the launched processes.
    pub fn declare_master(&self, tracker: BootstrapTracker) {
        *self.inner.processor.lock() = Some(tracker);

        if !self.inner.master.swap(true, Ordering::SeqCst) {
            info!(host = %self.inner.host, "Declared master");
            let me: Arc<dyn RemoteClient> = Arc::new(SelfForwarder(Arc::downgrade(&self.inner)));
            self.post(InboxMessage::Subscribe(me));
        }
    }

    /// Post a message to the inbox
    pub fn post(&self, message: InboxMessage) {
        if self.inner.inbox.send(message).is_err() {
            debug!(host = %self.inner.host, "Inbox closed, message dropped");
        }
    }

    /// Launch a local process whose output feeds the inbox
    pub fn start_process(&self, tag: &str, command: &str) -> Result<u32, SpawnError> {
        let source = format!("{}/{}", self.inner.host, tag);
        self.post(InboxMessage::Data(LogLine::new(
            source.clone(),
            format!("Running: {}", command),
        )));

        let sink = TaggedSink {
            source,
            inbox: self.inner.inbox.clone(),
        };
        let process = ProcessSupervisor::spawn(&Launch::Local, command, sink)?;
        let pid = process.pid();

        info!(host = %self.inner.host, tag = tag, pid = pid, "Process started");
        self.inner.processes.lock().push(process);
        Ok(pid)
    }

    /// Number of launched processes still running
    pub fn running_processes(&self) -> usize {
        self.inner.processes.lock().iter().filter(|p| p.running()).count()
    }

    /// Worker-process lines from the local process table
    pub fn process_stats(&self) -> std::io::Result<String> {
        let output = Command::new("ps").arg("aux").output()?;
        let table = String::from_utf8_lossy(&output.stdout);
        Ok(filter_stats(&table, &self.inner.config.process_pattern))
    }

    /// Wait for the inbox consumer to exit
    pub fn wait(&self) -> Result<(), SlicerError> {
        let handle = self.inner.consumer.lock().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| SlicerError::Panicked {
                name: format!("inbox-{}", self.inner.host),
            }),
            None => Ok(()),
        }
    }

    fn terminate_processes(&self) {
        let processes = std::mem::take(&mut *self.inner.processes.lock());
        for process in &processes {
            process.terminate();
        }
        if !processes.is_empty() {
            info!(host = %self.inner.host, count = processes.len(), "Processes terminated");
        }
    }
}

/// The master's subscription to its own inbox
struct SelfForwarder(Weak<HandlerInner>);

impl SelfForwarder {
    fn with<T>(&self, f: impl FnOnce(&LocalNodeHandler) -> RpcResult<T>) -> RpcResult<T> {
        match self.0.upgrade() {
            Some(inner) => f(&LocalNodeHandler { inner }),
            None => Err(RpcError::Disconnected {
                addr: "local handler".into(),
            }),
        }
    }
}

impl RemoteClient for SelfForwarder {
    fn start_node(&self, port: u16) -> RpcResult<()> {
        self.with(|h| h.start_node(port))
    }

    fn start_switch(&self) -> RpcResult<()> {
        self.with(|h| h.start_switch())
    }

    fn start_client(&self) -> RpcResult<()> {
        self.with(|h| h.start_client())
    }

    fn start_logging(&self, master_host: &str) -> RpcResult<()> {
        self.with(|h| h.start_logging(master_host))
    }

    fn poll_stats(&self) -> RpcResult<String> {
        self.with(|h| h.poll_stats())
    }

    fn receive_log(&self, line: LogLine) -> RpcResult<()> {
        self.with(|h| h.receive_log(line))
    }

    fn shutdown(&self) -> RpcResult<()> {
        self.with(|h| h.shutdown())
    }
}

fn filter_stats(table: &str, pattern: &LinePattern) -> String {
    table
        .lines()
        .filter(|line| pattern.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}

fn remote(e: impl ToString) -> RpcError {
    RpcError::Remote(e.to_string())
}

impl RemoteClient for LocalNodeHandler {
    fn start_node(&self, port: u16) -> RpcResult<()> {
        let command = self.inner.config.node_command(port);
        self.start_process(&format!("node-{}", port), &command)
            .map(|_| ())
            .map_err(remote)
    }

    fn start_switch(&self) -> RpcResult<()> {
        let command = self.inner.config.switch_command();
        self.start_process("switch", &command).map(|_| ()).map_err(remote)
    }

    fn start_client(&self) -> RpcResult<()> {
        let command = self.inner.config.client_command().map_err(remote)?;
        self.start_process("client", &command).map(|_| ()).map_err(remote)
    }

    fn start_logging(&self, master_host: &str) -> RpcResult<()> {
        let addr = self.inner.config.control_address(master_host);
        let client = self.inner.connector.connect(&addr)?;
        info!(host = %self.inner.host, master = %addr, "Forwarding logs to master");
        self.post(InboxMessage::Subscribe(client));
        Ok(())
    }

    fn poll_stats(&self) -> RpcResult<String> {
        self.process_stats().map_err(remote)
    }

    fn receive_log(&self, line: LogLine) -> RpcResult<()> {
        println!("{}", line);

        if !self.is_master() {
            return Ok(());
        }

        let mut processor = self.inner.processor.lock();
        let ready = match processor.as_mut() {
            Some(tracker) => tracker.observe(&line),
            None => false,
        };
        if ready {
            // Back to passthrough printing
            *processor = None;
        }
        Ok(())
    }

    fn shutdown(&self) -> RpcResult<()> {
        info!(host = %self.inner.host, "Shutting down node handler");
        self.terminate_processes();
        self.post(InboxMessage::Shutdown);
        Ok(())
    }
}

fn inbox_loop(receiver: Receiver<InboxMessage>) {
    let mut subscribers: Vec<Arc<dyn RemoteClient>> = Vec::new();

    for message in receiver.iter() {
        match message {
            InboxMessage::Data(line) => {
                subscribers.retain(|subscriber| match subscriber.receive_log(line.clone()) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(source = %line.source, error = %e, "Dropping log subscriber");
                        false
                    }
                });
            }
            InboxMessage::Subscribe(client) => {
                subscribers.push(client);
                debug!(count = subscribers.len(), "Log subscriber added");
            }
            InboxMessage::Shutdown => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::bootstrap::BootstrapEvent;
    use crate::node::NodeAddress;
    use std::time::Duration;

    struct NoConnector;

    impl Connector for NoConnector {
        fn connect(&self, addr: &NodeAddress) -> RpcResult<Arc<dyn RemoteClient>> {
            Err(RpcError::ConnectFailed {
                addr: addr.to_string(),
                reason: "offline".into(),
            })
        }
    }

    /// Records every line it receives
    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<LogLine>>,
        fail: bool,
    }

    impl RemoteClient for Recorder {
        fn start_node(&self, _port: u16) -> RpcResult<()> {
            Ok(())
        }
        fn start_switch(&self) -> RpcResult<()> {
            Ok(())
        }
        fn start_client(&self) -> RpcResult<()> {
            Ok(())
        }
        fn start_logging(&self, _master_host: &str) -> RpcResult<()> {
            Ok(())
        }
        fn poll_stats(&self) -> RpcResult<String> {
            Ok(String::new())
        }
        fn receive_log(&self, line: LogLine) -> RpcResult<()> {
            if self.fail {
                return Err(RpcError::Disconnected { addr: "gone".into() });
            }
            self.lines.lock().push(line);
            Ok(())
        }
        fn shutdown(&self) -> RpcResult<()> {
            Ok(())
        }
    }

    fn handler() -> LocalNodeHandler {
        let mut config = ClusterConfig::new(Vec::new(), NodeAddress::new("localhost", 7000));
        config.local_host = "ctl".into();
        LocalNodeHandler::new("ctl", Arc::new(config), Arc::new(NoConnector)).unwrap()
    }

    #[test]
    fn test_forwards_in_order_to_later_subscribers_only() {
        let handler = handler();
        let early = Arc::new(Recorder::default());
        let late = Arc::new(Recorder::default());

        handler.post(InboxMessage::Subscribe(early.clone()));
        handler.post(InboxMessage::Data(LogLine::new("ctl/a", "1")));
        handler.post(InboxMessage::Subscribe(late.clone()));
        handler.post(InboxMessage::Data(LogLine::new("ctl/a", "2")));
        handler.post(InboxMessage::Shutdown);
        handler.post(InboxMessage::Data(LogLine::new("ctl/a", "discarded")));
        handler.wait().unwrap();

        let texts =
            |r: &Recorder| r.lines.lock().iter().map(|l| l.text.clone()).collect::<Vec<_>>();
        assert_eq!(texts(&early), vec!["1", "2"]);
        assert_eq!(texts(&late), vec!["2"]);
    }

    #[test]
    fn test_failing_subscriber_is_dropped() {
        let handler = handler();
        let broken = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Recorder::default());

        handler.post(InboxMessage::Subscribe(broken));
        handler.post(InboxMessage::Subscribe(healthy.clone()));
        handler.post(InboxMessage::Data(LogLine::new("ctl/a", "1")));
        handler.post(InboxMessage::Data(LogLine::new("ctl/a", "2")));
        handler.post(InboxMessage::Shutdown);
        handler.wait().unwrap();

        assert_eq!(healthy.lines.lock().len(), 2);
    }

    #[test]
    fn test_master_tracks_bootstrap_and_reverts_to_passthrough() {
        let handler = handler();
        let (tx, rx) = unbounded();
        let marker = LinePattern::literal("Starting Cumulus Server").unwrap();

        // Not master yet: lines are only printed
        handler.receive_log(LogLine::new("w1/node-7001", "Starting Cumulus Server")).unwrap();
        assert!(!handler.is_bootstrapping());

        handler.declare_master(BootstrapTracker::new(0, marker.clone(), tx.clone()));
        handler.declare_master(BootstrapTracker::new(0, marker, tx));
        assert!(handler.is_master());
        assert!(handler.is_bootstrapping());

        handler.post(InboxMessage::Data(LogLine::new("ctl/switch", "Starting Cumulus Server")));
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            BootstrapEvent::ServerUp {
                source: "ctl/switch".into(),
                pending: 0
            }
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), BootstrapEvent::Ready);

        // Re-declaring did not subscribe twice: exactly one Ready
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

        handler.shutdown().unwrap();
        handler.wait().unwrap();
        assert!(!handler.is_bootstrapping());
    }

    #[test]
    fn test_dropped_master_stops_its_inbox() {
        let handler = handler();
        let (tx, _rx) = unbounded();
        let marker = LinePattern::literal("Starting Cumulus Server").unwrap();
        handler.declare_master(BootstrapTracker::new(1, marker, tx));

        let consumer = handler.inner.consumer.lock().take().unwrap();
        let inner = Arc::downgrade(&handler.inner);
        drop(handler);

        assert!(inner.upgrade().is_none());
        consumer.join().unwrap();
    }

    #[test]
    fn test_start_process_feeds_inbox() {
        let handler = handler();
        let recorder = Arc::new(Recorder::default());
        handler.post(InboxMessage::Subscribe(recorder.clone()));

        handler.start_process("echo", "echo hello").unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while recorder.lines.lock().len() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        let lines = recorder.lines.lock().clone();
        assert_eq!(lines[0], LogLine::new("ctl/echo", "Running: echo hello"));
        assert_eq!(lines[1], LogLine::new("ctl/echo", "hello"));

        handler.start_process("idle", "exec sleep 30").unwrap();
        assert!(handler.running_processes() >= 1);

        handler.shutdown().unwrap();
        handler.wait().unwrap();
    }

    #[test]
    fn test_start_client_requires_source() {
        let handler = handler();
        assert!(matches!(handler.start_client(), Err(RpcError::Remote(_))));
        handler.shutdown().unwrap();
    }

    #[test]
    fn test_filter_stats() {
        let pattern = LinePattern::new(crate::config::DEFAULT_PROCESS_PATTERN).unwrap();
        let table = "USER PID COMMAND\n\
                     app 10 java org.dbtoaster.cumulus.node.MapNode\n\
                     app 11 bash\n\
                     app 12 java org.dbtoaster.cumulus.chef.ChefNode";
        let filtered = filter_stats(table, &pattern);
        assert_eq!(filtered.lines().count(), 2);
        assert!(filtered.contains("MapNode"));
        assert!(!filtered.contains("bash"));
    }
}
