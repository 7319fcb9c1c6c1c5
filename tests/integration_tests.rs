//! Integration tests for cumulus-slicer
//!
//! Cluster scenarios run every process locally with `sh`; remote slicers
//! are replaced by in-memory clients.

use cumulus_slicer::cluster::{
    BootstrapEvent, BootstrapTracker, LocalNodeHandler, MonitorReport, PrimaryCoordinator,
};
use cumulus_slicer::config::{ClusterConfig, LaunchMode, LinePattern, SERVER_READY_SENTINEL};
use cumulus_slicer::error::{ConfigError, RpcError, RpcResult, SlicerError};
use cumulus_slicer::node::{Node, NodeAddress};
use cumulus_slicer::planner::{
    build_descriptor, DeploymentDescriptor, MapCatalog, PartitionDirective, PartitionPlanner,
};
use cumulus_slicer::process::LogLine;
use cumulus_slicer::rpc::{Connector, ControlClient, ControlServer, HttpConnector, RemoteClient};
use crossbeam_channel::unbounded;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

/// Stands in for a slicer on a remote host: starting a node makes the
/// master observe that node's server marker.
struct FakeSlicer {
    host: String,
    master: LocalNodeHandler,
}

impl RemoteClient for FakeSlicer {
    fn start_node(&self, port: u16) -> RpcResult<()> {
        self.master.receive_log(LogLine::new(
            format!("{}/node-{}", self.host, port),
            format!("INFO {} on port {}", SERVER_READY_SENTINEL, port),
        ))
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

    fn receive_log(&self, _line: LogLine) -> RpcResult<()> {
        Ok(())
    }

    fn shutdown(&self) -> RpcResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct FakeConnector {
    master: Mutex<Option<LocalNodeHandler>>,
    connected: Mutex<Vec<String>>,
}

impl Connector for FakeConnector {
    fn connect(&self, addr: &NodeAddress) -> RpcResult<Arc<dyn RemoteClient>> {
        let master = self.master.lock().clone().ok_or_else(|| RpcError::ConnectFailed {
            addr: addr.to_string(),
            reason: "no master".into(),
        })?;
        self.connected.lock().push(addr.host.clone());
        Ok(Arc::new(FakeSlicer {
            host: addr.host.clone(),
            master,
        }))
    }
}

fn local_config(nodes: Vec<Node>) -> ClusterConfig {
    let mut config = ClusterConfig::new(nodes, NodeAddress::new("localhost", 7000));
    config.local_host = "ctl".into();
    config.launch = LaunchMode::Local;
    config.commands.slicer = "echo booting; echo '====> Server Ready <===='; exec sleep 30".into();
    config.commands.switch = "echo 'Starting Cumulus Server'; exec sleep 30".into();
    config.readiness_timeout_secs = 10;
    config.monitor_interval_secs = 1;
    config.poll_timeout_secs = 1;
    config
}

fn coordinator(
    config: ClusterConfig,
) -> (PrimaryCoordinator, LocalNodeHandler, Arc<FakeConnector>) {
    let config = Arc::new(config);
    let connector = Arc::new(FakeConnector::default());
    let handler = LocalNodeHandler::new("ctl", Arc::clone(&config), connector.clone()).unwrap();
    *connector.master.lock() = Some(handler.clone());

    let coordinator = PrimaryCoordinator::new(config, handler.clone(), connector.clone())
        .with_reporter(Arc::new(|_: &MonitorReport| {}));
    (coordinator, handler, connector)
}

#[test]
fn test_two_workers_and_local_switch_reach_ready() {
    let config = local_config(vec![
        Node::worker("n1", NodeAddress::new("w1", 7001)),
        Node::worker("n2", NodeAddress::new("w2", 7002)),
    ]);
    let (mut coordinator, handler, connector) = coordinator(config);

    assert_eq!(coordinator.remote_hosts(), vec!["w1", "w2"]);
    coordinator.bootstrap().unwrap();

    let mut events = Vec::new();
    coordinator
        .wait_until_ready(Duration::from_secs(10), |event| events.push(event.clone()))
        .unwrap();

    let pending: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            BootstrapEvent::ServerUp { pending, .. } => Some(*pending),
            BootstrapEvent::Ready => None,
        })
        .collect();
    assert_eq!(pending, vec![2, 1, 0]);
    assert_eq!(events.last(), Some(&BootstrapEvent::Ready));

    assert_eq!(coordinator.monitored_hosts(), vec!["w1", "w2"]);
    let mut hosts: Vec<&String> = coordinator.clients().keys().collect();
    hosts.sort();
    assert_eq!(hosts, vec!["ctl", "w1", "w2"]);

    let mut connected = connector.connected.lock().clone();
    connected.sort();
    assert_eq!(connected, vec!["w1", "w2"]);

    // Bootstrap processor removed once ready
    assert!(!handler.is_bootstrapping());

    coordinator.shutdown();
    handler.wait().unwrap();
}

#[test]
fn test_silent_switch_times_out() {
    let mut config = local_config(vec![Node::worker("n1", NodeAddress::new("localhost", 7001))]);
    config.commands.node = "echo booting; exec sleep 30".into();
    config.commands.switch = "exec sleep 30".into();
    let (mut coordinator, handler, _) = coordinator(config);

    assert!(coordinator.remote_hosts().is_empty());
    coordinator.bootstrap().unwrap();

    match coordinator.wait_until_ready(Duration::from_millis(300), |_| {}) {
        Err(SlicerError::ReadinessTimeout { .. }) => {}
        other => panic!("expected ReadinessTimeout, got {:?}", other),
    }
    assert!(handler.is_bootstrapping());

    coordinator.shutdown();
    handler.wait().unwrap();
}

#[test]
fn test_slicer_exit_aborts_bootstrap_with_log() {
    let mut config = local_config(vec![Node::worker("n1", NodeAddress::new("w1", 7001))]);
    config.commands.slicer = "echo 'java.net.BindException: Address already in use'; exit 3".into();
    let (mut coordinator, handler, connector) = coordinator(config);

    match coordinator.bootstrap() {
        Err(e @ SlicerError::NodeExited { .. }) => {
            assert!(e.log_context().unwrap().contains("BindException"));
        }
        other => panic!("expected NodeExited, got {:?}", other),
    }
    assert!(connector.connected.lock().is_empty());

    coordinator.shutdown();
    handler.wait().unwrap();
}

#[test]
fn test_control_server_round_trip() {
    let mut config = ClusterConfig::new(Vec::new(), NodeAddress::new("localhost", 7000));
    config.local_host = "ctl".into();
    let config = Arc::new(config);

    let handler = LocalNodeHandler::new(
        "ctl",
        Arc::clone(&config),
        Arc::new(HttpConnector::new(Duration::from_secs(2))),
    )
    .unwrap();
    let (tx, rx) = unbounded();
    handler.declare_master(BootstrapTracker::new(
        0,
        LinePattern::literal(SERVER_READY_SENTINEL).unwrap(),
        tx,
    ));

    let target: Arc<dyn RemoteClient> = Arc::new(handler.clone());
    let server = ControlServer::bind(SocketAddr::from(([127, 0, 0, 1], 0)), target).unwrap();
    let addr = NodeAddress::new("127.0.0.1", server.local_addr().port());

    let client = ControlClient::connect(&addr, Duration::from_secs(2)).unwrap();
    client
        .receive_log(LogLine::new("ctl/switch", "Starting Cumulus Server"))
        .unwrap();
    assert!(matches!(
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        BootstrapEvent::ServerUp { pending: 0, .. }
    ));
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), BootstrapEvent::Ready);

    // No client source configured: the remote error comes back as RpcError::Remote
    assert!(matches!(client.start_client(), Err(RpcError::Remote(_))));

    // Malformed bodies and unknown operations are refused by the router
    let http = reqwest::blocking::Client::new();
    let base = format!("http://{}", server.local_addr());
    let reply = http
        .post(format!("{}/receive_log", base))
        .header("content-type", "application/json")
        .body("not json")
        .send()
        .unwrap();
    assert!(reply.status().is_client_error());
    let reply = http.post(format!("{}/restart", base)).send().unwrap();
    assert_eq!(reply.status(), reqwest::StatusCode::NOT_FOUND);

    client.shutdown().unwrap();
    handler.wait().unwrap();
}

#[test]
fn test_unreachable_control_port() {
    // Bind then drop to get a port nobody listens on
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let addr = NodeAddress::new("127.0.0.1", port);
    let result = ControlClient::connect(&addr, Duration::from_millis(500));
    assert!(matches!(result, Err(RpcError::ConnectFailed { .. })));
}

#[test]
fn test_plan_descriptor_round_trip() {
    let dir = tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.json");
    std::fs::write(
        &catalog_path,
        r#"{
            "maps": [
                {"name": "bids", "arity": 2},
                {"name": "asks", "arity": 1},
                {"name": "total", "arity": 0}
            ],
            "templates": ["bids[p][v] += 1", "total += v"]
        }"#,
    )
    .unwrap();
    let catalog = MapCatalog::load(&catalog_path).unwrap();

    let nodes = vec![
        Node::parse_definition("n1=w1:7001").unwrap(),
        Node::parse_definition("n2=w2:7002").unwrap(),
        Node::parse_definition("n3=w3:7003").unwrap(),
    ];
    let planner = PartitionPlanner::new(nodes)
        .default_domain(16)
        .domain("asks", 9)
        .directive(PartitionDirective::parse("bids:1").unwrap())
        .directive(PartitionDirective::parse("asks:0=n3@0::2,n1@3::5,n2@6::8").unwrap());

    let ops = vec!["insert bids 1 2".into()];
    let descriptor = build_descriptor(&planner, &catalog, ops, true).unwrap();

    let out = dir.path().join("deploy.txt");
    let mut file = std::fs::File::create(&out).unwrap();
    descriptor.write_to(&mut file).unwrap();
    drop(file);

    let text = std::fs::read_to_string(&out).unwrap();
    assert!(text.contains("template 2 total += v"));
    assert!(text.contains("partition Map bids[0::15,0::5]"));
    assert!(text.ends_with("update insert bids 1 2\npersist\n"));

    let (nodes, table) = DeploymentDescriptor::parse_partitions(&text).unwrap();
    assert_eq!(nodes, vec!["n1", "n2", "n3"]);
    assert_eq!(table, descriptor.partitions);
    assert_eq!(DeploymentDescriptor::parse(&text).unwrap(), descriptor);
}

#[test]
fn test_multi_line_template_is_rejected_before_writing() {
    let dir = tempdir().unwrap();
    let catalog_path = dir.path().join("catalog.json");
    std::fs::write(
        &catalog_path,
        r#"{
            "maps": [{"name": "total", "arity": 0}],
            "templates": ["total += v\npersist"]
        }"#,
    )
    .unwrap();
    let catalog = MapCatalog::load(&catalog_path).unwrap();

    let nodes = vec![Node::parse_definition("n1=w1:7001").unwrap()];
    let planner = PartitionPlanner::new(nodes).default_domain(4);

    match build_descriptor(&planner, &catalog, Vec::new(), false) {
        Err(ConfigError::MultiLineEntry { kind, index }) => {
            assert_eq!((kind, index), ("Template", 1));
        }
        other => panic!("expected MultiLineEntry, got {:?}", other.map(|_| ())),
    }
}
