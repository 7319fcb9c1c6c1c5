//! cumulus-slicer - cluster bootstrap and partition planning
//!
//! Entry point for the CLI application.

use anyhow::{Context, Result};
use clap::Parser;
use cumulus_slicer::cluster::{
    ClusterMonitor, HostReport, LocalNodeHandler, MonitorOptions, MonitorReport, PrimaryCoordinator,
};
use cumulus_slicer::config::{CliArgs, ClusterConfig, Command, SLICER_READY_SENTINEL};
use cumulus_slicer::error::{ConfigError, PollFailure};
use cumulus_slicer::node::Node;
use cumulus_slicer::planner::{
    build_descriptor, read_test_sequence, DeploymentDescriptor, MapCatalog, PartitionDirective,
    PartitionPlanner,
};
use cumulus_slicer::progress::{
    print_header, print_maps, print_plan_summary, print_report, BootstrapProgress,
};
use cumulus_slicer::rpc::{Connector, ControlServer, HttpConnector, RemoteClient};
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse();

    setup_logging(args.verbose, args.quiet)?;

    match args.command {
        Command::Plan {
            catalog,
            output,
            cluster,
            nodes,
            partitions,
            domains,
            default_domain,
            test,
            persist,
            ignore_keys,
        } => run_plan(PlanRequest {
            catalog,
            output,
            cluster,
            nodes,
            partitions,
            domains,
            default_domain,
            test,
            persist,
            ignore_keys,
        }),
        Command::Bootstrap {
            config,
            ready_timeout,
        } => run_bootstrap(&config, ready_timeout, args.quiet),
        Command::Serve { config, port } => run_serve(&config, port),
        Command::Status { config } => run_status(&config),
    }
}

/// Options of the `plan` subcommand
struct PlanRequest {
    catalog: PathBuf,
    output: Option<PathBuf>,
    cluster: Option<PathBuf>,
    nodes: Vec<String>,
    partitions: Vec<String>,
    domains: Vec<String>,
    default_domain: u64,
    test: Option<PathBuf>,
    persist: bool,
    ignore_keys: bool,
}

fn run_plan(request: PlanRequest) -> Result<()> {
    let catalog = MapCatalog::load(&request.catalog).context("Failed to load map catalog")?;

    let mut nodes = match &request.cluster {
        Some(path) => {
            ClusterConfig::load(path)
                .context("Failed to load cluster configuration")?
                .nodes
        }
        None => Vec::new(),
    };
    for definition in &request.nodes {
        nodes.push(Node::parse_definition(definition)?);
    }
    let mut names = HashSet::new();
    for node in &nodes {
        if !names.insert(node.name.clone()) {
            return Err(ConfigError::DuplicateNode {
                name: node.name.clone(),
            }
            .into());
        }
    }
    let node_count = nodes.len();

    let mut planner = PartitionPlanner::new(nodes)
        .default_domain(request.default_domain)
        .ignore_keys(request.ignore_keys);
    for domain in &request.domains {
        let (map, size) = PartitionPlanner::parse_domain(domain)?;
        planner = planner.domain(map, size);
    }
    for partition in &request.partitions {
        planner = planner.directive(PartitionDirective::parse(partition)?);
    }

    let test_sequence = match &request.test {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read test sequence {}", path.display()))?;
            read_test_sequence(&text)
        }
        None => Vec::new(),
    };

    let descriptor = build_descriptor(&planner, &catalog, test_sequence, request.persist)
        .context("Partition planning failed")?;

    match &request.output {
        Some(path) => {
            print_maps(&catalog);
            write_descriptor(path, &descriptor)?;
            let path = path.display().to_string();
            print_plan_summary(&descriptor.partitions, node_count, Some(&path));
        }
        None => {
            let stdout = io::stdout();
            descriptor
                .write_to(&mut stdout.lock())
                .context("Failed to write descriptor")?;
        }
    }

    Ok(())
}

/// Write the descriptor, removing the file again if writing fails
fn write_descriptor(path: &Path, descriptor: &DeploymentDescriptor) -> Result<()> {
    let written = File::create(path).and_then(|mut file| {
        descriptor.write_to(&mut file)?;
        file.sync_all()
    });

    if let Err(e) = written {
        let _ = std::fs::remove_file(path);
        return Err(e).with_context(|| format!("Failed to write {}", path.display()));
    }

    info!(path = %path.display(), "Descriptor written");
    Ok(())
}

fn load_config(path: &Path) -> Result<ClusterConfig> {
    ClusterConfig::load(path)
        .with_context(|| format!("Invalid cluster configuration {}", path.display()))
}

fn start_handler(
    config: &Arc<ClusterConfig>,
    connector: &Arc<dyn Connector>,
) -> Result<LocalNodeHandler> {
    LocalNodeHandler::new(config.local_host.clone(), Arc::clone(config), Arc::clone(connector))
        .context("Failed to start node handler")
}

fn run_bootstrap(path: &Path, ready_timeout: Option<u64>, quiet: bool) -> Result<()> {
    let mut config = load_config(path)?;
    if let Some(secs) = ready_timeout {
        config.readiness_timeout_secs = secs.max(1);
    }
    let config = Arc::new(config);

    let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(config.poll_timeout()));
    let handler = start_handler(&config, &connector)?;

    // Remote slicers connect back here to forward their logs
    let _server = if config.remote_hosts().is_empty() {
        None
    } else {
        let target: Arc<dyn RemoteClient> = Arc::new(handler.clone());
        let addr = SocketAddr::from(([0, 0, 0, 0], config.control_port));
        Some(ControlServer::bind(addr, target).context("Failed to bind control port")?)
    };

    if !quiet {
        print_header(
            "Bootstrap",
            &format!("{} worker(s), switch {}", config.worker_count(), config.switch),
        );
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        flag.store(true, Ordering::SeqCst);
    })
    .context("Failed to set signal handler")?;

    let mut coordinator = PrimaryCoordinator::new(Arc::clone(&config), handler.clone(), connector)
        .with_reporter(Arc::new(|report: &MonitorReport| print_report(report)));

    if let Err(e) = coordinator.bootstrap() {
        coordinator.shutdown();
        return Err(e).context("Bootstrap failed");
    }

    let progress = (!quiet).then(|| BootstrapProgress::new(config.worker_count() + 1));
    let ready = coordinator.wait_until_ready(config.readiness_timeout(), |event| {
        if let Some(p) = &progress {
            p.update(event);
        }
    });

    match ready {
        Ok(()) => {
            if let Some(p) = &progress {
                p.finish("Cluster ready");
            }
        }
        Err(e) => {
            if let Some(p) = &progress {
                p.finish_and_clear();
            }
            if let Some(log) = e.log_context() {
                eprintln!("{}", log);
            }
            coordinator.shutdown();
            return Err(e).context("Cluster did not become ready");
        }
    }

    info!(hosts = ?coordinator.monitored_hosts(), "Monitoring cluster, Ctrl-C to stop");
    while !shutdown.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    coordinator.shutdown();
    handler.wait().context("Node handler failed")?;
    Ok(())
}

fn run_serve(path: &Path, port: Option<u16>) -> Result<()> {
    let config = Arc::new(load_config(path)?);
    let port = port.unwrap_or(config.control_port);

    let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(config.poll_timeout()));
    let handler = LocalNodeHandler::new(machine_hostname(), Arc::clone(&config), connector)
        .context("Failed to start node handler")?;

    let target: Arc<dyn RemoteClient> = Arc::new(handler.clone());
    let server = ControlServer::bind(SocketAddr::from(([0, 0, 0, 0], port)), target)
        .with_context(|| format!("Failed to bind control port {}", port))?;

    let interrupted = handler.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupt received, shutting down...");
        if let Err(e) = interrupted.shutdown() {
            warn!(error = %e, "Shutdown failed");
        }
    })
    .context("Failed to set signal handler")?;

    // The coordinator's node manager waits for this line
    println!("{}", SLICER_READY_SENTINEL);
    io::stdout().flush()?;
    info!(addr = %server.local_addr(), "Serving");

    handler.wait().context("Node handler failed")?;
    drop(server);
    Ok(())
}

fn run_status(path: &Path) -> Result<()> {
    let config = Arc::new(load_config(path)?);
    let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(config.poll_timeout()));

    let local = start_handler(&config, &connector)?;

    let mut clients: Vec<(String, Arc<dyn RemoteClient>)> = Vec::new();
    let mut unreachable = Vec::new();
    for host in config.hosts() {
        if config.is_local(&host) {
            let client: Arc<dyn RemoteClient> = Arc::new(local.clone());
            clients.push((host, client));
            continue;
        }
        match connector.connect(&config.control_address(&host)) {
            Ok(client) => clients.push((host, client)),
            Err(e) => unreachable.push(HostReport {
                outcome: Err(PollFailure::Failed {
                    host: host.clone(),
                    reason: e.to_string(),
                }),
                host,
            }),
        }
    }

    let mut report = ClusterMonitor::collect_once(clients, MonitorOptions::from_config(&config))
        .context("Status poll failed")?;
    report.hosts.extend(unreachable);
    print_report(&report);

    local.shutdown()?;
    Ok(())
}

fn machine_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

fn setup_logging(verbose: bool, quiet: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("cumulus_slicer=debug,warn")
    } else if quiet {
        EnvFilter::new("cumulus_slicer=warn,warn")
    } else {
        EnvFilter::new("cumulus_slicer=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
