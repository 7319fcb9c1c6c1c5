//! Console output for the CLI
//!
//! Spinner while the cluster bootstraps, styled monitor reports and
//! plan summaries.

use crate::cluster::{BootstrapEvent, MonitorReport};
use crate::planner::{MapCatalog, PartitionTable};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Spinner showing how many servers are still pending
pub struct BootstrapProgress {
    bar: ProgressBar,
    total: usize,
}

impl BootstrapProgress {
    /// Create a spinner for `total` servers
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .expect("Invalid progress template")
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_message(format!("Waiting for {} server(s)", total));

        Self { bar, total }
    }

    /// Reflect a bootstrap event
    pub fn update(&self, event: &BootstrapEvent) {
        match event {
            BootstrapEvent::ServerUp { source, pending } => {
                self.bar.println(format!("  {} {}", style("up").green(), source));
                self.bar.set_message(format!(
                    "{}/{} servers up, waiting for {}",
                    self.total - pending,
                    self.total,
                    pending
                ));
            }
            BootstrapEvent::Ready => self.bar.set_message("All servers up"),
        }
    }

    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    pub fn finish_and_clear(&self) {
        self.bar.finish_and_clear();
    }
}

/// Print the banner shown before a command starts
pub fn print_header(command: &str, detail: &str) {
    println!();
    println!(
        "{} {}",
        style("cumulus-slicer").cyan().bold(),
        style(format!("v{}", env!("CARGO_PKG_VERSION"))).dim()
    );
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style(format!("{}:", command)).bold(), detail);
    println!();
}

/// Print one monitor cycle
pub fn print_report(report: &MonitorReport) {
    println!(
        "{} cycle {} at {}",
        style("Cluster status").bold(),
        report.cycle,
        report.timestamp.format("%H:%M:%S")
    );
    for host in &report.hosts {
        let line = host.render();
        if host.outcome.is_ok() {
            println!("  {} {}", style("●").green(), line);
        } else {
            println!("  {} {}", style("●").red(), style(line).yellow());
        }
    }
}

/// Print the `map : id` listing
pub fn print_maps(catalog: &MapCatalog) {
    println!("=========  Maps  ===========");
    for (name, id) in catalog.ids() {
        println!("{} : {}", name, id);
    }
}

/// Print a summary of a partition plan
pub fn print_plan_summary(table: &PartitionTable, nodes: usize, output: Option<&str>) {
    let partitions: usize = table.values().map(|p| p.len()).sum();

    println!();
    println!("{}", style("Plan Complete").green().bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {} {}", style("Maps:").bold(), table.len());
    println!("  {} {}", style("Nodes:").bold(), nodes);
    println!("  {} {}", style("Partitions:").bold(), partitions);
    if let Some(path) = output {
        println!("  {} {}", style("Descriptor:").bold(), path);
    }
    println!();
}
