//! Cluster bootstrap and supervision
//!
//! - `handler`: the per-member actor with its log inbox
//! - `bootstrap`: readiness counting
//! - `manager`: proxy for a slicer on a remote host
//! - `coordinator`: drives the bootstrap from the primary
//! - `monitor`: periodic process-table polling

pub mod bootstrap;
pub mod coordinator;
pub mod handler;
pub mod manager;
pub mod monitor;

pub use bootstrap::{BootstrapEvent, BootstrapState, BootstrapTracker};
pub use coordinator::PrimaryCoordinator;
pub use handler::{InboxMessage, LocalNodeHandler};
pub use manager::{ManagerSettings, NodeManager};
pub use monitor::{ClusterMonitor, HostReport, MonitorOptions, MonitorReport, ProcessStat, Reporter};
