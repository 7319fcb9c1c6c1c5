//! cumulus-slicer - Cluster Bootstrap for Distributed View Maintenance
//!
//! Launches and supervises the processes of a small cumulus cluster: one
//! worker per node holding a slice of every shared map, plus a switch that
//! routes updates between them. Also computes the partition plan the
//! workers load at startup.
//!
//! # Features
//!
//! - **Parallel Bootstrap**: A slicer is started on every remote host over
//!   ssh at the same time; the coordinator waits for each with a bounded
//!   readiness timeout.
//!
//! - **Log-Driven Readiness**: Process output streams back to the
//!   coordinator, which counts servers up until the cluster is ready.
//!
//! - **Isolated Monitoring**: Each host is polled on its own thread, so a
//!   slow or dead host never stalls the others.
//!
//! - **Partition Planning**: Equal-width or explicit key-range splits per
//!   map, written as a deployment descriptor.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Primary Coordinator                          │
//! │  ┌──────────────┐   ┌──────────────┐         ┌──────────────┐   │
//! │  │NodeManager w1│   │NodeManager w2│   ...   │ Local Handler│   │
//! │  │ ssh + buffer │   │ ssh + buffer │         │ inbox loop   │   │
//! │  └──────┬───────┘   └──────┬───────┘         └──────▲───────┘   │
//! │         │ ControlClient    │ ControlClient          │ receive_log│
//! └─────────┼──────────────────┼────────────────────────┼───────────┘
//!           ▼                  ▼                        │
//!   ┌───────────────┐  ┌───────────────┐                │
//!   │ slicer (w1)   │  │ slicer (w2)   │────────────────┘
//!   │ ControlServer │  │ ControlServer │   forwarded log lines
//!   │  node.sh      │  │  node.sh      │
//!   └───────────────┘  └───────────────┘
//!           ▲                  ▲
//!           └──── ClusterMonitor (poll_stats every interval) ────
//! ```
//!
//! # Example
//!
//! ```bash
//! # Compute a partition plan
//! cumulus-slicer plan catalog.json -n n1=w1:7001 -n n2=w2:7002 -p q:0 -o deploy.txt
//!
//! # Bring up the cluster described in cluster.json
//! cumulus-slicer bootstrap cluster.json
//! ```

pub mod cluster;
pub mod config;
pub mod error;
pub mod node;
pub mod planner;
pub mod process;
pub mod progress;
pub mod rpc;

pub use cluster::{ClusterMonitor, LocalNodeHandler, NodeManager, PrimaryCoordinator};
pub use config::{CliArgs, ClusterConfig};
pub use error::{Result, SlicerError};
pub use node::{Node, NodeAddress, NodeRole};
