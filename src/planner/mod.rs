//! Partition planning
//!
//! Turns the compiler's map catalog and the cluster's node list into a
//! partition table and the deployment descriptor the workers load.

pub mod catalog;
pub mod descriptor;
pub mod partition;

pub use catalog::{MapCatalog, MapInfo};
pub use descriptor::{read_test_sequence, DeploymentDescriptor};
pub use partition::{KeyRange, Partition, PartitionDirective, PartitionPlanner, PartitionTable};

use crate::error::ConfigResult;

/// Keys per key position when no domain is given
pub const DEFAULT_KEY_DOMAIN: u64 = 1024;

/// Plan `catalog` and assemble the descriptor
pub fn build_descriptor(
    planner: &PartitionPlanner,
    catalog: &MapCatalog,
    test_sequence: Vec<String>,
    persist: bool,
) -> ConfigResult<DeploymentDescriptor> {
    let partitions = planner.plan(catalog)?;
    let descriptor = DeploymentDescriptor {
        templates: catalog.templates.clone(),
        nodes: planner.nodes().iter().map(|n| n.name.clone()).collect(),
        partitions,
        test_sequence,
        persist,
    };
    descriptor.validate()?;
    Ok(descriptor)
}
