//! Deployment descriptor consumed by worker processes
//!
//! ```text
//!
//!
//! ############ Put Templates
//! template 1 <text>
//!
//!
//! ############ Node Definitions
//! node n1
//! partition Map q[0::4,0::9]
//!
//!
//! ############ Test Sequence
//! update <op>
//! persist
//! ```

use crate::error::{ConfigError, ConfigResult};
use crate::planner::partition::{KeyRange, Partition, PartitionTable};
use std::fmt::Write as _;
use std::io::{self, Write};

const TEMPLATES_HEADER: &str = "############ Put Templates";
const NODES_HEADER: &str = "############ Node Definitions";
const TESTS_HEADER: &str = "############ Test Sequence";

/// Everything a worker needs to join the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentDescriptor {
    /// Trigger templates, numbered from 1 in the output
    pub templates: Vec<String>,

    /// Node names in definition order
    pub nodes: Vec<String>,

    pub partitions: PartitionTable,

    /// Update operations replayed after startup
    pub test_sequence: Vec<String>,

    /// Persist state after the test sequence
    pub persist: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Preamble,
    Templates,
    Nodes,
    Tests,
}

impl DeploymentDescriptor {
    /// Render the descriptor text
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = write!(out, "\n\n{}\n", TEMPLATES_HEADER);
        for (i, template) in self.templates.iter().enumerate() {
            let _ = writeln!(out, "template {} {}", i + 1, template);
        }

        let _ = write!(out, "\n\n{}\n", NODES_HEADER);
        for node in &self.nodes {
            let _ = writeln!(out, "node {}", node);
            for (map, partitions) in &self.partitions {
                for partition in partitions.iter().filter(|p| &p.node == node) {
                    let ranges: Vec<String> =
                        partition.ranges.iter().map(|r| r.to_string()).collect();
                    let _ = writeln!(out, "partition Map {}[{}]", map, ranges.join(","));
                }
            }
        }

        let _ = write!(out, "\n\n{}\n", TESTS_HEADER);
        for op in &self.test_sequence {
            let _ = writeln!(out, "update {}", op);
        }
        if self.persist {
            out.push_str("persist\n");
        }

        out
    }

    /// Check that every template and update fits on one line
    ///
    /// Entries are written verbatim, so a line break would split them.
    pub fn validate(&self) -> ConfigResult<()> {
        let entries = self
            .templates
            .iter()
            .enumerate()
            .map(|(i, t)| ("Template", i + 1, t))
            .chain(self.test_sequence.iter().enumerate().map(|(i, op)| ("Update", i + 1, op)));
        for (kind, index, text) in entries {
            if text.contains(['\n', '\r']) {
                return Err(ConfigError::MultiLineEntry { kind, index });
            }
        }
        Ok(())
    }

    /// Write the rendered descriptor
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(self.render().as_bytes())?;
        writer.flush()
    }

    /// Parse descriptor text
    pub fn parse(text: &str) -> ConfigResult<Self> {
        let mut descriptor = Self::default();
        let mut section = Section::Preamble;
        let mut current: Option<String> = None;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            // Templates and updates are kept verbatim; only the line
            // terminator is stripped
            let line = raw.strip_suffix('\r').unwrap_or(raw);
            let trimmed = line.trim();
            let malformed = |reason: String| ConfigError::MalformedDescriptor {
                line: line_no,
                reason,
            };

            if trimmed.is_empty() {
                continue;
            }
            match trimmed {
                TEMPLATES_HEADER => {
                    section = Section::Templates;
                    continue;
                }
                NODES_HEADER => {
                    section = Section::Nodes;
                    continue;
                }
                TESTS_HEADER => {
                    section = Section::Tests;
                    continue;
                }
                _ => {}
            }

            match section {
                Section::Preamble => {
                    return Err(malformed("content before the first section".into()));
                }
                Section::Templates => {
                    let rest = line
                        .strip_prefix("template ")
                        .ok_or_else(|| malformed("expected 'template <n> <text>'".into()))?;
                    let (number, template) = rest.split_once(' ').unwrap_or((rest, ""));
                    let expected = descriptor.templates.len() + 1;
                    if number.parse::<usize>().ok() != Some(expected) {
                        return Err(malformed(format!("expected template number {}", expected)));
                    }
                    descriptor.templates.push(template.to_string());
                }
                Section::Nodes => {
                    if let Some(name) = trimmed.strip_prefix("node ") {
                        let name = name.trim().to_string();
                        descriptor.nodes.push(name.clone());
                        current = Some(name);
                    } else if let Some(rest) = trimmed.strip_prefix("partition Map ") {
                        let node = current
                            .clone()
                            .ok_or_else(|| malformed("partition before any node".into()))?;
                        let (map, ranges) = parse_partition(rest)
                            .ok_or_else(|| malformed(format!("bad partition '{}'", rest)))?;
                        descriptor
                            .partitions
                            .entry(map)
                            .or_default()
                            .push(Partition { node, ranges });
                    } else {
                        return Err(malformed(format!("unexpected '{}'", trimmed)));
                    }
                }
                Section::Tests => {
                    if trimmed == "persist" {
                        descriptor.persist = true;
                    } else if let Some(op) = line.strip_prefix("update ") {
                        descriptor.test_sequence.push(op.to_string());
                    } else {
                        return Err(malformed(format!("unexpected '{}'", trimmed)));
                    }
                }
            }
        }

        Ok(descriptor)
    }

    /// Parse only the node and partition section
    pub fn parse_partitions(text: &str) -> ConfigResult<(Vec<String>, PartitionTable)> {
        let descriptor = Self::parse(text)?;
        Ok((descriptor.nodes, descriptor.partitions))
    }
}

/// `name[lo::hi,...]`
fn parse_partition(text: &str) -> Option<(String, Vec<KeyRange>)> {
    let (map, rest) = text.split_once('[')?;
    let inner = rest.strip_suffix(']')?;
    let map = map.trim();
    if map.is_empty() {
        return None;
    }

    let ranges = if inner.trim().is_empty() {
        Vec::new()
    } else {
        inner.split(',').map(KeyRange::parse).collect::<Option<Vec<_>>>()?
    };
    Some((map.to_string(), ranges))
}

/// Read a test sequence: one update operation per non-empty line
pub fn read_test_sequence(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
