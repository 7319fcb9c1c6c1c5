//! Key-space partitioning
//!
//! Every map key position has the integer domain `0..=size-1`. A
//! partition is a box: one inclusive range per key position. Splitting a
//! map on one key position gives each node a contiguous slice of that
//! position and the full domain of the others; a map without a directive
//! is replicated, one full box per node.

use crate::error::{ConfigError, ConfigResult};
use crate::node::Node;
use crate::planner::catalog::MapCatalog;
use crate::planner::DEFAULT_KEY_DOMAIN;
use std::collections::BTreeMap;
use std::fmt;

/// Inclusive key range
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KeyRange {
    pub lo: u64,
    pub hi: u64,
}

impl KeyRange {
    pub fn new(lo: u64, hi: u64) -> Self {
        Self { lo, hi }
    }

    /// The whole domain of `size` keys
    pub fn full(size: u64) -> Self {
        Self::new(0, size.saturating_sub(1))
    }

    /// Number of keys covered, saturating for `0::u64::MAX`
    pub fn width(&self) -> u64 {
        (self.hi - self.lo).saturating_add(1)
    }

    /// Parse `lo::hi`
    pub fn parse(value: &str) -> Option<Self> {
        let (lo, hi) = value.trim().split_once("::")?;
        let lo = lo.trim().parse().ok()?;
        let hi = hi.trim().parse().ok()?;
        (lo <= hi).then(|| Self::new(lo, hi))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.lo, self.hi)
    }
}

/// How one map is split
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionDirective {
    /// Equal-width split of key position `key` across all nodes
    Split { map: String, key: usize },

    /// Explicit ranges of key position `key`
    Explicit {
        map: String,
        key: usize,
        ranges: Vec<(String, KeyRange)>,
    },
}

impl PartitionDirective {
    /// Parse `map:key` or `map:key=node@lo::hi,node@lo::hi,...`
    pub fn parse(value: &str) -> ConfigResult<Self> {
        let invalid = |reason: &str| ConfigError::InvalidDirective {
            value: value.to_string(),
            reason: reason.to_string(),
        };

        let (head, assignments) = match value.split_once('=') {
            Some((head, rest)) => (head, Some(rest)),
            None => (value, None),
        };

        let (map, key) = head.split_once(':').ok_or_else(|| invalid("expected map:key"))?;
        let map = map.trim();
        if map.is_empty() {
            return Err(invalid("empty map name"));
        }
        let key = key
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid("key position must be a number"))?;

        let Some(assignments) = assignments else {
            return Ok(PartitionDirective::Split {
                map: map.to_string(),
                key,
            });
        };

        let ranges = assignments
            .split(',')
            .map(|part| {
                let (node, range) = part
                    .split_once('@')
                    .ok_or_else(|| invalid("expected node@lo::hi"))?;
                let range = KeyRange::parse(range)
                    .ok_or_else(|| invalid("expected lo::hi with lo <= hi"))?;
                Ok((node.trim().to_string(), range))
            })
            .collect::<ConfigResult<Vec<_>>>()?;

        if ranges.is_empty() {
            return Err(invalid("no ranges"));
        }

        Ok(PartitionDirective::Explicit {
            map: map.to_string(),
            key,
            ranges,
        })
    }

    pub fn map(&self) -> &str {
        match self {
            PartitionDirective::Split { map, .. } | PartitionDirective::Explicit { map, .. } => map,
        }
    }

    pub fn key(&self) -> usize {
        match self {
            PartitionDirective::Split { key, .. } => *key,
            PartitionDirective::Explicit { key, .. } => *key,
        }
    }
}

/// One node's share of a map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub node: String,

    /// One range per key position
    pub ranges: Vec<KeyRange>,
}

/// Partitions per map
pub type PartitionTable = BTreeMap<String, Vec<Partition>>;

/// Computes partition tables
#[derive(Debug, Clone)]
pub struct PartitionPlanner {
    nodes: Vec<Node>,
    default_domain: u64,
    domains: BTreeMap<String, u64>,
    directives: BTreeMap<String, PartitionDirective>,
    ignore_keys: bool,
}

impl PartitionPlanner {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            default_domain: DEFAULT_KEY_DOMAIN,
            domains: BTreeMap::new(),
            directives: BTreeMap::new(),
            ignore_keys: false,
        }
    }

    /// Domain size for maps without an override
    pub fn default_domain(mut self, size: u64) -> Self {
        self.default_domain = size;
        self
    }

    /// Domain size for one map
    pub fn domain(mut self, map: impl Into<String>, size: u64) -> Self {
        self.domains.insert(map.into(), size);
        self
    }

    /// Add a directive; a later directive for the same map replaces the earlier one
    pub fn directive(mut self, directive: PartitionDirective) -> Self {
        self.directives.insert(directive.map().to_string(), directive);
        self
    }

    /// Replicate every map regardless of directives
    pub fn ignore_keys(mut self, ignore: bool) -> Self {
        self.ignore_keys = ignore;
        self
    }

    /// Parse a `map=size` domain override
    pub fn parse_domain(value: &str) -> ConfigResult<(String, u64)> {
        let invalid = |reason: &str| ConfigError::InvalidDirective {
            value: value.to_string(),
            reason: reason.to_string(),
        };
        let (map, size) = value.split_once('=').ok_or_else(|| invalid("expected map=size"))?;
        let size = size.trim().parse().map_err(|_| invalid("size must be a number"))?;
        Ok((map.trim().to_string(), size))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn domain_of(&self, map: &str) -> u64 {
        self.domains.get(map).copied().unwrap_or(self.default_domain)
    }

    fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.name == name)
    }

    /// Compute the partition table for every map in `catalog`
    pub fn plan(&self, catalog: &MapCatalog) -> ConfigResult<PartitionTable> {
        if self.nodes.is_empty() {
            return Err(ConfigError::NoNodes);
        }

        for directive in self.directives.values() {
            let map = catalog.map(directive.map()).ok_or_else(|| ConfigError::UnknownMap {
                map: directive.map().to_string(),
            })?;
            if directive.key() >= map.arity {
                return Err(ConfigError::InvalidDirective {
                    value: format!("{}:{}", map.name, directive.key()),
                    reason: format!("map has {} key position(s)", map.arity),
                });
            }
            if let PartitionDirective::Explicit { ranges, .. } = directive {
                for (node, _) in ranges {
                    if self.node_index(node).is_none() {
                        return Err(ConfigError::UnknownNode {
                            node: node.clone(),
                            context: format!("partition directive for map '{}'", map.name),
                        });
                    }
                }
            }
        }
        for map in self.domains.keys() {
            if catalog.map(map).is_none() {
                return Err(ConfigError::UnknownMap { map: map.clone() });
            }
        }

        let mut table = PartitionTable::new();
        for map in &catalog.maps {
            let size = self.domain_of(&map.name);
            if size == 0 {
                return Err(ConfigError::InvalidDomain {
                    map: map.name.clone(),
                    size,
                    nodes: self.nodes.len(),
                });
            }

            let full = vec![KeyRange::full(size); map.arity];
            let directive = self.directives.get(&map.name).filter(|_| !self.ignore_keys);

            let partitions = match directive {
                None => self
                    .nodes
                    .iter()
                    .map(|node| Partition {
                        node: node.name.clone(),
                        ranges: full.clone(),
                    })
                    .collect(),
                Some(PartitionDirective::Split { key, .. }) => {
                    let slices = split_evenly(&map.name, size, self.nodes.len())?;
                    self.nodes
                        .iter()
                        .zip(slices)
                        .map(|(node, slice)| {
                            let mut ranges = full.clone();
                            ranges[*key] = slice;
                            Partition {
                                node: node.name.clone(),
                                ranges,
                            }
                        })
                        .collect()
                }
                Some(PartitionDirective::Explicit { key, ranges, .. }) => {
                    check_cover(&map.name, size, ranges)?;
                    let mut assigned: Vec<(usize, KeyRange, &str)> = ranges
                        .iter()
                        .filter_map(|(node, range)| {
                            self.node_index(node).map(|i| (i, *range, node.as_str()))
                        })
                        .collect();
                    assigned.sort();
                    assigned
                        .into_iter()
                        .map(|(_, slice, node)| {
                            let mut ranges = full.clone();
                            ranges[*key] = slice;
                            Partition {
                                node: node.to_string(),
                                ranges,
                            }
                        })
                        .collect()
                }
            };

            table.insert(map.name.clone(), partitions);
        }

        Ok(table)
    }
}

/// `nodes` contiguous slices of `0..size`; the first `size % nodes` get one extra key
fn split_evenly(map: &str, size: u64, nodes: usize) -> ConfigResult<Vec<KeyRange>> {
    let n = nodes as u64;
    if size < n {
        return Err(ConfigError::InvalidDomain {
            map: map.to_string(),
            size,
            nodes,
        });
    }

    let base = size / n;
    let extra = size % n;
    let mut start = 0;
    Ok((0..n)
        .map(|i| {
            let len = base + u64::from(i < extra);
            let range = KeyRange::new(start, start + len - 1);
            start += len;
            range
        })
        .collect())
}

/// Explicit ranges must cover `0..size` exactly once
fn check_cover(map: &str, size: u64, ranges: &[(String, KeyRange)]) -> ConfigResult<()> {
    let invalid = |reason: String| ConfigError::InvalidPartition {
        map: map.to_string(),
        reason,
    };

    let mut sorted: Vec<KeyRange> = ranges.iter().map(|(_, r)| *r).collect();
    sorted.sort();

    if let Some(range) = sorted.iter().find(|r| r.hi >= size) {
        return Err(invalid(format!(
            "range {} is outside the domain of {} keys",
            range, size
        )));
    }

    // Every hi < size, so hi + 1 cannot overflow
    let mut next = 0u64;
    for range in &sorted {
        if range.lo < next {
            return Err(invalid(format!("range {} overlaps another range", range)));
        }
        if range.lo > next {
            return Err(invalid(format!("keys {}::{} are not assigned", next, range.lo - 1)));
        }
        next = range.hi + 1;
    }

    if next != size {
        return Err(invalid(format!(
            "ranges end at {} but the domain has {} keys",
            next, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeAddress;
    use crate::planner::catalog::MapInfo;

    fn nodes(names: &[&str]) -> Vec<Node> {
        names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                Node::worker(*name, NodeAddress::new(format!("w{}", i), 7000 + i as u16))
            })
            .collect()
    }

    fn catalog() -> MapCatalog {
        MapCatalog {
            maps: vec![
                MapInfo { name: "q".into(), arity: 2 },
                MapInfo { name: "total".into(), arity: 0 },
            ],
            templates: Vec::new(),
        }
    }

    #[test]
    fn test_parse_directive() {
        assert_eq!(
            PartitionDirective::parse("q:1").unwrap(),
            PartitionDirective::Split { map: "q".into(), key: 1 }
        );
        assert_eq!(
            PartitionDirective::parse("q:0=n1@0::4,n2@5::9").unwrap(),
            PartitionDirective::Explicit {
                map: "q".into(),
                key: 0,
                ranges: vec![
                    ("n1".into(), KeyRange::new(0, 4)),
                    ("n2".into(), KeyRange::new(5, 9)),
                ],
            }
        );
        assert!(PartitionDirective::parse("q").is_err());
        assert!(PartitionDirective::parse("q:x").is_err());
        assert!(PartitionDirective::parse("q:0=n1@5::4").is_err());
        assert!(PartitionDirective::parse("q:0=n1").is_err());
    }

    #[test]
    fn test_no_directive_replicates() {
        let table = PartitionPlanner::new(nodes(&["n1", "n2", "n3"]))
            .default_domain(10)
            .plan(&catalog())
            .unwrap();

        let q = &table["q"];
        assert_eq!(q.len(), 3);
        for partition in q {
            assert_eq!(partition.ranges, vec![KeyRange::new(0, 9), KeyRange::new(0, 9)]);
        }
        assert_eq!(table["total"].len(), 3);
        assert!(table["total"][0].ranges.is_empty());
    }

    #[test]
    fn test_even_split_covers_domain() {
        let table = PartitionPlanner::new(nodes(&["n1", "n2", "n3"]))
            .domain("q", 10)
            .directive(PartitionDirective::parse("q:1").unwrap())
            .plan(&catalog())
            .unwrap();

        let slices: Vec<KeyRange> = table["q"].iter().map(|p| p.ranges[1]).collect();
        assert_eq!(
            slices,
            vec![KeyRange::new(0, 3), KeyRange::new(4, 6), KeyRange::new(7, 9)]
        );
        assert!(table["q"].iter().all(|p| p.ranges[0] == KeyRange::new(0, 9)));
        assert_eq!(slices.iter().map(|r| r.width()).sum::<u64>(), 10);
    }

    #[test]
    fn test_explicit_ranges_sorted_by_node() {
        let table = PartitionPlanner::new(nodes(&["n1", "n2"]))
            .domain("q", 10)
            .directive(PartitionDirective::parse("q:0=n2@0::2,n1@6::9,n2@3::5").unwrap())
            .plan(&catalog())
            .unwrap();

        let assigned: Vec<(&str, KeyRange)> =
            table["q"].iter().map(|p| (p.node.as_str(), p.ranges[0])).collect();
        assert_eq!(
            assigned,
            vec![
                ("n1", KeyRange::new(6, 9)),
                ("n2", KeyRange::new(0, 2)),
                ("n2", KeyRange::new(3, 5)),
            ]
        );
    }

    #[test]
    fn test_explicit_ranges_must_cover_once() {
        let planner = |directive: &str| {
            PartitionPlanner::new(nodes(&["n1", "n2"]))
                .domain("q", 10)
                .directive(PartitionDirective::parse(directive).unwrap())
                .plan(&catalog())
        };

        assert!(matches!(
            planner("q:0=n1@0::5,n2@5::9"),
            Err(ConfigError::InvalidPartition { .. })
        ));
        assert!(matches!(
            planner("q:0=n1@0::3,n2@5::9"),
            Err(ConfigError::InvalidPartition { .. })
        ));
        assert!(matches!(
            planner("q:0=n1@0::4,n2@5::8"),
            Err(ConfigError::InvalidPartition { .. })
        ));
        assert!(planner("q:0=n1@0::4,n2@5::9").is_ok());
    }

    #[test]
    fn test_explicit_range_beyond_domain() {
        let result = PartitionPlanner::new(nodes(&["n1", "n2"]))
            .domain("q", 10)
            .directive(PartitionDirective::parse(&format!("q:0=n1@0::{}", u64::MAX)).unwrap())
            .plan(&catalog());
        assert!(matches!(
            result,
            Err(ConfigError::InvalidPartition { reason, .. }) if reason.contains("outside")
        ));

        let result = PartitionPlanner::new(nodes(&["n1", "n2"]))
            .domain("q", 10)
            .directive(PartitionDirective::parse("q:0=n1@0::4,n2@5::10").unwrap())
            .plan(&catalog());
        assert!(matches!(result, Err(ConfigError::InvalidPartition { .. })));

        assert_eq!(KeyRange::new(0, u64::MAX).width(), u64::MAX);
        assert_eq!(KeyRange::new(3, 3).width(), 1);
    }

    #[test]
    fn test_configuration_errors() {
        let catalog = catalog();

        let unknown_node = PartitionPlanner::new(nodes(&["n1"]))
            .directive(PartitionDirective::parse("q:0=n9@0::1023").unwrap())
            .plan(&catalog);
        assert!(matches!(unknown_node, Err(ConfigError::UnknownNode { node, .. }) if node == "n9"));

        let unknown_map = PartitionPlanner::new(nodes(&["n1"]))
            .directive(PartitionDirective::parse("nope:0").unwrap())
            .plan(&catalog);
        assert!(matches!(unknown_map, Err(ConfigError::UnknownMap { .. })));

        let bad_key = PartitionPlanner::new(nodes(&["n1"]))
            .directive(PartitionDirective::parse("q:2").unwrap())
            .plan(&catalog);
        assert!(matches!(bad_key, Err(ConfigError::InvalidDirective { .. })));

        let too_small = PartitionPlanner::new(nodes(&["n1", "n2", "n3"]))
            .domain("q", 2)
            .directive(PartitionDirective::parse("q:0").unwrap())
            .plan(&catalog);
        assert!(matches!(too_small, Err(ConfigError::InvalidDomain { .. })));

        assert!(matches!(
            PartitionPlanner::new(Vec::new()).plan(&catalog),
            Err(ConfigError::NoNodes)
        ));
    }

    #[test]
    fn test_ignore_keys() {
        let table = PartitionPlanner::new(nodes(&["n1", "n2"]))
            .default_domain(8)
            .directive(PartitionDirective::parse("q:0").unwrap())
            .ignore_keys(true)
            .plan(&catalog())
            .unwrap();
        assert!(table["q"].iter().all(|p| p.ranges[0] == KeyRange::full(8)));
    }

    #[test]
    fn test_parse_domain() {
        assert_eq!(PartitionPlanner::parse_domain("q=64").unwrap(), ("q".to_string(), 64));
        assert!(PartitionPlanner::parse_domain("q").is_err());
    }
}
