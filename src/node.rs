//! Cluster members and their addresses

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Hostname or IP
    pub host: String,

    /// Port the member listens on
    pub port: u16,
}

impl NodeAddress {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a `host:port` string
    pub fn parse(value: &str) -> ConfigResult<Self> {
        let value = value.trim();
        let (host, port) = value.rsplit_once(':').ok_or_else(|| ConfigError::InvalidAddress {
            value: value.to_string(),
            reason: "expected host:port".into(),
        })?;

        if host.is_empty() {
            return Err(ConfigError::InvalidAddress {
                value: value.to_string(),
                reason: "empty host".into(),
            });
        }

        let port = port.parse::<u16>().map_err(|e| ConfigError::InvalidAddress {
            value: value.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// What a cluster member runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Worker process holding map partitions
    #[default]
    Worker,

    /// Rendezvous/switch process
    Switch,

    /// The controlling process itself
    Local,
}

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    /// Logical name (used in partition tables)
    pub name: String,

    /// Where the member's process listens
    #[serde(flatten)]
    pub address: NodeAddress,

    /// Role within the cluster
    #[serde(default)]
    pub role: NodeRole,
}

impl Node {
    /// Create a worker node
    pub fn worker(name: impl Into<String>, address: NodeAddress) -> Self {
        Self {
            name: name.into(),
            address,
            role: NodeRole::Worker,
        }
    }

    /// Create the switch node
    pub fn switch(address: NodeAddress) -> Self {
        Self {
            name: "switch".into(),
            address,
            role: NodeRole::Switch,
        }
    }

    /// Host this node runs on
    pub fn host(&self) -> &str {
        &self.address.host
    }

    /// Parse a `name=host:port` node definition
    pub fn parse_definition(value: &str) -> ConfigResult<Self> {
        let (name, address) = value.split_once('=').ok_or_else(|| ConfigError::InvalidAddress {
            value: value.to_string(),
            reason: "expected name=host:port".into(),
        })?;

        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::InvalidAddress {
                value: value.to_string(),
                reason: "empty node name".into(),
            });
        }

        Ok(Self::worker(name, NodeAddress::parse(address)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr = NodeAddress::parse("worker1.cluster:52982").unwrap();
        assert_eq!(addr.host, "worker1.cluster");
        assert_eq!(addr.port, 52982);
        assert_eq!(addr.to_string(), "worker1.cluster:52982");

        assert!(NodeAddress::parse("worker1").is_err());
        assert!(NodeAddress::parse(":80").is_err());
        assert!(NodeAddress::parse("host:99999").is_err());
    }

    #[test]
    fn test_parse_definition() {
        let node = Node::parse_definition("n1=10.0.0.5:7000").unwrap();
        assert_eq!(node.name, "n1");
        assert_eq!(node.host(), "10.0.0.5");
        assert_eq!(node.role, NodeRole::Worker);

        assert!(Node::parse_definition("10.0.0.5:7000").is_err());
        assert!(Node::parse_definition("=10.0.0.5:7000").is_err());
    }

    #[test]
    fn test_node_json() {
        let node: Node = serde_json::from_str(r#"{"name":"n2","host":"w2","port":7001}"#).unwrap();
        assert_eq!(node, Node::worker("n2", NodeAddress::new("w2", 7001)));
    }
}
