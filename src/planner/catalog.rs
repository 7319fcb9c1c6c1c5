//! Map catalog produced by the query compiler

use crate::error::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// A shared map and the number of its key positions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapInfo {
    pub name: String,

    #[serde(default)]
    pub arity: usize,
}

/// Maps and trigger templates for one compiled query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapCatalog {
    pub maps: Vec<MapInfo>,

    /// Opaque trigger templates, copied into the descriptor
    #[serde(default)]
    pub templates: Vec<String>,
}

impl MapCatalog {
    /// Load a catalog from a JSON file
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let catalog: Self = serde_json::from_str(&text).map_err(|e| ConfigError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Reject catalogs defining a map twice
    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for map in &self.maps {
            if !seen.insert(map.name.as_str()) {
                return Err(ConfigError::InvalidPartition {
                    map: map.name.clone(),
                    reason: "defined twice in the catalog".into(),
                });
            }
        }
        Ok(())
    }

    pub fn map(&self, name: &str) -> Option<&MapInfo> {
        self.maps.iter().find(|m| m.name == name)
    }

    /// `(name, id)` pairs; ids are catalog positions
    pub fn ids(&self) -> impl Iterator<Item = (&str, usize)> {
        self.maps.iter().enumerate().map(|(id, m)| (m.name.as_str(), id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_catalog() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"maps":[{{"name":"q","arity":2}},{{"name":"total"}}],"templates":["q[a] += x"]}}"#
        )
        .unwrap();

        let catalog = MapCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.maps.len(), 2);
        assert_eq!(catalog.map("total").unwrap().arity, 0);
        assert_eq!(catalog.ids().collect::<Vec<_>>(), vec![("q", 0), ("total", 1)]);
    }

    #[test]
    fn test_duplicate_map_rejected() {
        let catalog = MapCatalog {
            maps: vec![
                MapInfo { name: "q".into(), arity: 1 },
                MapInfo { name: "q".into(), arity: 1 },
            ],
            templates: Vec::new(),
        };
        assert!(catalog.validate().is_err());
    }
}
