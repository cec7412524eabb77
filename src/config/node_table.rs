//! Node-number to network-address table.
//!
//! The table is a JSON document of the form
//! `{"Noderanges": [{"Base": 1, "Ip": "10.0.0.1"}, ...]}`. Each entry maps a
//! run of consecutive node numbers starting at `Base` onto consecutive IPv4
//! addresses starting at `Ip`. A range extends until the next higher base.

use crate::config::types::{NodeId, Result, XprocError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

/// Files probed, in order, when no explicit table is given.
pub const DEFAULT_LOCATIONS: &[&str] = &["gpconfig", "/etc/clustermatic/gpconfig"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRangeEntry {
    #[serde(rename = "Base")]
    pub base: NodeId,
    #[serde(rename = "Ip")]
    pub ip: Ipv4Addr,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTable {
    #[serde(rename = "Noderanges", default)]
    pub ranges: Vec<NodeRangeEntry>,
}

impl NodeTable {
    pub fn from_json(text: &str) -> Result<Self> {
        let mut table: NodeTable = serde_json::from_str(text)
            .map_err(|e| XprocError::Parse(format!("node table: {}", e)))?;
        table.ranges.sort_by_key(|entry| entry.base);
        Ok(table)
    }

    /// Load the table from `explicit` if given, otherwise from the first
    /// default location that exists. No table at all is an empty table.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let text = fs::read_to_string(path).map_err(|e| {
                XprocError::Config(format!("cannot read node table {}: {}", path.display(), e))
            })?;
            return Self::from_json(&text);
        }

        let candidates: Vec<PathBuf> = DEFAULT_LOCATIONS.iter().map(PathBuf::from).collect();
        Self::load_first(&candidates)
    }

    pub fn load_first(candidates: &[PathBuf]) -> Result<Self> {
        for path in candidates {
            match fs::read_to_string(path) {
                Ok(text) => {
                    log::debug!("node table loaded from {}", path.display());
                    return Self::from_json(&text);
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(XprocError::Config(format!(
                        "cannot read node table {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        log::debug!("no node table found; node addresses are unknown");
        Ok(Self::default())
    }

    fn entry_for(&self, node: NodeId) -> Option<&NodeRangeEntry> {
        self.ranges.iter().rev().find(|entry| entry.base <= node)
    }

    /// Address assigned to `node`, if any range covers it.
    pub fn address_of(&self, node: NodeId) -> Option<Ipv4Addr> {
        let entry = self.entry_for(node)?;
        let offset = node - entry.base;
        u32::from(entry.ip).checked_add(offset).map(Ipv4Addr::from)
    }

    /// Node number whose table address is `ip`.
    pub fn node_of(&self, ip: Ipv4Addr) -> Option<NodeId> {
        let wanted = u32::from(ip);
        self.ranges.iter().find_map(|entry| {
            let first = u32::from(entry.ip);
            let offset = wanted.checked_sub(first)?;
            let node = entry.base.checked_add(offset)?;
            (self.address_of(node) == Some(ip)).then_some(node)
        })
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
