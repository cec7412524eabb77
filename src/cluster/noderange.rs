//! Node list syntax: comma-separated tokens, each a decimal node number or
//! an inclusive `a-b` range, e.g. `1-4,7,10-12`. Tokens hold digits and at
//! most one dash, nothing else.

use crate::config::types::{NodeId, Result, XprocError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

/// Most node numbers a list may expand to.
pub const MAX_EXPANDED_NODES: u64 = 1 << 16;

/// Inclusive range of node numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRange {
    pub start: NodeId,
    pub end: NodeId,
}

impl NodeRange {
    pub fn single(node: NodeId) -> Self {
        Self {
            start: node,
            end: node,
        }
    }

    pub fn new(start: NodeId, end: NodeId) -> Result<Self> {
        if start > end {
            return Err(XprocError::Parse(format!(
                "descending node range {}-{}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn nodes(&self) -> RangeInclusive<NodeId> {
        self.start..=self.end
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes().contains(&node)
    }

    /// Number of nodes in the range.
    pub fn span(&self) -> u64 {
        u64::from(self.end - self.start) + 1
    }
}

impl fmt::Display for NodeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

fn parse_number(text: &str, token: &str) -> Result<NodeId> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(XprocError::Parse(format!(
            "malformed node token '{}'",
            token
        )));
    }
    text.parse::<NodeId>()
        .map_err(|e| XprocError::Parse(format!("node token '{}': {}", token, e)))
}

impl FromStr for NodeRange {
    type Err = XprocError;

    fn from_str(token: &str) -> Result<Self> {
        if token.is_empty() {
            return Err(XprocError::Parse("empty node token".to_string()));
        }
        match token.split_once('-') {
            Some((start, end)) => NodeRange::new(
                parse_number(start, token)?,
                parse_number(end, token)?,
            ),
            None => Ok(NodeRange::single(parse_number(token, token)?)),
        }
    }
}

/// Parse a node list into ranges, in input order. A blank list is empty.
pub fn parse_node_list(list: &str) -> Result<Vec<NodeRange>> {
    if list.trim().is_empty() {
        return Ok(Vec::new());
    }
    list.split(',').map(str::parse).collect()
}

/// Flatten ranges into node numbers, keeping first occurrences only.
/// Lists spanning more than [`MAX_EXPANDED_NODES`] are refused before
/// anything is allocated.
pub fn expand(ranges: &[NodeRange]) -> Result<Vec<NodeId>> {
    let span: u64 = ranges.iter().map(NodeRange::span).sum();
    if span > MAX_EXPANDED_NODES {
        return Err(XprocError::Parse(format!(
            "node list spans {} nodes, more than {}",
            span, MAX_EXPANDED_NODES
        )));
    }
    let mut seen = HashSet::new();
    Ok(ranges
        .iter()
        .flat_map(NodeRange::nodes)
        .filter(|node| seen.insert(*node))
        .collect())
}
