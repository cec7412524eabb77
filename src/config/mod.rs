//! Configuration
//!
//! Shared error type, runtime settings and the cluster node table.

pub mod node_table;
pub mod types;
