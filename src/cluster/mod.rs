//! Cluster plumbing: node addressing, the relay tree and the controller.

pub mod controller;
pub mod fanout;
pub mod noderange;
pub mod registry;
pub mod relay;
