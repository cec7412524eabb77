//! xproc: run one program on many cluster nodes at once
//!
//! A controller resolves a program's shared-library closure, ships the files
//! down a tree of relays and has an executor on every target node stage them
//! and start the program, with its stdio tunneled back to the controller.
//!
//! # Architecture
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: errors, runtime settings, node identifiers
//! - [`config::node_table`]: static node-number to address table
//!
//! ## Wire ([`wire`])
//! - [`wire::frame`]: tagged, length-prefixed frames
//! - [`wire::channel`]: argument / data / response channel pair
//! - [`wire::net`]: unix and TCP endpoints
//! - [`wire::types`]: messages exchanged between roles
//!
//! ## Resolution ([`resolve`])
//! - [`resolve::elf`]: dynamic-section reader
//! - [`resolve::ldd`]: transitive shared-library resolution
//!
//! ## Staging ([`stage`])
//! - [`stage::collector`]: file closure to staging commands
//! - [`stage::apply`]: idempotent materialization under the staging root
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::namespace`]: private mount namespace over the staging root
//!
//! ## Execution ([`exec`])
//! - [`exec::executor`]: type-state staging pipeline and job service
//! - [`exec::spawn`]: tunneled spawn and per-child reaping
//!
//! ## Cluster ([`cluster`])
//! - [`cluster::noderange`]: node list parsing
//! - [`cluster::registry`]: member registry actor
//! - [`cluster::relay`]: root and member relays
//! - [`cluster::fanout`]: one inbound stream to many dispatches
//! - [`cluster::controller`]: top-level invocation
//!
//! ## Observability ([`observability`])
//! - [`observability::logging`]: logger setup and runtime debug level

#![deny(unused_doc_comments)]

pub mod cluster;
pub mod config;
pub mod exec;
pub mod kernel;
pub mod observability;
pub mod resolve;
pub mod stage;
pub mod wire;

// CLI entrypoint wiring for the xproc binary.
pub mod cli;

pub use config::types::*;
