//! Staging
//!
//! Collecting filesystem entries into commands on the controller and
//! applying them below the staging root on executors.

pub mod apply;
pub mod collector;

pub use apply::{staged_path, ApplyReport, Stager};
pub use collector::FileCollector;
