//! Execution
//!
//! The executor role: staging type-state chain, tunneled payload launch and
//! reaping.

pub mod executor;
pub mod spawn;

pub use executor::run_executor;
