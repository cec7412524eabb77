//! Observability
//!
//! Logger installation and the runtime-adjustable debug level.

pub mod logging;
