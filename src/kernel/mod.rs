//! Thin wrappers around Linux kernel primitives.
//!
//! Only mount namespaces are used: the executor unshares one so its staging
//! root can be replaced without touching the host.

pub mod namespace;
