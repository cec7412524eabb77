//! Dependency resolution
//!
//! ELF dynamic-section reading and transitive library closure.

pub mod elf;
pub mod ldd;

pub use ldd::{ldd, Resolution, Resolver};
