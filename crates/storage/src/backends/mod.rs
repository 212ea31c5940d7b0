//! Key-value store backends.

pub mod filesystem;
pub mod memory;
