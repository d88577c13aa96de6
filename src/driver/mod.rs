//! # Drivers
//!
//! Backing stores for the table resource.

pub mod condition;
pub mod memory;

pub use memory::MemoryDriver;
