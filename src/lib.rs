//! tablegate - database-agnostic REST gateway for table resources
//!
//! The [`table`] module holds the request pipeline: option normalization,
//! identifier resolution, record validation, batch orchestration over a
//! driver transaction and result shaping. Stores plug in by implementing
//! [`table::TableDriver`]; [`driver::MemoryDriver`] is the in-process
//! reference implementation.

pub mod cli;
pub mod config;
pub mod driver;
pub mod observability;
pub mod rest_api;
pub mod table;
