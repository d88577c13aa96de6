//! Observability for the gateway
//!
//! Structured events are emitted with `tracing` macros at the call sites
//! (batch start/abort, driver commit, HTTP requests). This module only
//! owns subscriber installation.

mod logger;

pub use logger::init_logging;
