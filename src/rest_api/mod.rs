//! # REST API
//!
//! HTTP glue in front of the table resource: one route per table and
//! per record, verb tunneling, principal extraction and JSON bodies.

mod server;

pub use server::{RestServer, METHOD_HEADER, METHOD_OVERRIDE_HEADER, USER_ID_HEADER};
