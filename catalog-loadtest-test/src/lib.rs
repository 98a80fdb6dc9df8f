//! Test utilities for the catalog load-testing harness.
//!
//! See the modules for all available utilities.

pub mod server;
pub mod tracing;
