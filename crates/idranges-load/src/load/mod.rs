//! Load driver internals.
//!
//! - [`config`] - command line and environment settings.
//! - [`driver`] - runs the allocators and verifies the shared backend.
//! - [`telemetry`] - logging, tracing and metrics setup.

pub mod config;
pub mod driver;
pub mod telemetry;
