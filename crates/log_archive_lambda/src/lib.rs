//! AWS-oriented adapters and handlers for the log archive pipeline.
//!
//! This crate owns runtime integration details (Lambda handlers, the schedule
//! daemon, RDS and S3 adapters) and drives the pure pipeline primitives from
//! `log_archive_core`.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod telemetry;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;
