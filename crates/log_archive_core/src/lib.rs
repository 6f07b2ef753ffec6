//! Log archive pipeline domain primitives.
//!
//! This crate owns deterministic pipeline behavior: the run request contract,
//! trailing-window selection, object key derivation and work planning, run
//! aggregation, and schedule evaluation. It intentionally excludes AWS SDK and
//! Lambda runtime concerns.

pub mod aggregate;
pub mod clock;
pub mod contract;
pub mod planning;
pub mod schedule;
pub mod storage_keys;
pub mod window;
