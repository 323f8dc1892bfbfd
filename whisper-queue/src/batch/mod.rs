//! Batch executor adapter.

pub mod executor;

pub use executor::{BatchConfig, BatchExecutor, CloudBatchExecutor};
