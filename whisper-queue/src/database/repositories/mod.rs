//! Repositories for database access.

pub mod job;

pub use job::{JobStore, SqliteJobStore};
