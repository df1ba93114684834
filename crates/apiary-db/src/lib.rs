//! Persistent store for the apiary orchestrator: tasks, runs, workers,
//! events, planning queue, and execution plans, backed by a single SQLite
//! file with a bounded connection pool.

pub mod config;
pub mod error;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::StoreError;

/// Convenience alias used throughout the store layer.
pub type StoreResult<T> = Result<T, StoreError>;
