//! Data models for the execution layer.
//!
//! This module re-exports all model types used throughout the application.

pub mod connection;
pub mod options;
pub mod query;

// Re-export commonly used types
pub use connection::{DatabaseType, PoolParams, mask_connection_string};
pub use options::{ExecuteOptions, FetchType, OutFormat, ResolvedOptions};
pub use query::{ColumnMetadata, ExecutionResult, QueryParam, Rows};
