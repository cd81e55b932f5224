//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Backend capability traits and the sqlx-backed pools
//! - Lease bookkeeping and bounded shutdown drain
//! - Single-statement and transactional execution
//! - The registry of named pools
//! - Row decoding and database dispatch macros

pub mod backend;
pub mod executor;
#[macro_use]
pub mod macros;
pub mod managed;
pub mod params;
pub mod pool;
pub mod registry;
pub mod types;

pub use backend::{Backend, BackendConnection, BackendStats, Connect, TransactionStatements};
pub use executor::{Database, Transaction, TransactionState, is_transaction_control};
pub use managed::{
    DrainOutcome, DrainReport, Lease, ManagedPool, PoolState, PoolStatus, SessionState,
};
pub use pool::{DbConnection, DbPool};
pub use registry::{PoolRegistry, RegistrationOptions, RegistrationSettings, validate_name};
