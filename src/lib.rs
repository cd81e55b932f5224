//! Pooled query and transaction execution for SQL databases.
//!
//! A [`PoolRegistry`](db::PoolRegistry) owns named and default pools
//! (PostgreSQL, MySQL, SQLite). Each registration yields a
//! [`Database`](db::Database) handle for single statements and
//! commit-or-rollback units of work. The registry drains every pool once
//! at shutdown.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod server;

pub use config::Config;
pub use db::{Database, PoolRegistry, RegistrationOptions, Transaction};
pub use error::{DbError, DbResult};
