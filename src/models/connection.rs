//! Connection-related data models.
//!
//! This module defines the parameters used to create a fresh pool and the
//! database type detection for connection strings.

use crate::config::PoolOptions;
use crate::error::DbError;
use serde::{Deserialize, Serialize};

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("mysql://") || lower.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Parameters for creating a brand-new pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolParams {
    /// Contains sensitive data - never log
    #[serde(skip_serializing)]
    pub connection_string: String,
    #[serde(default)]
    pub pool_options: PoolOptions,
    /// Publishes the created pool under this alias for later `pool_alias` lookups.
    #[serde(default)]
    pub alias: Option<String>,
}

impl PoolParams {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            pool_options: PoolOptions::default(),
            alias: None,
        }
    }

    pub fn with_pool_options(mut self, pool_options: PoolOptions) -> Self {
        self.pool_options = pool_options;
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Detect the database type, rejecting unknown schemes.
    pub fn db_type(&self) -> Result<DatabaseType, DbError> {
        DatabaseType::from_connection_string(&self.connection_string).ok_or_else(|| {
            DbError::configuration(format!(
                "Unknown database type in connection string: {}",
                mask_connection_string(&self.connection_string)
            ))
        })
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        mask_connection_string(&self.connection_string)
    }
}

/// Replace the password portion of a connection URL with `****`.
pub fn mask_connection_string(connection_string: &str) -> String {
    if let Some(at_pos) = connection_string.find('@') {
        if let Some(colon_pos) = connection_string[..at_pos].rfind(':') {
            // "scheme://user@host" has its only colon in the scheme separator
            if !connection_string[colon_pos..].starts_with("://") {
                let prefix = &connection_string[..colon_pos + 1];
                let suffix = &connection_string[at_pos..];
                return format!("{}****{}", prefix, suffix);
            }
        }
    }
    connection_string.to_string()
}
