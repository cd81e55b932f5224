//! Registry of named pools bound to the host's lifetime.
//!
//! Each registration fills either the default slot or a named slot, from
//! exactly one source: a caller-supplied backend, an alias of a pool that is
//! already registered, or parameters for a brand-new pool. The registry owns
//! the shutdown drain and runs it once.

use crate::config::DEFAULT_DRAIN_TIME_SECS;
use crate::db::backend::{Backend, Connect};
use crate::db::executor::Database;
use crate::db::managed::{DrainOutcome, DrainReport, ManagedPool, PoolStatus};
use crate::db::pool::DbPool;
use crate::error::{DbError, DbResult};
use crate::models::{FetchType, OutFormat, PoolParams, ResolvedOptions};
use futures_util::future::join_all;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Label used for the unnamed slot in logs and status output.
pub const DEFAULT_SLOT: &str = "default";

/// Options for one registration.
///
/// Exactly one of `client`, `pool_alias` and `pool` must be set.
pub struct RegistrationOptions<B: Backend = DbPool> {
    pub name: Option<String>,
    /// An already-open backend supplied by the caller
    pub client: Option<B>,
    /// Alias of a pool registered earlier
    pub pool_alias: Option<String>,
    /// Parameters for a brand-new pool
    pub pool: Option<PoolParams>,
    /// Longest wait for outstanding leases at shutdown (default 10s)
    pub drain_time: Option<Duration>,
    pub out_format: Option<OutFormat>,
    pub fetch_as_string: BTreeSet<FetchType>,
}

impl<B: Backend> Default for RegistrationOptions<B> {
    fn default() -> Self {
        Self {
            name: None,
            client: None,
            pool_alias: None,
            pool: None,
            drain_time: None,
            out_format: None,
            fetch_as_string: BTreeSet::new(),
        }
    }
}

impl<B: Backend> RegistrationOptions<B> {
    pub fn with_client(client: B) -> Self {
        Self {
            client: Some(client),
            ..Self::default()
        }
    }

    pub fn with_pool_alias(alias: impl Into<String>) -> Self {
        Self {
            pool_alias: Some(alias.into()),
            ..Self::default()
        }
    }

    pub fn with_pool(params: PoolParams) -> Self {
        Self {
            pool: Some(params),
            ..Self::default()
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn drain_time(mut self, drain_time: Duration) -> Self {
        self.drain_time = Some(drain_time);
        self
    }

    pub fn out_format(mut self, out_format: OutFormat) -> Self {
        self.out_format = Some(out_format);
        self
    }

    pub fn fetch_as_string(mut self, types: impl IntoIterator<Item = FetchType>) -> Self {
        self.fetch_as_string = types.into_iter().collect();
        self
    }

    fn source_count(&self) -> usize {
        [
            self.client.is_some(),
            self.pool_alias.is_some(),
            self.pool.is_some(),
        ]
        .into_iter()
        .filter(|set| *set)
        .count()
    }
}

/// Serializable form of [`RegistrationOptions`] without the client source.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RegistrationSettings {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub pool_alias: Option<String>,
    #[serde(default)]
    pub pool: Option<PoolParams>,
    /// Seconds
    #[serde(default)]
    pub drain_time: Option<u64>,
    #[serde(default)]
    pub out_format: Option<OutFormat>,
    #[serde(default)]
    pub fetch_as_string: BTreeSet<FetchType>,
}

impl RegistrationSettings {
    pub fn into_options<B: Backend>(self) -> RegistrationOptions<B> {
        RegistrationOptions {
            name: self.name,
            client: None,
            pool_alias: self.pool_alias,
            pool: self.pool,
            drain_time: self.drain_time.map(Duration::from_secs),
            out_format: self.out_format,
            fetch_as_string: self.fetch_as_string,
        }
    }
}

/// Check a slot or alias name: non-empty, alphanumerics, `-` and `_`.
pub fn validate_name(kind: &str, name: &str) -> DbResult<()> {
    if name.is_empty() {
        return Err(DbError::configuration(format!("{} cannot be empty", kind)));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DbError::configuration(format!(
            "{} '{}' may only contain letters, digits, '-' and '_'",
            kind, name
        )));
    }
    if name.eq_ignore_ascii_case(DEFAULT_SLOT) {
        return Err(DbError::configuration(format!(
            "{} '{}' is reserved; omit the name to register the default pool",
            kind, name
        )));
    }
    Ok(())
}

struct DrainEntry<B: Backend> {
    pool: Arc<ManagedPool<B>>,
    drain_time: Duration,
}

struct RegistryState<B: Backend> {
    default: Option<Database<B>>,
    named: BTreeMap<String, Database<B>>,
    aliases: HashMap<String, Arc<ManagedPool<B>>>,
    /// Each distinct pool once, in registration order
    drains: Vec<DrainEntry<B>>,
    shut_down: bool,
}

impl<B: Backend> RegistryState<B> {
    fn new() -> Self {
        Self {
            default: None,
            named: BTreeMap::new(),
            aliases: HashMap::new(),
            drains: Vec::new(),
            shut_down: false,
        }
    }

    fn check_open(&self) -> DbResult<()> {
        if self.shut_down {
            return Err(DbError::configuration(
                "Cannot register pools after shutdown has started",
            ));
        }
        Ok(())
    }

    fn check_slot(&self, name: Option<&str>) -> DbResult<()> {
        match name {
            None if self.default.is_some() => Err(DbError::configuration(
                "A default pool has already been registered; give this one a name",
            )),
            Some(name) if self.named.contains_key(name) => Err(DbError::configuration(format!(
                "Pool name '{}' has already been registered",
                name
            ))),
            _ => Ok(()),
        }
    }

    fn check_new_alias(&self, alias: Option<&str>) -> DbResult<()> {
        match alias {
            Some(alias) if self.aliases.contains_key(alias) => Err(DbError::configuration(
                format!("Pool alias '{}' is already in use", alias),
            )),
            _ => Ok(()),
        }
    }

    fn lookup_alias(&self, alias: &str) -> DbResult<Arc<ManagedPool<B>>> {
        self.aliases.get(alias).cloned().ok_or_else(|| {
            DbError::configuration(format!("Could not get pool alias '{}': not registered", alias))
        })
    }

    /// Track a pool for shutdown; a pool reached through several
    /// registrations keeps the longest drain time.
    fn track(&mut self, pool: &Arc<ManagedPool<B>>, drain_time: Duration) {
        match self.drains.iter_mut().find(|e| Arc::ptr_eq(&e.pool, pool)) {
            Some(entry) => entry.drain_time = entry.drain_time.max(drain_time),
            None => self.drains.push(DrainEntry {
                pool: Arc::clone(pool),
                drain_time,
            }),
        }
    }
}

enum Resolved<B: Backend> {
    Created(ManagedPool<B>, Option<String>),
    Existing(Arc<ManagedPool<B>>),
}

/// Registry of all pools owned by the host application.
pub struct PoolRegistry<B: Backend = DbPool> {
    state: Arc<RwLock<RegistryState<B>>>,
}

impl<B: Backend> Clone for PoolRegistry<B> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<B: Backend> Default for PoolRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> std::fmt::Debug for PoolRegistry<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry").finish_non_exhaustive()
    }
}

impl<B: Connect> PoolRegistry<B> {
    /// Register a pool and return its [`Database`] handle.
    ///
    /// All option and slot checks happen before any connection is opened.
    pub async fn register(&self, options: RegistrationOptions<B>) -> DbResult<Database<B>> {
        let sources = options.source_count();
        if sources != 1 {
            return Err(DbError::configuration(format!(
                "Exactly one of client, pool_alias or pool must be supplied (got {})",
                sources
            )));
        }
        if let Some(name) = options.name.as_deref() {
            validate_name("Pool name", name)?;
        }
        let new_alias = options.pool.as_ref().and_then(|p| p.alias.clone());
        if let Some(alias) = new_alias.as_deref() {
            validate_name("Pool alias", alias)?;
        }

        let RegistrationOptions {
            name,
            client,
            pool_alias,
            pool,
            drain_time,
            out_format,
            fetch_as_string,
        } = options;
        let drain_time = drain_time.unwrap_or(Duration::from_secs(DEFAULT_DRAIN_TIME_SECS));
        let label = name.clone().unwrap_or_else(|| DEFAULT_SLOT.to_string());

        let existing = {
            let state = self.state.read().await;
            state.check_open()?;
            state.check_slot(name.as_deref())?;
            state.check_new_alias(new_alias.as_deref())?;
            match pool_alias.as_deref() {
                Some(alias) => Some(state.lookup_alias(alias)?),
                None => None,
            }
        }; // Read lock released here

        let resolved = match (existing, client, pool) {
            (Some(shared), _, _) => Resolved::Existing(shared),
            (None, Some(client), _) => Resolved::Created(ManagedPool::new(&label, client), None),
            (None, None, Some(params)) => {
                let backend = B::connect(&params).await?;
                Resolved::Created(ManagedPool::new(&label, backend), params.alias)
            }
            (None, None, None) => return Err(DbError::internal("registration source vanished")),
        };

        let (pool, created, alias) = match resolved {
            Resolved::Created(pool, alias) => (Arc::new(pool), true, alias),
            Resolved::Existing(pool) => (pool, false, None),
        };

        let defaults = ResolvedOptions::new(out_format.unwrap_or_default(), fetch_as_string);
        let mut database = Database::new(Arc::clone(&pool), defaults);
        if let Some(name) = name.as_deref() {
            database = database.with_name(name);
        }

        // Re-check after async work to prevent TOCTOU race
        let conflict = {
            let mut state = self.state.write().await;
            let check = state
                .check_open()
                .and_then(|_| state.check_slot(name.as_deref()))
                .and_then(|_| state.check_new_alias(alias.as_deref()));
            match check {
                Ok(()) => {
                    state.track(&pool, drain_time);
                    if let Some(alias) = alias.as_deref() {
                        state.aliases.insert(alias.to_string(), Arc::clone(&pool));
                    }
                    match name.as_deref() {
                        Some(name) => {
                            state.named.insert(name.to_string(), database.clone());
                        }
                        None => state.default = Some(database.clone()),
                    }
                    None
                }
                Err(err) => Some(err),
            }
        }; // Lock released here

        if let Some(err) = conflict {
            if created {
                // Close the pool we just created outside of lock
                pool.close(Duration::ZERO).await;
            }
            return Err(err);
        }

        info!(
            pool = %label,
            backend = pool.backend().kind(),
            alias = ?alias,
            shared = !created,
            drain_ms = drain_time.as_millis() as u64,
            "Pool registered"
        );
        Ok(database)
    }

    /// Register from deserialized settings.
    pub async fn register_settings(&self, settings: RegistrationSettings) -> DbResult<Database<B>> {
        self.register(settings.into_options()).await
    }
}

impl<B: Backend> PoolRegistry<B> {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::new())),
        }
    }

    /// Publish a caller-supplied backend under `alias` without filling a slot.
    ///
    /// The pool is closed at shutdown like every other registered pool.
    pub async fn register_alias(
        &self,
        alias: &str,
        client: B,
        drain_time: Option<Duration>,
    ) -> DbResult<Arc<ManagedPool<B>>> {
        validate_name("Pool alias", alias)?;
        let pool = Arc::new(ManagedPool::new(alias, client));
        let drain_time = drain_time.unwrap_or(Duration::from_secs(DEFAULT_DRAIN_TIME_SECS));

        let mut state = self.state.write().await;
        state.check_open()?;
        state.check_new_alias(Some(alias))?;
        state.aliases.insert(alias.to_string(), Arc::clone(&pool));
        state.track(&pool, drain_time);
        info!(alias = %alias, backend = pool.backend().kind(), "Pool alias registered");
        Ok(pool)
    }

    /// Look up a named registration.
    pub async fn get(&self, name: &str) -> DbResult<Database<B>> {
        let state = self.state.read().await;
        state
            .named
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::pool_not_found(name))
    }

    /// The unnamed registration.
    pub async fn default_database(&self) -> DbResult<Database<B>> {
        let state = self.state.read().await;
        state
            .default
            .clone()
            .ok_or_else(|| DbError::pool_not_found(DEFAULT_SLOT))
    }

    /// Named lookup, or the default slot when `name` is `None`.
    pub async fn resolve(&self, name: Option<&str>) -> DbResult<Database<B>> {
        match name {
            Some(name) => self.get(name).await,
            None => self.default_database().await,
        }
    }

    /// Names of the named slots, sorted.
    pub async fn names(&self) -> Vec<String> {
        let state = self.state.read().await;
        state.named.keys().cloned().collect()
    }

    pub async fn has_default(&self) -> bool {
        self.state.read().await.default.is_some()
    }

    /// Status of every distinct registered pool.
    pub async fn statuses(&self) -> Vec<PoolStatus> {
        let state = self.state.read().await;
        state.drains.iter().map(|e| e.pool.status()).collect()
    }

    pub async fn is_shut_down(&self) -> bool {
        self.state.read().await.shut_down
    }

    /// Drain and close every registered pool, concurrently.
    ///
    /// Runs once; later calls return an empty list.
    pub async fn close_all(&self) -> Vec<DrainReport> {
        let drains = {
            let mut state = self.state.write().await;
            if state.shut_down {
                return Vec::new();
            }
            state.shut_down = true;
            state
                .drains
                .iter()
                .map(|e| (Arc::clone(&e.pool), e.drain_time))
                .collect::<Vec<_>>()
        }; // Lock released here

        info!(pools = drains.len(), "Closing registered pools");
        let reports = join_all(
            drains
                .iter()
                .map(|(pool, drain_time)| pool.close(*drain_time)),
        )
        .await;

        let forced = reports
            .iter()
            .filter(|r| matches!(r.outcome, DrainOutcome::Forced { .. }))
            .count();
        if forced > 0 {
            warn!(forced, "Some pools were closed with connections still leased");
        }
        info!("All pools closed");
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("Pool name", "reports").is_ok());
        assert!(validate_name("Pool name", "read-replica_2").is_ok());
        assert!(validate_name("Pool name", "").is_err());
        assert!(validate_name("Pool name", "bad name").is_err());
        assert!(validate_name("Pool name", "a.b").is_err());
        assert!(validate_name("Pool name", "Default").is_err());
    }

    #[test]
    fn test_settings_deserialize() {
        let settings: RegistrationSettings = serde_json::from_value(serde_json::json!({
            "name": "reports",
            "pool": {"connection_string": "sqlite::memory:", "alias": "mem"},
            "drain_time": 3,
            "out_format": "OUT_FORMAT_ARRAY",
            "fetch_as_string": ["number"]
        }))
        .unwrap();
        let options: RegistrationOptions<DbPool> = settings.into_options();
        assert_eq!(options.source_count(), 1);
        assert_eq!(options.drain_time, Some(Duration::from_secs(3)));
        assert_eq!(options.out_format, Some(OutFormat::Array));
        assert_eq!(
            options.pool.and_then(|p| p.alias).as_deref(),
            Some("mem")
        );
    }

    #[test]
    fn test_settings_reject_unknown_fetch_type() {
        let result = serde_json::from_value::<RegistrationSettings>(serde_json::json!({
            "pool": {"connection_string": "sqlite::memory:"},
            "fetch_as_string": ["clob"]
        }));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_empty_registry_lookups() {
        let registry: PoolRegistry = PoolRegistry::new();
        assert!(matches!(
            registry.get("missing").await,
            Err(DbError::PoolNotFound { .. })
        ));
        assert!(registry.default_database().await.is_err());
        assert!(registry.names().await.is_empty());
        assert!(registry.close_all().await.is_empty());
        assert!(registry.is_shut_down().await);
    }
}
