//! The database context.

use crate::transaction::Transaction;
use beanorm_core::{
    CacheInvalidation, Connection, MappingRegistry, NoopInvalidation, PassthroughConvert,
    ScalarConvert,
};
use beanorm_plan::{CacheStats, PlanCache, PlanStatsSnapshot};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;

/// Configuration for a [`Database`].
#[derive(Clone)]
pub struct DatabaseConfig {
    pub(crate) name: String,
    pub(crate) batch_size: usize,
    pub(crate) plan_cache_size: usize,
    pub(crate) statement_timeout: Option<Duration>,
    pub(crate) background_fetch_after: Option<usize>,
    pub(crate) invalidation: Arc<dyn CacheInvalidation>,
    pub(crate) convert: Arc<dyn ScalarConvert>,
}

impl DatabaseConfig {
    /// Create a configuration with defaults: batch size 100, 256 cached
    /// plans per bean type, no statement timeout.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            batch_size: 100,
            plan_cache_size: 256,
            statement_timeout: None,
            background_fetch_after: None,
            invalidation: Arc::new(NoopInvalidation),
            convert: Arc::new(PassthroughConvert),
        }
    }

    /// Number of pending writes that triggers an eager batch flush.
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Bound on cached query plans per bean type.
    #[must_use]
    pub fn plan_cache_size(mut self, size: usize) -> Self {
        self.plan_cache_size = size;
        self
    }

    /// Timeout applied to every statement.
    #[must_use]
    pub fn statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = Some(timeout);
        self
    }

    /// Default background-fetch threshold: collection finds continue on a
    /// background thread after this many foreground objects, unless the
    /// query sets its own threshold.
    #[must_use]
    pub fn background_fetch_after(mut self, objects: usize) -> Self {
        self.background_fetch_after = Some(objects);
        self
    }

    /// Sink notified with the tables each batch flush modified.
    #[must_use]
    pub fn invalidation(mut self, sink: Arc<dyn CacheInvalidation>) -> Self {
        self.invalidation = sink;
        self
    }

    /// Scalar conversion between database and bean representations.
    #[must_use]
    pub fn scalar_convert(mut self, convert: Arc<dyn ScalarConvert>) -> Self {
        self.convert = convert;
        self
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new("db")
    }
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .field("plan_cache_size", &self.plan_cache_size)
            .field("statement_timeout", &self.statement_timeout)
            .finish_non_exhaustive()
    }
}

/// The long-lived database context: mapping registry, per-type plan
/// caches, and configuration shared by every transaction.
pub struct Database {
    registry: MappingRegistry,
    config: DatabaseConfig,
    plan_caches: Mutex<HashMap<String, Arc<PlanCache>>>,
}

impl Database {
    /// Create a database context over an externally-resolved registry.
    #[must_use]
    pub fn new(registry: MappingRegistry, config: DatabaseConfig) -> Self {
        info!(
            name = %config.name,
            bean_types = registry.len(),
            "database context created"
        );
        Self {
            registry,
            config,
            plan_caches: Mutex::new(HashMap::new()),
        }
    }

    /// The configured name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The mapping registry.
    pub fn registry(&self) -> &MappingRegistry {
        &self.registry
    }

    pub(crate) fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The plan cache for one bean type, created on first use.
    pub fn plan_cache(&self, bean_type: &str) -> Arc<PlanCache> {
        let mut caches = self.plan_caches.lock().expect("lock poisoned");
        Arc::clone(
            caches
                .entry(bean_type.to_string())
                .or_insert_with(|| Arc::new(PlanCache::new(self.config.plan_cache_size))),
        )
    }

    /// Execution statistics for every resident plan across all bean types.
    pub fn plan_stats(&self) -> Vec<PlanStatsSnapshot> {
        let caches = self.plan_caches.lock().expect("lock poisoned");
        caches.values().flat_map(|c| c.plan_stats()).collect()
    }

    /// Per-bean-type plan cache counters.
    pub fn cache_stats(&self) -> Vec<(String, CacheStats)> {
        let caches = self.plan_caches.lock().expect("lock poisoned");
        let mut stats: Vec<(String, CacheStats)> = caches
            .iter()
            .map(|(bean_type, cache)| (bean_type.clone(), cache.cache_stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }

    /// Start a transaction over a driver connection.
    pub fn begin(&self, conn: Box<dyn Connection>) -> Transaction<'_> {
        Transaction::new(self, conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("bean_types", &self.registry.len())
            .finish_non_exhaustive()
    }
}
