//! Compiled query plans and the per-type plan cache.

use crate::lru::{BoundedCache, CacheStats};
use crate::query::Query;
use crate::tree::SqlTree;
use beanorm_core::{MappingRegistry, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// A compiled plan: generated SQL, hydration tree, and execution statistics.
///
/// Plans are immutable after build and shared across threads; only the
/// statistics counters mutate.
#[derive(Debug)]
pub struct QueryPlan {
    shape: u64,
    sql: String,
    tree: SqlTree,
    executions: AtomicU64,
    total_micros: AtomicU64,
    max_micros: AtomicU64,
    total_rows: AtomicU64,
}

/// Point-in-time execution statistics for one plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStatsSnapshot {
    /// The plan's shape hash.
    pub shape: u64,
    /// The generated SQL.
    pub sql: String,
    /// Number of executions recorded.
    pub executions: u64,
    /// Total execution time, microseconds.
    pub total_micros: u64,
    /// Slowest execution, microseconds.
    pub max_micros: u64,
    /// Mean execution time, microseconds; zero before the first execution.
    pub avg_micros: u64,
    /// Total rows read across all executions.
    pub total_rows: u64,
}

impl QueryPlan {
    /// Compile a query into a plan: build the hydration tree, then render
    /// the SQL around it.
    pub fn build(registry: &MappingRegistry, query: &Query) -> Result<Self> {
        let shape = query.shape_hash();
        let tree = SqlTree::build(registry, query)?;

        let mut sql = String::from("select ");
        if query.is_distinct() {
            sql.push_str("distinct ");
        }
        sql.push_str(&tree.select_clause());
        sql.push_str(" from ");
        sql.push_str(&tree.from_clause());

        let mut predicates = tree.root_predicates();
        let mut next_placeholder = 1;
        if let Some(filter) = query.filter_expr() {
            let mut resolve = |path: &str| tree.resolve_column(path);
            predicates.push(filter.render(&mut resolve, &mut next_placeholder)?);
        }
        if !predicates.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&predicates.join(" and "));
        }

        let mut order_terms = Vec::new();
        let mut orders_root_id = false;
        for order in query.order() {
            if order.path == tree.root().descriptor.id.name {
                orders_root_id = true;
            }
            let column = tree.resolve_column(&order.path)?;
            order_terms.push(if order.descending {
                format!("{column} desc")
            } else {
                column
            });
        }
        // With a to-many fetch, rows of one root object must arrive
        // contiguously; ordering by the root id guarantees it.
        if tree.has_many() && !orders_root_id {
            order_terms.push(format!(
                "{}.{}",
                tree.root().alias,
                tree.root().descriptor.id.column
            ));
        }
        if !order_terms.is_empty() {
            sql.push_str(" order by ");
            sql.push_str(&order_terms.join(", "));
        }

        if let Some(max_rows) = query.max_rows_count() {
            // One probe row beyond the cap, so the result can report
            // whether more rows existed. With a to-many join one object
            // spans several rows, so the cap is enforced per object during
            // hydration instead of as a row limit.
            if !tree.has_many() {
                sql.push_str(&format!(" limit {}", max_rows + 1));
            }
        }
        if query.first_row_count() > 0 {
            sql.push_str(&format!(" offset {}", query.first_row_count()));
        }

        debug!(shape, sql = %sql, "built query plan");
        Ok(Self {
            shape,
            sql,
            tree,
            executions: AtomicU64::new(0),
            total_micros: AtomicU64::new(0),
            max_micros: AtomicU64::new(0),
            total_rows: AtomicU64::new(0),
        })
    }

    /// The shape hash this plan was built for.
    pub fn shape(&self) -> u64 {
        self.shape
    }

    /// The generated SQL.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// The hydration tree.
    pub fn tree(&self) -> &SqlTree {
        &self.tree
    }

    /// Record one execution.
    pub fn record_execution(&self, elapsed: Duration, rows_read: u64) {
        let micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX);
        self.executions.fetch_add(1, Ordering::Relaxed);
        self.total_micros.fetch_add(micros, Ordering::Relaxed);
        self.max_micros.fetch_max(micros, Ordering::Relaxed);
        self.total_rows.fetch_add(rows_read, Ordering::Relaxed);
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> PlanStatsSnapshot {
        let executions = self.executions.load(Ordering::Relaxed);
        let total_micros = self.total_micros.load(Ordering::Relaxed);
        PlanStatsSnapshot {
            shape: self.shape,
            sql: self.sql.clone(),
            executions,
            total_micros,
            max_micros: self.max_micros.load(Ordering::Relaxed),
            avg_micros: if executions == 0 {
                0
            } else {
                total_micros / executions
            },
            total_rows: self.total_rows.load(Ordering::Relaxed),
        }
    }
}

/// Bounded cache of compiled plans, keyed by shape hash.
///
/// Concurrent lookups for the same shape build the plan at most once: the
/// first caller builds under a per-shape slot lock while others wait, then
/// read the cached plan. A failed build leaves no entry behind, so the next
/// caller retries.
#[derive(Debug)]
pub struct PlanCache {
    cache: BoundedCache<u64, Arc<QueryPlan>>,
    building: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl PlanCache {
    /// Create a cache bounded to `max_plans` compiled plans.
    #[must_use]
    pub fn new(max_plans: usize) -> Self {
        Self {
            cache: BoundedCache::with_eviction_listener(max_plans, |shape: &u64, plan: &Arc<QueryPlan>| {
                debug!(shape = *shape, sql = %plan.sql(), "evicted query plan");
            }),
            building: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch the plan for a query, building it on first use.
    pub fn get_or_build(
        &self,
        registry: &MappingRegistry,
        query: &Query,
    ) -> Result<Arc<QueryPlan>> {
        let shape = query.shape_hash();
        if let Some(plan) = self.cache.get(&shape) {
            return Ok(plan);
        }

        let slot = {
            let mut building = self.building.lock().expect("lock poisoned");
            Arc::clone(building.entry(shape).or_default())
        };
        let guard = slot.lock().expect("lock poisoned");

        // Someone else may have built the plan while we waited for the slot.
        if let Some(plan) = self.cache.get(&shape) {
            drop(guard);
            return Ok(plan);
        }

        let result = QueryPlan::build(registry, query).map(Arc::new);
        if let Ok(plan) = &result {
            self.cache.put(shape, Arc::clone(plan));
        }
        drop(guard);
        self.building.lock().expect("lock poisoned").remove(&shape);
        result
    }

    /// Number of resident plans.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if the cache holds no plans.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drop all resident plans.
    pub fn clear(&self) {
        self.cache.clear();
    }

    /// Cache-level hit/miss/eviction counters.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Execution statistics for every resident plan.
    pub fn plan_stats(&self) -> Vec<PlanStatsSnapshot> {
        self.cache
            .entries()
            .into_iter()
            .map(|(_, plan)| plan.stats())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Expr;
    use beanorm_core::{AssocKind, AssocMeta, BeanDescriptor, JoinPair, PropertyMeta, Value};

    fn registry() -> MappingRegistry {
        let mut registry = MappingRegistry::new();
        registry.register(
            BeanDescriptor::new("OrderDetail", "o_order_detail", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("qty", "order_qty")),
        );
        registry.register(
            BeanDescriptor::new("Order", "o_order", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("status", "status"))
                .assoc(AssocMeta::new(
                    "details",
                    AssocKind::HasMany,
                    "OrderDetail",
                    JoinPair::new("id", "order_id"),
                )),
        );
        registry
    }

    #[test]
    fn test_simple_plan_sql() {
        let registry = registry();
        let query = Query::new("Order").filter(Expr::eq("status", Value::from("NEW")));
        let plan = QueryPlan::build(&registry, &query).unwrap();
        assert_eq!(
            plan.sql(),
            "select t0.id, t0.status from o_order t0 where t0.status = $1"
        );
    }

    #[test]
    fn test_many_fetch_appends_root_id_order() {
        let registry = registry();
        let query = Query::new("Order").fetch("details");
        let plan = QueryPlan::build(&registry, &query).unwrap();
        assert_eq!(
            plan.sql(),
            "select t0.id, t0.status, t1.id, t1.order_qty \
             from o_order t0 left join o_order_detail t1 on t1.order_id = t0.id \
             order by t0.id"
        );
    }

    #[test]
    fn test_explicit_root_id_order_not_duplicated() {
        let registry = registry();
        let query = Query::new("Order").fetch("details").order_by_desc("id");
        let plan = QueryPlan::build(&registry, &query).unwrap();
        assert!(plan.sql().ends_with("order by t0.id desc"));
    }

    #[test]
    fn test_paging_renders_probe_row() {
        let registry = registry();
        let query = Query::new("Order").max_rows(10).first_row(5);
        let plan = QueryPlan::build(&registry, &query).unwrap();
        assert!(plan.sql().ends_with("limit 11 offset 5"));
    }

    #[test]
    fn test_fan_out_cap_is_not_a_row_limit() {
        let registry = registry();
        let query = Query::new("Order").fetch("details").max_rows(2);
        let plan = QueryPlan::build(&registry, &query).unwrap();
        // A row limit would truncate a boundary object's collection and
        // swallow the has-more probe; the object cap lives in hydration.
        assert!(!plan.sql().contains(" limit"), "unexpected sql: {}", plan.sql());
    }

    #[test]
    fn test_distinct() {
        let registry = registry();
        let plan = QueryPlan::build(&registry, &Query::new("Order").distinct()).unwrap();
        assert!(plan.sql().starts_with("select distinct "));
    }

    #[test]
    fn test_execution_stats() {
        let registry = registry();
        let plan = QueryPlan::build(&registry, &Query::new("Order")).unwrap();

        plan.record_execution(Duration::from_micros(100), 3);
        plan.record_execution(Duration::from_micros(300), 7);

        let stats = plan.stats();
        assert_eq!(stats.executions, 2);
        assert_eq!(stats.total_micros, 400);
        assert_eq!(stats.max_micros, 300);
        assert_eq!(stats.avg_micros, 200);
        assert_eq!(stats.total_rows, 10);
    }

    #[test]
    fn test_cache_builds_once_per_shape() {
        let registry = registry();
        let cache = PlanCache::new(8);

        let a = cache
            .get_or_build(&registry, &Query::new("Order").fetch("details"))
            .unwrap();
        let b = cache
            .get_or_build(&registry, &Query::new("Order").fetch("details"))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);

        let stats = cache.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_failed_build_leaves_no_entry() {
        let registry = registry();
        let cache = PlanCache::new(8);
        let bad = Query::new("Order").fetch("bogus");

        assert!(cache.get_or_build(&registry, &bad).is_err());
        assert!(cache.is_empty());
        // The shape is retryable once the mapping problem is fixed.
        assert!(cache.get_or_build(&registry, &bad).is_err());
    }

    #[test]
    fn test_concurrent_lookups_share_one_plan() {
        let registry = Arc::new(registry());
        let cache = Arc::new(PlanCache::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    cache
                        .get_or_build(&registry, &Query::new("Order").fetch("details"))
                        .unwrap()
                })
            })
            .collect();
        let plans: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(plans.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_plan_stats_listing() {
        let registry = registry();
        let cache = PlanCache::new(8);
        let plan = cache.get_or_build(&registry, &Query::new("Order")).unwrap();
        plan.record_execution(Duration::from_micros(50), 1);

        let all = cache.plan_stats();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].executions, 1);
    }
}
