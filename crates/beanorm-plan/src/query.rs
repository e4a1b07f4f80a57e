//! Query definitions and plan identity hashing.

use crate::expr::Expr;
use beanorm_core::{Value, hash_values};
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

/// Incremental non-commutative hash for plan identity.
///
/// Parts are folded as `h = h * 31 + part`, so the same parts in a different
/// order produce a different hash. Strings are pre-hashed to a single part.
#[derive(Debug)]
pub struct PlanHasher {
    hash: u64,
}

impl PlanHasher {
    /// Start a fresh hash.
    #[must_use]
    pub fn new() -> Self {
        Self { hash: 17 }
    }

    /// Fold in one numeric part.
    pub fn add(&mut self, part: u64) {
        self.hash = self.hash.wrapping_mul(31).wrapping_add(part);
    }

    /// Fold in a string part.
    pub fn add_str(&mut self, s: &str) {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        s.hash(&mut hasher);
        self.add(hasher.finish());
    }

    /// Fold in a boolean part.
    pub fn add_bool(&mut self, b: bool) {
        self.add(u64::from(b));
    }

    /// The accumulated hash.
    #[must_use]
    pub fn finish(&self) -> u64 {
        self.hash
    }
}

impl Default for PlanHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// One association path to fetch eagerly, with an optional partial
/// property list for the target type.
#[derive(Debug, Clone)]
pub struct FetchPath {
    /// Dot-separated association path from the root, e.g. `details.product`.
    pub path: String,
    /// Properties to select on the path target; `None` selects all.
    pub properties: Option<Vec<String>>,
}

/// One ORDER BY entry.
#[derive(Debug, Clone)]
pub struct OrderProperty {
    /// Property path from the root, e.g. `id` or `customer.name`.
    pub path: String,
    /// Descending order when true.
    pub descending: bool,
}

/// A query definition: what to fetch, how to filter it, and how to page it.
///
/// The structural parts (everything that changes the generated SQL) feed the
/// shape hash, memoized on first use. Bind values feed the bind hash only.
/// Paging counts change the SQL, so they are part of the shape.
#[derive(Debug)]
pub struct Query {
    bean_type: String,
    select: Option<Vec<String>>,
    fetch_paths: Vec<FetchPath>,
    filter: Option<Expr>,
    order_by: Vec<OrderProperty>,
    first_row: usize,
    max_rows: Option<usize>,
    distinct: bool,
    map_key: Option<String>,
    background_after: Option<usize>,
    shape: OnceLock<u64>,
}

impl Query {
    /// Start a query over the given root bean type.
    pub fn new(bean_type: impl Into<String>) -> Self {
        Self {
            bean_type: bean_type.into(),
            select: None,
            fetch_paths: Vec::new(),
            filter: None,
            order_by: Vec::new(),
            first_row: 0,
            max_rows: None,
            distinct: false,
            map_key: None,
            background_after: None,
            shape: OnceLock::new(),
        }
    }

    /// Select only the named root properties (the id is always included).
    #[must_use]
    pub fn select(mut self, properties: &[&str]) -> Self {
        self.select = Some(properties.iter().map(ToString::to_string).collect());
        self
    }

    /// Eagerly fetch an association path with all target properties.
    #[must_use]
    pub fn fetch(mut self, path: impl Into<String>) -> Self {
        self.fetch_paths.push(FetchPath {
            path: path.into(),
            properties: None,
        });
        self
    }

    /// Eagerly fetch an association path with a partial property list.
    #[must_use]
    pub fn fetch_partial(mut self, path: impl Into<String>, properties: &[&str]) -> Self {
        self.fetch_paths.push(FetchPath {
            path: path.into(),
            properties: Some(properties.iter().map(ToString::to_string).collect()),
        });
        self
    }

    /// Add a filter expression, AND-combined with any existing filter.
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Order ascending by a property path.
    #[must_use]
    pub fn order_by(mut self, path: impl Into<String>) -> Self {
        self.order_by.push(OrderProperty {
            path: path.into(),
            descending: false,
        });
        self
    }

    /// Order descending by a property path.
    #[must_use]
    pub fn order_by_desc(mut self, path: impl Into<String>) -> Self {
        self.order_by.push(OrderProperty {
            path: path.into(),
            descending: true,
        });
        self
    }

    /// Skip the first `n` result objects.
    #[must_use]
    pub fn first_row(mut self, n: usize) -> Self {
        self.first_row = n;
        self
    }

    /// Cap the number of result objects; the fetch probes one row beyond the
    /// cap so the result can report whether more rows existed.
    #[must_use]
    pub fn max_rows(mut self, n: usize) -> Self {
        self.max_rows = Some(n);
        self
    }

    /// Select distinct rows.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Key the result collection by the given root property.
    #[must_use]
    pub fn map_key(mut self, property: impl Into<String>) -> Self {
        self.map_key = Some(property.into());
        self
    }

    /// After `n` foreground objects, continue the fetch on a background
    /// thread. Execution behavior only; the generated SQL is unchanged, so
    /// the threshold is not part of the shape.
    #[must_use]
    pub fn background_fetch_after(mut self, n: usize) -> Self {
        self.background_after = Some(n);
        self
    }

    /// The root bean type name.
    pub fn bean_type(&self) -> &str {
        &self.bean_type
    }

    /// The partial root select, when set.
    pub fn selected(&self) -> Option<&[String]> {
        self.select.as_deref()
    }

    /// The fetch paths, in declaration order.
    pub fn fetch_paths(&self) -> &[FetchPath] {
        &self.fetch_paths
    }

    /// The combined filter expression, when set.
    pub fn filter_expr(&self) -> Option<&Expr> {
        self.filter.as_ref()
    }

    /// The ORDER BY entries.
    pub fn order(&self) -> &[OrderProperty] {
        &self.order_by
    }

    /// Number of leading result objects to skip.
    pub fn first_row_count(&self) -> usize {
        self.first_row
    }

    /// The result object cap, when set.
    pub fn max_rows_count(&self) -> Option<usize> {
        self.max_rows
    }

    /// Whether the select is distinct.
    pub fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// The map-key property, when set.
    pub fn map_key_property(&self) -> Option<&str> {
        self.map_key.as_deref()
    }

    /// The background-fetch threshold, when set.
    pub fn background_fetch_after_count(&self) -> Option<usize> {
        self.background_after
    }

    /// Structural identity of this query: two queries with the same shape
    /// hash generate the same SQL and share one cached plan.
    ///
    /// Memoized on first call. [`Query::clone`] does not carry the memo.
    pub fn shape_hash(&self) -> u64 {
        *self.shape.get_or_init(|| {
            let mut h = PlanHasher::new();
            h.add_str(&self.bean_type);
            match &self.select {
                None => h.add_bool(false),
                Some(props) => {
                    h.add_bool(true);
                    h.add(props.len() as u64);
                    for p in props {
                        h.add_str(p);
                    }
                }
            }
            h.add(self.fetch_paths.len() as u64);
            for fetch in &self.fetch_paths {
                h.add_str(&fetch.path);
                match &fetch.properties {
                    None => h.add_bool(false),
                    Some(props) => {
                        h.add_bool(true);
                        for p in props {
                            h.add_str(p);
                        }
                    }
                }
            }
            match &self.filter {
                None => h.add_bool(false),
                Some(expr) => {
                    h.add_bool(true);
                    expr.shape_hash_into(&mut h);
                }
            }
            h.add(self.order_by.len() as u64);
            for order in &self.order_by {
                h.add_str(&order.path);
                h.add_bool(order.descending);
            }
            h.add(self.first_row as u64);
            match self.max_rows {
                None => h.add_bool(false),
                Some(n) => {
                    h.add_bool(true);
                    h.add(n as u64);
                }
            }
            h.add_bool(self.distinct);
            match &self.map_key {
                None => h.add_bool(false),
                Some(p) => {
                    h.add_bool(true);
                    h.add_str(p);
                }
            }
            h.finish()
        })
    }

    /// Bind values in placeholder order.
    pub fn binds(&self) -> Vec<Value> {
        let mut out = Vec::new();
        if let Some(expr) = &self.filter {
            expr.collect_binds(&mut out);
        }
        out
    }

    /// Hash of the bind values; with the shape hash this identifies one
    /// logical execution.
    pub fn bind_hash(&self) -> u64 {
        hash_values(&self.binds())
    }
}

impl Clone for Query {
    /// Detached copy for further mutation. The memoized shape hash is not
    /// carried over: builder calls on the copy change its shape.
    fn clone(&self) -> Self {
        Self {
            bean_type: self.bean_type.clone(),
            select: self.select.clone(),
            fetch_paths: self.fetch_paths.clone(),
            filter: self.filter.clone(),
            order_by: self.order_by.clone(),
            first_row: self.first_row,
            max_rows: self.max_rows,
            distinct: self.distinct,
            map_key: self.map_key.clone(),
            background_after: self.background_after,
            shape: OnceLock::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_hasher_order_sensitive() {
        let mut a = PlanHasher::new();
        a.add(1);
        a.add(2);
        let mut b = PlanHasher::new();
        b.add(2);
        b.add(1);
        assert_ne!(a.finish(), b.finish());
    }

    #[test]
    fn test_shape_hash_stable_across_instances() {
        let a = Query::new("Order").fetch("details").order_by("id");
        let b = Query::new("Order").fetch("details").order_by("id");
        assert_eq!(a.shape_hash(), b.shape_hash());
    }

    #[test]
    fn test_shape_hash_differs_on_structure() {
        let base = Query::new("Order");
        let with_fetch = Query::new("Order").fetch("details");
        let with_select = Query::new("Order").select(&["status"]);
        let distinct = Query::new("Order").distinct();
        assert_ne!(base.shape_hash(), with_fetch.shape_hash());
        assert_ne!(base.shape_hash(), with_select.shape_hash());
        assert_ne!(base.shape_hash(), distinct.shape_hash());
    }

    #[test]
    fn test_paging_is_part_of_the_shape() {
        // Limit and offset are rendered into the SQL, so two queries that
        // differ only in paging must not share a plan.
        let a = Query::new("Order").max_rows(10);
        let b = Query::new("Order").max_rows(20);
        let c = Query::new("Order").max_rows(10).first_row(5);
        assert_ne!(a.shape_hash(), b.shape_hash());
        assert_ne!(a.shape_hash(), c.shape_hash());
    }

    #[test]
    fn test_background_threshold_does_not_change_shape() {
        let a = Query::new("Order").fetch("details");
        let b = Query::new("Order").fetch("details").background_fetch_after(10);
        assert_eq!(a.shape_hash(), b.shape_hash());
        assert_eq!(b.background_fetch_after_count(), Some(10));
    }

    #[test]
    fn test_bind_values_do_not_change_shape() {
        let a = Query::new("Order").filter(Expr::eq("status", Value::from("NEW")));
        let b = Query::new("Order").filter(Expr::eq("status", Value::from("SHIPPED")));
        assert_eq!(a.shape_hash(), b.shape_hash());
        assert_ne!(a.bind_hash(), b.bind_hash());
    }

    #[test]
    fn test_filter_and_combines() {
        let q = Query::new("Order")
            .filter(Expr::eq("status", Value::from("NEW")))
            .filter(Expr::gt("id", Value::from(5_i64)));
        assert_eq!(q.binds().len(), 2);
    }

    #[test]
    fn test_clone_does_not_share_memoized_shape() {
        let a = Query::new("Order");
        let original = a.shape_hash();

        let b = a.clone().fetch("details");
        assert_ne!(b.shape_hash(), original);
        // The original keeps its memoized value.
        assert_eq!(a.shape_hash(), original);
    }
}
