//! Query definitions, hydration trees, and the query plan cache.
//!
//! A [`Query`] describes what to fetch: root bean type, selected properties,
//! fetch paths into associations, filter expressions, ordering, and paging.
//! Its structural identity is the shape hash; together with the bind hash it
//! identifies one logical execution.
//!
//! [`SqlTree`] is the compiled form of a query's object shape: a tree of
//! nodes mirroring the fetch-path graph, with column offsets assigned at
//! build time so hydration reads rows by index.
//!
//! [`QueryPlan`] pairs the generated SQL with its tree and accumulates
//! execution statistics. [`PlanCache`] bounds the number of live plans per
//! bean type and guarantees at most one build per shape.

pub mod expr;
pub mod lru;
pub mod plan;
pub mod query;
pub mod tree;

pub use expr::{CompareOp, Expr};
pub use lru::{BoundedCache, CacheStats};
pub use plan::{PlanCache, PlanStatsSnapshot, QueryPlan};
pub use query::{FetchPath, OrderProperty, PlanHasher, Query};
pub use tree::{NodeKind, SqlTree, SqlTreeNode};
