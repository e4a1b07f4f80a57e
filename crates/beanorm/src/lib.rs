//! beanorm - an object-relational persistence engine.
//!
//! beanorm hydrates relational query results into object graphs and writes
//! object graphs back in dependency order:
//!
//! - Queries are plain definitions ([`Query`]) compiled once per structural
//!   shape into a cached [`QueryPlan`] with a hydration tree
//! - Result rows collapse into distinct object graphs with identity-map
//!   deduplication, streaming from a forward-only cursor
//! - Writes buffer into (cascade depth, bean type) buckets and flush in
//!   dependency order with prepared-statement batching
//!
//! # Quick Start
//!
//! ```ignore
//! use beanorm::{Database, DatabaseConfig, Expr, Query};
//!
//! let db = Database::new(registry, DatabaseConfig::new("orders"));
//! let mut txn = db.begin(driver_connection);
//!
//! let orders = txn.find(
//!     &Query::new("Order")
//!         .fetch("details")
//!         .filter(Expr::eq("status", "NEW"))
//!         .order_by("id"),
//! )?;
//!
//! for order in &orders {
//!     txn.save(order)?;
//! }
//! txn.flush()?;
//! ```
//!
//! Mapping metadata ([`BeanDescriptor`]) is resolved externally and handed
//! in through a [`MappingRegistry`]; drivers plug in behind the
//! [`Connection`] / [`Statement`] / [`RowCursor`] traits.

pub mod database;
pub mod transaction;

pub use beanorm_core::{
    AssocKind, AssocMeta, Bean, BeanCollection, BeanDescriptor, BeanRef, CacheInvalidation,
    CancelHandle, Connection, Discriminator, Error, JoinPair, LinkTable, MappingRegistry,
    NoopInvalidation, PassthroughConvert, PropertyMeta, Result, Row, RowCursor, ScalarConvert,
    Statement, Value,
};
pub use beanorm_plan::{
    CacheStats, Expr, FetchPath, PlanCache, PlanStatsSnapshot, Query, QueryPlan,
};
pub use beanorm_session::{BackgroundFetch, BatchControl, PersistenceContext};

pub use database::{Database, DatabaseConfig};
pub use transaction::Transaction;
