//! Result hydration and batched writes.
//!
//! [`PersistenceContext`] is the per-transaction identity map: one live
//! instance per (bean type, id) for the life of a transaction.
//!
//! [`ObjectGraphLoader`] drives a result cursor through the hydration tree,
//! collapsing join fan-out into distinct object graphs with one row of
//! lookahead. It owns the cursor and the identity map exclusively; handing
//! the loader to a background thread hands both over with it.
//!
//! [`BatchControl`] buffers bean writes into (depth, type) buckets and
//! flushes them in dependency order: ascending depth, inserts before
//! updates before deletes, consecutive identical statements batched on one
//! prepared statement.

pub mod batch;
pub mod context;
pub mod hydrate;

pub use batch::{BatchControl, PersistKind, PersistRequest};
pub use context::PersistenceContext;
pub use hydrate::{BackgroundFetch, LoadedGraph, LoaderConfig, ObjectGraphLoader, ReadState};
