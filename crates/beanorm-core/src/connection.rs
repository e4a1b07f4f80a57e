//! Driver-facing traits.
//!
//! The engine drives a prepared-statement/cursor interface and never sees a
//! concrete driver. Drivers implement [`Connection`], [`Statement`], and
//! [`RowCursor`]; the engine owns statement lifetimes and closes cursors
//! deterministically.

use crate::Result;
use crate::descriptor::PropertyMeta;
use crate::row::Row;
use crate::value::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A handle for cancelling an in-flight statement from another thread.
///
/// Cancellation is cooperative: the executing side observes the flag between
/// cursor reads and surfaces a cancelled execution error.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancelHandle {
    /// Create a fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A forward-only cursor over query results.
pub trait RowCursor: Send {
    /// Read the next row, or `None` when the result set is exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Release the cursor. Safe to call more than once.
    fn close(&mut self);
}

/// A prepared statement.
pub trait Statement: Send {
    /// Execute as a query, producing a row cursor.
    fn execute_query(&mut self, params: &[Value]) -> Result<Box<dyn RowCursor>>;

    /// Execute as an update, returning the affected row count.
    fn execute_update(&mut self, params: &[Value]) -> Result<u64>;

    /// Add one set of bind parameters to the statement's pending batch.
    fn add_batch(&mut self, params: &[Value]) -> Result<()>;

    /// Execute the pending batch, returning per-entry affected row counts.
    fn execute_batch(&mut self) -> Result<Vec<u64>>;

    /// Set (or clear) the statement timeout.
    fn set_timeout(&mut self, timeout: Option<Duration>);

    /// Handle for cancelling this statement from another thread.
    fn cancel_handle(&self) -> CancelHandle;
}

/// A database connection owned by one transaction at a time.
pub trait Connection: Send {
    /// Prepare a statement for the given SQL.
    fn prepare(&mut self, sql: &str) -> Result<Box<dyn Statement>>;
}

/// Scalar conversion between database and bean representations.
///
/// The default implementation is a passthrough; deployments with encrypted
/// columns or non-native representations plug in their own.
pub trait ScalarConvert: Send + Sync {
    /// Convert a value read from the database into its bean representation.
    fn from_db(&self, _prop: &PropertyMeta, value: Value) -> Result<Value> {
        Ok(value)
    }

    /// Convert a bean property value into its bind representation.
    fn to_db(&self, _prop: &PropertyMeta, value: Value) -> Result<Value> {
        Ok(value)
    }
}

/// The identity scalar conversion.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughConvert;

impl ScalarConvert for PassthroughConvert {}

/// Notification target for tables modified by a flushed batch.
///
/// Called once per flush with the distinct set of modified base tables, after
/// all buckets executed successfully.
pub trait CacheInvalidation: Send + Sync {
    /// Receive the set of tables a flush modified.
    fn tables_modified(&self, tables: &BTreeSet<String>);
}

/// A cache invalidation sink that ignores all notifications.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopInvalidation;

impl CacheInvalidation for NoopInvalidation {
    fn tables_modified(&self, _tables: &BTreeSet<String>) {}
}
