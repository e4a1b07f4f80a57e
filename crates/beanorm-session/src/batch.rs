//! The batch write controller.
//!
//! Bean writes queue into buckets keyed by (cascade depth, bean type) and
//! flush in dependency order: ascending depth first, and inserts before
//! updates before deletes within a bucket. Parents persisted at a lower
//! depth therefore exist before children reference them, and children are
//! removed before their parents on delete.
//!
//! Consecutive statements with identical SQL inside one phase execute as a
//! single prepared-statement batch. Raw SQL runs through the controller
//! too: it flushes all queued bean writes first, so interleaved raw and
//! bean writes keep their relative order. A mixed variant skips that
//! flush for callers that explicitly allow the statement to run ahead of
//! queued writes.

use beanorm_core::{
    BatchError, CacheInvalidation, Connection, Error, NoopInvalidation, Result, Value,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

/// The kind of a queued bean write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistKind {
    /// Row insert.
    Insert,
    /// Row update.
    Update,
    /// Row delete.
    Delete,
}

/// One queued bean write.
#[derive(Debug, Clone)]
pub struct PersistRequest {
    /// What the statement does.
    pub kind: PersistKind,
    /// Bean type, part of the bucket key.
    pub bean_type: String,
    /// Base table, reported to cache invalidation after the flush.
    pub table: String,
    /// Cascade depth: negative toward parents, positive toward children.
    pub depth: i32,
    /// The generated statement.
    pub sql: String,
    /// Bind values.
    pub binds: Vec<Value>,
}

#[derive(Debug)]
struct QueuedStatement {
    sql: String,
    binds: Vec<Value>,
}

#[derive(Debug, Default)]
struct Bucket {
    table: String,
    inserts: Vec<QueuedStatement>,
    updates: Vec<QueuedStatement>,
    deletes: Vec<QueuedStatement>,
}

impl Bucket {
    fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len()
    }
}

/// Buffers bean writes and flushes them in dependency order.
pub struct BatchControl {
    buckets: BTreeMap<(i32, String), Bucket>,
    batch_size: usize,
    pending: usize,
    invalidation: Arc<dyn CacheInvalidation>,
}

impl std::fmt::Debug for BatchControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchControl")
            .field("batch_size", &self.batch_size)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Default for BatchControl {
    fn default() -> Self {
        Self::new(100, Arc::new(NoopInvalidation))
    }
}

impl BatchControl {
    /// Create a controller that flushes eagerly once `batch_size` writes
    /// are pending.
    #[must_use]
    pub fn new(batch_size: usize, invalidation: Arc<dyn CacheInvalidation>) -> Self {
        Self {
            buckets: BTreeMap::new(),
            batch_size: batch_size.max(1),
            pending: 0,
            invalidation,
        }
    }

    /// Number of queued writes.
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Queue one bean write. Reaching the batch size flushes the whole
    /// controller in depth order, not just the filling bucket.
    pub fn enqueue(&mut self, conn: &mut dyn Connection, request: PersistRequest) -> Result<()> {
        let key = (request.depth, request.bean_type);
        let bucket = self.buckets.entry(key).or_default();
        if bucket.table.is_empty() {
            bucket.table = request.table;
        }
        let queued = QueuedStatement {
            sql: request.sql,
            binds: request.binds,
        };
        match request.kind {
            PersistKind::Insert => bucket.inserts.push(queued),
            PersistKind::Update => bucket.updates.push(queued),
            PersistKind::Delete => bucket.deletes.push(queued),
        }
        self.pending += 1;
        if self.pending >= self.batch_size {
            self.flush(conn)?;
        }
        Ok(())
    }

    /// Execute raw SQL through the controller. Queued bean writes flush
    /// first, so the raw statement observes every write queued before it.
    pub fn execute_raw(
        &mut self,
        conn: &mut dyn Connection,
        sql: &str,
        binds: &[Value],
    ) -> Result<u64> {
        self.flush(conn)?;
        self.execute_raw_mixed(conn, sql, binds)
    }

    /// Execute raw SQL without flushing queued bean writes first. The
    /// caller explicitly allows the statement to mix with, and run ahead
    /// of, writes queued earlier.
    pub fn execute_raw_mixed(
        &mut self,
        conn: &mut dyn Connection,
        sql: &str,
        binds: &[Value],
    ) -> Result<u64> {
        let mut stmt = conn.prepare(sql)?;
        stmt.execute_update(binds)
            .map_err(|e| e.with_sql_context(sql, binds))
    }

    /// Flush every bucket: ascending depth, inserts then updates then
    /// deletes within each bucket. A failing bucket aborts the flush;
    /// later buckets are not attempted. Cache invalidation is notified
    /// once, with the distinct tables modified, only after every bucket
    /// succeeded.
    pub fn flush(&mut self, conn: &mut dyn Connection) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let buckets = std::mem::take(&mut self.buckets);
        let statements = self.pending;
        self.pending = 0;
        debug!(buckets = buckets.len(), statements, "flushing batch buckets");

        let mut tables = BTreeSet::new();
        for ((depth, bean_type), bucket) in buckets {
            let table = bucket.table.clone();
            let phases = [bucket.inserts, bucket.updates, bucket.deletes];
            for phase in phases {
                execute_grouped(conn, phase).map_err(|e| {
                    Error::Batch(BatchError {
                        table: table.clone(),
                        depth,
                        message: format!("write bucket for {bean_type} failed"),
                        source: Some(Box::new(e)),
                    })
                })?;
            }
            tables.insert(table);
        }
        self.invalidation.tables_modified(&tables);
        Ok(())
    }
}

/// Execute one phase, batching consecutive identical SQL on one prepared
/// statement.
fn execute_grouped(conn: &mut dyn Connection, statements: Vec<QueuedStatement>) -> Result<()> {
    let mut i = 0;
    while i < statements.len() {
        let sql = &statements[i].sql;
        let mut stmt = conn.prepare(sql)?;
        let mut j = i;
        while j < statements.len() && statements[j].sql == *sql {
            stmt.add_batch(&statements[j].binds)
                .map_err(|e| e.with_sql_context(sql, &statements[j].binds))?;
            j += 1;
        }
        stmt.execute_batch()
            .map_err(|e| e.with_sql_context(sql, &statements[i].binds))?;
        i = j;
    }
    Ok(())
}
