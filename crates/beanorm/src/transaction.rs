//! Transactions: the working unit combining a driver connection, the
//! per-transaction identity map, and the batch write controller.
//!
//! Reads see writes: every find flushes pending batched writes before
//! executing, so a query observes everything saved earlier in the same
//! transaction.
//!
//! Cascade depths are relative to the bean passed to [`Transaction::save`]
//! (depth 0): referenced parents persist at depth -1, owned children at
//! depth +1. Delete cascades invert this so children flush before their
//! parents.

use crate::database::Database;
use beanorm_core::{
    AssocKind, Bean, BeanCollection, BeanDescriptor, BeanRef, CancelHandle, Connection, Error,
    ExecutionErrorKind, Result, Value,
};
use beanorm_plan::{Expr, Query, QueryPlan};
use beanorm_session::hydrate::{BackgroundFetch, LoadedGraph, LoaderConfig, ObjectGraphLoader};
use beanorm_session::{BatchControl, PersistKind, PersistRequest, PersistenceContext};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// One unit of work over a driver connection.
pub struct Transaction<'a> {
    db: &'a Database,
    conn: Box<dyn Connection>,
    batch: BatchControl,
    context: PersistenceContext,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(db: &'a Database, conn: Box<dyn Connection>) -> Self {
        let config = db.config();
        Self {
            db,
            conn,
            batch: BatchControl::new(config.batch_size, Arc::clone(&config.invalidation)),
            context: PersistenceContext::new(),
        }
    }

    /// Execute a query and return the distinct root objects in row order.
    pub fn find(&mut self, query: &Query) -> Result<Vec<BeanRef>> {
        Ok(self.load_graph(query)?.beans)
    }

    /// Execute a query and return the result collection, which also carries
    /// the `has_more` flag and map-key access.
    ///
    /// When a background-fetch threshold applies (from the query, or the
    /// database default) the collection returns once that many objects are
    /// loaded, still unfinished; a background thread fills the rest and
    /// marks it finished.
    pub fn find_collection(&mut self, query: &Query) -> Result<Arc<BeanCollection>> {
        if self.background_threshold(query).is_some() {
            let (fetch, _cancel) = self.find_background(query)?;
            return Ok(Arc::clone(fetch.collection()));
        }
        Ok(self.load_graph(query)?.collection)
    }

    /// Execute a query expected to match at most one object.
    pub fn find_unique(&mut self, query: &Query) -> Result<Option<BeanRef>> {
        let mut beans = self.find(query)?;
        match beans.len() {
            0 => Ok(None),
            1 => Ok(beans.pop()),
            rows => Err(Error::NotUnique { rows }),
        }
    }

    /// Find one bean by id. A live instance in the identity map is returned
    /// without touching the database.
    pub fn find_by_id(
        &mut self,
        bean_type: &str,
        id: impl Into<Value>,
    ) -> Result<Option<BeanRef>> {
        let id = id.into();
        if let Some(existing) = self.context.get(bean_type, &id) {
            return Ok(Some(existing));
        }
        let descriptor = self.db.registry().descriptor(bean_type)?;
        let query = Query::new(bean_type).filter(Expr::eq(descriptor.id.name.clone(), id));
        self.find_unique(&query)
    }

    /// Stream a query, visiting each object without retaining the result
    /// collection. Scanned objects register in the identity map like any
    /// other find, so a later save of one of them is an update.
    pub fn find_each(
        &mut self,
        query: &Query,
        listener: impl FnMut(&BeanRef) -> Result<()>,
    ) -> Result<usize> {
        let (mut loader, plan, _cancel, started) = self.start_load(query)?;
        let result = loader.load_each(listener);
        // The identity map comes back even when the listener failed.
        self.context = loader.take_context();
        let count = result?;
        plan.record_execution(started.elapsed(), count as u64);
        Ok(count)
    }

    /// Count the objects a query would match, without hydrating them.
    pub fn find_count(&mut self, query: &Query) -> Result<u64> {
        self.batch.flush(&mut *self.conn)?;
        let plan = self
            .db
            .plan_cache(query.bean_type())
            .get_or_build(self.db.registry(), query)?;
        let tree = plan.tree();
        let root = tree.root();

        // A to-many join fans rows out; count distinct root ids instead.
        let count_term = if tree.has_many() || query.is_distinct() {
            format!("count(distinct {}.{})", root.alias, root.descriptor.id.column)
        } else {
            "count(*)".to_string()
        };
        let mut sql = format!("select {count_term} from {}", tree.from_clause());
        let mut predicates = tree.root_predicates();
        let binds = query.binds();
        if let Some(filter) = query.filter_expr() {
            let mut resolve = |path: &str| tree.resolve_column(path);
            let mut next_placeholder = 1;
            predicates.push(filter.render(&mut resolve, &mut next_placeholder)?);
        }
        if !predicates.is_empty() {
            sql.push_str(" where ");
            sql.push_str(&predicates.join(" and "));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        if let Some(timeout) = self.db.config().statement_timeout {
            stmt.set_timeout(Some(timeout));
        }
        let mut cursor = stmt
            .execute_query(&binds)
            .map_err(|e| e.with_sql_context(&sql, &binds))?;
        let row = cursor
            .next_row()
            .map_err(|e| e.with_sql_context(&sql, &binds))?
            .ok_or_else(|| {
                Error::execution(ExecutionErrorKind::Cursor, "count query returned no row")
            })?;
        let count = row.get_as::<i64>(0)?;
        cursor.close();
        Ok(u64::try_from(count).unwrap_or(0))
    }

    /// Execute a query with the leading objects fetched on this thread and
    /// the remainder filled in by a background thread. The threshold comes
    /// from the query's `background_fetch_after`, falling back to the
    /// database default, then zero (everything in the background).
    ///
    /// The identity map moves to the background thread with the loader;
    /// this transaction continues with a fresh one. The returned handle
    /// cancels the in-flight statement from any thread.
    pub fn find_background(
        &mut self,
        query: &Query,
    ) -> Result<(BackgroundFetch, CancelHandle)> {
        let foreground = self.background_threshold(query).unwrap_or(0);
        let (loader, _plan, cancel, _started) = self.start_load(query)?;
        let fetch = loader.load_background(foreground)?;
        Ok((fetch, cancel))
    }

    fn background_threshold(&self, query: &Query) -> Option<usize> {
        query
            .background_fetch_after_count()
            .or(self.db.config().background_fetch_after)
    }

    /// Queue a save of this bean and its reachable graph.
    ///
    /// A bean already registered in the identity map produces an update,
    /// anything else an insert. Referenced parents queue at depth -1 so
    /// they exist before the foreign keys that point at them.
    pub fn save(&mut self, bean: &BeanRef) -> Result<()> {
        let mut visited = Vec::new();
        self.save_at(bean, 0, None, &mut visited)
    }

    /// Queue a delete of this bean and its owned children. Children queue
    /// below their parent's depth so they are removed first.
    pub fn delete(&mut self, bean: &BeanRef) -> Result<()> {
        let mut visited = Vec::new();
        self.delete_at(bean, 0, &mut visited)
    }

    /// Execute raw SQL through the batch controller: queued writes flush
    /// first so relative ordering is preserved.
    pub fn execute(&mut self, sql: &str, binds: &[Value]) -> Result<u64> {
        self.batch.execute_raw(&mut *self.conn, sql, binds)
    }

    /// Execute raw SQL without flushing queued writes first, explicitly
    /// allowing the statement to mix with pending bean writes.
    pub fn execute_mixed(&mut self, sql: &str, binds: &[Value]) -> Result<u64> {
        self.batch.execute_raw_mixed(&mut *self.conn, sql, binds)
    }

    /// Flush all queued writes in dependency order.
    pub fn flush(&mut self) -> Result<()> {
        self.batch.flush(&mut *self.conn)
    }

    /// Number of queued, unflushed writes.
    pub fn pending_writes(&self) -> usize {
        self.batch.pending()
    }

    /// The identity map.
    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    fn load_graph(&mut self, query: &Query) -> Result<LoadedGraph> {
        let (loader, plan, _cancel, started) = self.start_load(query)?;
        let mut graph = loader.load_all()?;
        plan.record_execution(started.elapsed(), graph.rows_read as u64);
        // The identity map comes back for the rest of the transaction.
        self.context = std::mem::take(&mut graph.context);
        Ok(graph)
    }

    fn start_load(
        &mut self,
        query: &Query,
    ) -> Result<(ObjectGraphLoader, Arc<QueryPlan>, CancelHandle, Instant)> {
        // Read-your-writes: queued changes must be visible to this query.
        self.batch.flush(&mut *self.conn)?;
        let plan = self
            .db
            .plan_cache(query.bean_type())
            .get_or_build(self.db.registry(), query)?;
        let binds = query.binds();

        let mut stmt = self.conn.prepare(plan.sql())?;
        if let Some(timeout) = self.db.config().statement_timeout {
            stmt.set_timeout(Some(timeout));
        }
        let cancel = stmt.cancel_handle();
        let started = Instant::now();
        let cursor = stmt
            .execute_query(&binds)
            .map_err(|e| e.with_sql_context(plan.sql(), &binds))?;

        let config = LoaderConfig {
            max_rows: query.max_rows_count(),
            map_key: query.map_key_property().map(ToString::to_string),
            binds,
            convert: Arc::clone(&self.db.config().convert),
            cancel: cancel.clone(),
        };
        let context = std::mem::take(&mut self.context);
        let loader = ObjectGraphLoader::new(Arc::clone(&plan), cursor, context, config);
        Ok((loader, plan, cancel, started))
    }

    fn save_at(
        &mut self,
        bean: &BeanRef,
        depth: i32,
        cascade_fk: Option<(String, Value)>,
        visited: &mut Vec<usize>,
    ) -> Result<()> {
        let ptr = Arc::as_ptr(bean) as usize;
        if visited.contains(&ptr) {
            return Ok(());
        }
        visited.push(ptr);

        let bean_type = bean.read().expect("lock poisoned").bean_type().to_string();
        let descriptor = self.db.registry().descriptor(&bean_type)?;
        let id = self.require_id(&descriptor, bean)?;

        // Referenced parents first, one level up the dependency order.
        for assoc in &descriptor.assocs {
            if assoc.kind == AssocKind::BelongsTo {
                let parent = bean.read().expect("lock poisoned").one(&assoc.name).cloned();
                if let Some(parent) = parent {
                    self.save_at(&parent, depth - 1, None, visited)?;
                }
            }
        }

        let is_update = self.context.get(&bean_type, &id).is_some();
        let request = if is_update {
            self.update_request(&descriptor, bean, &id, depth, cascade_fk)?
        } else {
            Some(self.insert_request(&descriptor, bean, &id, depth, cascade_fk)?)
        };
        if let Some(request) = request {
            debug!(
                bean_type = %bean_type,
                depth,
                kind = ?request.kind,
                "queued bean write"
            );
            self.batch.enqueue(&mut *self.conn, request)?;
        }
        if !is_update {
            self.context.put(&bean_type, id.clone(), bean.clone());
        }

        // Owned children and link rows below, one level down.
        for assoc in &descriptor.assocs {
            match assoc.kind {
                AssocKind::HasMany => {
                    let children = bean
                        .read()
                        .expect("lock poisoned")
                        .many(&assoc.name)
                        .map(|c| c.items());
                    if let Some(children) = children {
                        for child in children {
                            self.save_at(
                                &child,
                                depth + 1,
                                Some((assoc.join.remote.clone(), id.clone())),
                                visited,
                            )?;
                        }
                    }
                }
                AssocKind::ManyToMany => {
                    let Some(link) = &assoc.link else { continue };
                    let targets = bean
                        .read()
                        .expect("lock poisoned")
                        .many(&assoc.name)
                        .map(|c| c.items());
                    if let Some(targets) = targets {
                        let target_desc = self.db.registry().descriptor(&assoc.target)?;
                        for target in targets {
                            self.save_at(&target, depth + 1, None, visited)?;
                            let target_id = self.require_id(&target_desc, &target)?;
                            self.batch.enqueue(
                                &mut *self.conn,
                                PersistRequest {
                                    kind: PersistKind::Insert,
                                    bean_type: link.table.clone(),
                                    table: link.table.clone(),
                                    depth: depth + 2,
                                    sql: format!(
                                        "insert into {} ({}, {}) values ($1, $2)",
                                        link.table, link.local_column, link.remote_column
                                    ),
                                    binds: vec![id.clone(), target_id],
                                },
                            )?;
                        }
                    }
                }
                AssocKind::BelongsTo => {}
            }
        }
        Ok(())
    }

    fn delete_at(
        &mut self,
        bean: &BeanRef,
        depth: i32,
        visited: &mut Vec<usize>,
    ) -> Result<()> {
        let ptr = Arc::as_ptr(bean) as usize;
        if visited.contains(&ptr) {
            return Ok(());
        }
        visited.push(ptr);

        let bean_type = bean.read().expect("lock poisoned").bean_type().to_string();
        let descriptor = self.db.registry().descriptor(&bean_type)?;
        let id = self.require_id(&descriptor, bean)?;

        for assoc in &descriptor.assocs {
            match assoc.kind {
                AssocKind::HasMany => {
                    let children = bean
                        .read()
                        .expect("lock poisoned")
                        .many(&assoc.name)
                        .map(|c| c.items());
                    if let Some(children) = children {
                        for child in children {
                            // Children flush before this bean.
                            self.delete_at(&child, depth - 1, visited)?;
                        }
                    }
                }
                AssocKind::ManyToMany => {
                    let Some(link) = &assoc.link else { continue };
                    self.batch.enqueue(
                        &mut *self.conn,
                        PersistRequest {
                            kind: PersistKind::Delete,
                            bean_type: link.table.clone(),
                            table: link.table.clone(),
                            depth: depth - 1,
                            sql: format!(
                                "delete from {} where {} = $1",
                                link.table, link.local_column
                            ),
                            binds: vec![id.clone()],
                        },
                    )?;
                }
                AssocKind::BelongsTo => {}
            }
        }

        self.batch.enqueue(
            &mut *self.conn,
            PersistRequest {
                kind: PersistKind::Delete,
                bean_type: bean_type.clone(),
                table: descriptor.base_table.clone(),
                depth,
                sql: format!(
                    "delete from {} where {} = $1",
                    descriptor.base_table, descriptor.id.column
                ),
                binds: vec![id.clone()],
            },
        )?;
        self.context.remove(&bean_type, &id);
        Ok(())
    }

    fn require_id(&self, descriptor: &BeanDescriptor, bean: &BeanRef) -> Result<Value> {
        let id = bean
            .read()
            .expect("lock poisoned")
            .get(&descriptor.id.name)
            .cloned()
            .unwrap_or(Value::Null);
        if id.is_null() {
            return Err(Error::Custom(format!(
                "cannot persist {}: property {} has no value",
                descriptor.bean_type, descriptor.id.name
            )));
        }
        Ok(id)
    }

    fn insert_request(
        &self,
        descriptor: &BeanDescriptor,
        bean: &BeanRef,
        id: &Value,
        depth: i32,
        cascade_fk: Option<(String, Value)>,
    ) -> Result<PersistRequest> {
        let convert = &self.db.config().convert;
        let guard = bean.read().expect("lock poisoned");

        let mut columns = vec![descriptor.id.column.clone()];
        let mut binds = vec![convert.to_db(&descriptor.id, id.clone())?];
        if let Some(disc) = &descriptor.discriminator {
            columns.push(disc.column.clone());
            binds.push(Value::Text(disc.value.clone()));
        }
        for prop in &descriptor.properties {
            if prop.formula.is_some() {
                continue; // derived, never written
            }
            columns.push(prop.column.clone());
            let value = guard.get(&prop.name).cloned().unwrap_or(Value::Null);
            binds.push(convert.to_db(prop, value)?);
        }
        for (column, value) in self.foreign_keys(descriptor, &guard)? {
            columns.push(column);
            binds.push(value);
        }
        if let Some((column, value)) = cascade_fk {
            if !columns.contains(&column) {
                columns.push(column);
                binds.push(value);
            }
        }

        let placeholders: Vec<String> = (1..=binds.len()).map(|i| format!("${i}")).collect();
        Ok(PersistRequest {
            kind: PersistKind::Insert,
            bean_type: descriptor.bean_type.clone(),
            table: descriptor.base_table.clone(),
            depth,
            sql: format!(
                "insert into {} ({}) values ({})",
                descriptor.base_table,
                columns.join(", "),
                placeholders.join(", ")
            ),
            binds,
        })
    }

    fn update_request(
        &self,
        descriptor: &BeanDescriptor,
        bean: &BeanRef,
        id: &Value,
        depth: i32,
        cascade_fk: Option<(String, Value)>,
    ) -> Result<Option<PersistRequest>> {
        let convert = &self.db.config().convert;
        let guard = bean.read().expect("lock poisoned");

        let mut assignments = Vec::new();
        let mut binds = Vec::new();
        for prop in &descriptor.properties {
            if prop.formula.is_some() {
                continue;
            }
            binds.push(convert.to_db(prop, guard.get(&prop.name).cloned().unwrap_or(Value::Null))?);
            assignments.push(format!("{} = ${}", prop.column, binds.len()));
        }
        for (column, value) in self.foreign_keys(descriptor, &guard)? {
            binds.push(value);
            assignments.push(format!("{column} = ${}", binds.len()));
        }
        if let Some((column, value)) = cascade_fk {
            if !assignments.iter().any(|a| a.starts_with(&column)) {
                binds.push(value);
                assignments.push(format!("{column} = ${}", binds.len()));
            }
        }
        if assignments.is_empty() {
            return Ok(None);
        }

        binds.push(convert.to_db(&descriptor.id, id.clone())?);
        Ok(Some(PersistRequest {
            kind: PersistKind::Update,
            bean_type: descriptor.bean_type.clone(),
            table: descriptor.base_table.clone(),
            depth,
            sql: format!(
                "update {} set {} where {} = ${}",
                descriptor.base_table,
                assignments.join(", "),
                descriptor.id.column,
                binds.len()
            ),
            binds,
        }))
    }

    /// Foreign key columns derived from attached to-one associations.
    fn foreign_keys(
        &self,
        descriptor: &BeanDescriptor,
        guard: &Bean,
    ) -> Result<Vec<(String, Value)>> {
        let mut out = Vec::new();
        for assoc in &descriptor.assocs {
            if assoc.kind != AssocKind::BelongsTo {
                continue;
            }
            if let Some(parent) = guard.one(&assoc.name) {
                let parent_desc = self.db.registry().descriptor(&assoc.target)?;
                let parent_id = parent
                    .read()
                    .expect("lock poisoned")
                    .get(&parent_desc.id.name)
                    .cloned()
                    .unwrap_or(Value::Null);
                out.push((assoc.join.local.clone(), parent_id));
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("database", &self.db.name())
            .field("pending_writes", &self.batch.pending())
            .field("context_size", &self.context.len())
            .finish_non_exhaustive()
    }
}
