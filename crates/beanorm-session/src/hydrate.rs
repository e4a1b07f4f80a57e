//! Object graph hydration.
//!
//! [`ObjectGraphLoader`] turns flat cursor rows into distinct object graphs.
//! With a to-many fetch, one root object spans several consecutive rows; the
//! loader reads one row ahead to detect where the next root object starts,
//! so it never needs to rewind the cursor.
//!
//! Rows for one root object must arrive contiguously (the plan orders by
//! the root id whenever a to-many join is present). A row for an already
//! completed root object is an internal consistency error, not a recoverable
//! condition.

use crate::context::PersistenceContext;
use beanorm_core::{
    Bean, BeanCollection, BeanRef, CancelHandle, Error, ExecutionErrorKind, PassthroughConvert,
    Result, Row, RowCursor, ScalarConvert, Value, hash_values,
};
use beanorm_plan::{NodeKind, QueryPlan, SqlTreeNode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// The loader's read state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// No row has been read yet.
    Init,
    /// A row is loaded and waiting to start the next root object.
    RowLoaded,
    /// Rows are being merged into the current root object.
    Accumulating,
    /// The cursor is exhausted, cancelled, or capped; it has been closed.
    Done,
}

/// Per-execution loader settings, derived from the query.
pub struct LoaderConfig {
    /// Cap on distinct result objects; one extra row is probed to report
    /// whether more data existed.
    pub max_rows: Option<usize>,
    /// Root property to key the result collection by.
    pub map_key: Option<String>,
    /// Bind values of the execution, for error context.
    pub binds: Vec<Value>,
    /// Scalar conversion applied to every column read.
    pub convert: Arc<dyn ScalarConvert>,
    /// Cooperative cancellation flag, checked between rows.
    pub cancel: CancelHandle,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            max_rows: None,
            map_key: None,
            binds: Vec::new(),
            convert: Arc::new(PassthroughConvert),
            cancel: CancelHandle::new(),
        }
    }
}

impl std::fmt::Debug for LoaderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoaderConfig")
            .field("max_rows", &self.max_rows)
            .field("map_key", &self.map_key)
            .field("binds", &self.binds)
            .finish_non_exhaustive()
    }
}

/// A completed (or still filling) load: the shared result collection, the
/// items read so far, and the identity map handed back for reuse.
#[derive(Debug)]
pub struct LoadedGraph {
    /// The result collection.
    pub collection: Arc<BeanCollection>,
    /// The distinct root objects, in row order.
    pub beans: Vec<BeanRef>,
    /// The identity map, returned to the owning transaction.
    pub context: PersistenceContext,
    /// Rows consumed from the cursor.
    pub rows_read: usize,
}

/// A fetch continuing on a background thread.
///
/// The foreground holds only the shared collection; the loader, its cursor,
/// and the identity map all moved to the background thread.
#[derive(Debug)]
pub struct BackgroundFetch {
    collection: Arc<BeanCollection>,
    handle: Option<std::thread::JoinHandle<Result<usize>>>,
}

impl BackgroundFetch {
    /// The shared result collection; poll [`BeanCollection::is_finished`]
    /// to observe completion.
    pub fn collection(&self) -> &Arc<BeanCollection> {
        &self.collection
    }

    /// Wait for the background thread, returning the number of objects it
    /// added. Returns immediately when the fetch completed in the
    /// foreground.
    pub fn join(mut self) -> Result<usize> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Custom("background fetch thread panicked".to_string()))?,
            None => Ok(0),
        }
    }
}

/// Drives a result cursor through the hydration tree.
///
/// The loader exclusively owns the cursor and the identity map; it is the
/// single writer for the duration of the fetch, including after a hand-off
/// to a background thread.
pub struct ObjectGraphLoader {
    plan: Arc<QueryPlan>,
    cursor: Box<dyn RowCursor>,
    context: PersistenceContext,
    config: LoaderConfig,
    collection: Arc<BeanCollection>,
    state: ReadState,
    pending: Option<Row>,
    completed: IdSet,
    object_count: usize,
    row_count: usize,
}

impl ObjectGraphLoader {
    /// Create a loader over an executed cursor.
    pub fn new(
        plan: Arc<QueryPlan>,
        cursor: Box<dyn RowCursor>,
        context: PersistenceContext,
        config: LoaderConfig,
    ) -> Self {
        Self {
            plan,
            cursor,
            context,
            config,
            collection: Arc::new(BeanCollection::new()),
            state: ReadState::Init,
            pending: None,
            completed: IdSet::default(),
            object_count: 0,
            row_count: 0,
        }
    }

    /// The current read state.
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// The shared result collection.
    pub fn collection(&self) -> &Arc<BeanCollection> {
        &self.collection
    }

    /// Read the next distinct root object, merging its fan-out rows.
    pub fn next_bean(&mut self) -> Result<Option<BeanRef>> {
        if self.state == ReadState::Done {
            return Ok(None);
        }
        let Some(first) = self.take_row()? else {
            self.finish();
            return Ok(None);
        };
        if let Some(max) = self.config.max_rows {
            if self.object_count >= max {
                // The probe row: the cap is reached and more data existed.
                self.collection.set_has_more(true);
                self.finish();
                return Ok(None);
            }
        }
        self.state = ReadState::RowLoaded;

        let plan = Arc::clone(&self.plan);
        let root = plan.tree().root();
        let root_id = first.get(root.id_index).cloned().unwrap_or(Value::Null);
        if root_id.is_null() {
            return Err(self.consistency("root id column is null"));
        }
        if self.completed.contains(&root_id) {
            return Err(self.consistency(
                "received a row for an already completed object; result rows are not contiguous",
            ));
        }

        let bean = hydrate_node(root, &first, &mut self.context, &*self.config.convert)?
            .ok_or_else(|| {
                Error::consistency(
                    "root node produced no bean for a non-null id",
                    self.plan.sql(),
                    &self.config.binds,
                )
            })?;
        self.state = ReadState::Accumulating;

        loop {
            let Some(row) = self.take_row()? else {
                break;
            };
            let next_id = row.get(root.id_index).cloned().unwrap_or(Value::Null);
            if next_id == root_id {
                hydrate_node(root, &row, &mut self.context, &*self.config.convert)?;
            } else {
                self.pending = Some(row);
                break;
            }
        }

        finish_collections(root, &bean);
        self.completed.insert(root_id);
        self.object_count += 1;
        match &self.config.map_key {
            Some(property) => {
                let key = bean
                    .read()
                    .expect("lock poisoned")
                    .get(property)
                    .cloned()
                    .unwrap_or(Value::Null);
                self.collection.push_keyed(key, bean.clone());
            }
            None => self.collection.push(bean.clone()),
        }

        if self.pending.is_some() {
            self.state = ReadState::RowLoaded;
        } else {
            self.finish();
        }
        Ok(Some(bean))
    }

    /// Read every object, then hand the collection and identity map back.
    pub fn load_all(mut self) -> Result<LoadedGraph> {
        while self.next_bean()?.is_some() {}
        Ok(LoadedGraph {
            beans: self.collection.items(),
            collection: Arc::clone(&self.collection),
            context: std::mem::take(&mut self.context),
            rows_read: self.row_count,
        })
    }

    /// Visit every object without retaining the collection. Stops on the
    /// first listener error. Call [`ObjectGraphLoader::take_context`]
    /// afterwards to hand the identity map back to the owner.
    pub fn load_each(
        &mut self,
        mut listener: impl FnMut(&BeanRef) -> Result<()>,
    ) -> Result<usize> {
        let mut count = 0;
        while let Some(bean) = self.next_bean()? {
            listener(&bean)?;
            count += 1;
        }
        Ok(count)
    }

    /// Take the identity map back once the walk is over, including after
    /// a listener error.
    pub fn take_context(&mut self) -> PersistenceContext {
        std::mem::take(&mut self.context)
    }

    /// Read `foreground_objects` objects, then continue filling the same
    /// collection on a background thread. The loader, cursor, and identity
    /// map move to that thread.
    pub fn load_background(mut self, foreground_objects: usize) -> Result<BackgroundFetch> {
        let mut produced = 0;
        while produced < foreground_objects {
            if self.next_bean()?.is_none() {
                return Ok(BackgroundFetch {
                    collection: Arc::clone(&self.collection),
                    handle: None,
                });
            }
            produced += 1;
        }
        if self.state == ReadState::Done {
            return Ok(BackgroundFetch {
                collection: Arc::clone(&self.collection),
                handle: None,
            });
        }
        let collection = Arc::clone(&self.collection);
        let handle = std::thread::Builder::new()
            .name("beanorm-fetch".to_string())
            .spawn(move || self.run_to_completion())
            .map_err(|e| Error::Custom(format!("failed to spawn background fetch: {e}")))?;
        Ok(BackgroundFetch {
            collection,
            handle: Some(handle),
        })
    }

    fn run_to_completion(mut self) -> Result<usize> {
        let mut count = 0;
        loop {
            match self.next_bean() {
                Ok(Some(_)) => count += 1,
                Ok(None) => return Ok(count),
                Err(e) => {
                    warn!(error = %e, "background fetch failed");
                    // Waiters observe completion even on failure.
                    self.collection.mark_finished();
                    return Err(e);
                }
            }
        }
    }

    fn take_row(&mut self) -> Result<Option<Row>> {
        if let Some(row) = self.pending.take() {
            return Ok(Some(row));
        }
        if self.config.cancel.is_cancelled() {
            return Err(Error::execution_with_sql(
                ExecutionErrorKind::Cancelled,
                "query cancelled",
                self.plan.sql(),
                &self.config.binds,
            ));
        }
        let row = self
            .cursor
            .next_row()
            .map_err(|e| e.with_sql_context(self.plan.sql(), &self.config.binds))?;
        if row.is_some() {
            self.row_count += 1;
        }
        Ok(row)
    }

    fn consistency(&self, message: &str) -> Error {
        Error::consistency(message, self.plan.sql(), &self.config.binds)
    }

    fn finish(&mut self) {
        if self.state != ReadState::Done {
            self.state = ReadState::Done;
            self.cursor.close();
            self.collection.mark_finished();
            debug!(
                rows = self.row_count,
                objects = self.object_count,
                "object graph load complete"
            );
        }
    }
}

impl Drop for ObjectGraphLoader {
    fn drop(&mut self) {
        self.cursor.close();
    }
}

/// Hydrate one tree node from a row, registering the bean in the identity
/// map before recursing into children so cycles resolve to the same
/// instance.
fn hydrate_node(
    node: &SqlTreeNode,
    row: &Row,
    context: &mut PersistenceContext,
    convert: &dyn ScalarConvert,
) -> Result<Option<BeanRef>> {
    let id = row.get(node.id_index).cloned().unwrap_or(Value::Null);
    if id.is_null() {
        // An outer join produced no row at this node.
        return Ok(None);
    }
    let bean_type = &node.descriptor.bean_type;
    let (bean, created) =
        context.get_or_put(bean_type, &id, || Bean::new(bean_type.clone()).into_ref());
    if created {
        let mut guard = bean.write().expect("lock poisoned");
        guard.set(node.descriptor.id.name.clone(), id);
        for (prop, index) in &node.properties {
            let raw = row.get(*index).cloned().unwrap_or(Value::Null);
            guard.set(prop.name.clone(), convert.from_db(prop, raw)?);
        }
        // To-many associations outside the fetched graph get empty
        // placeholder collections, left unfinished for a later fetch.
        for assoc in &node.descriptor.assocs {
            if assoc.kind.is_to_many() && !node.fetches(&assoc.name) {
                guard.set_many(assoc.name.clone(), Arc::new(BeanCollection::new()));
            }
        }
    }
    for child in &node.children {
        let assoc_name = &child
            .assoc
            .as_ref()
            .expect("non-root node always has an association")
            .name;
        match child.kind {
            NodeKind::Bean => {
                if let Some(child_bean) = hydrate_node(child, row, context, convert)? {
                    bean.write()
                        .expect("lock poisoned")
                        .set_one(assoc_name.clone(), child_bean);
                }
            }
            NodeKind::ManyRoot => {
                let coll = {
                    let mut guard = bean.write().expect("lock poisoned");
                    match guard.many(assoc_name) {
                        Some(existing) => Arc::clone(existing),
                        None => {
                            let fresh = Arc::new(BeanCollection::new());
                            guard.set_many(assoc_name.clone(), Arc::clone(&fresh));
                            fresh
                        }
                    }
                };
                if let Some(child_bean) = hydrate_node(child, row, context, convert)? {
                    // Sibling fan-out repeats child rows; add each child once.
                    if !coll.contains(&child_bean) {
                        coll.push(child_bean);
                    }
                }
            }
        }
    }
    Ok(Some(bean))
}

/// Mark every collection under a completed root object as finished.
fn finish_collections(node: &SqlTreeNode, bean: &BeanRef) {
    for child in &node.children {
        let assoc_name = &child
            .assoc
            .as_ref()
            .expect("non-root node always has an association")
            .name;
        match child.kind {
            NodeKind::ManyRoot => {
                let coll = bean
                    .read()
                    .expect("lock poisoned")
                    .many(assoc_name)
                    .map(Arc::clone);
                if let Some(coll) = coll {
                    for item in coll.items() {
                        finish_collections(child, &item);
                    }
                    coll.mark_finished();
                }
            }
            NodeKind::Bean => {
                let one = bean
                    .read()
                    .expect("lock poisoned")
                    .one(assoc_name)
                    .cloned();
                if let Some(one) = one {
                    finish_collections(child, &one);
                }
            }
        }
    }
}

/// Set of id values, bucketed by hash and compared by value.
#[derive(Debug, Default)]
struct IdSet {
    buckets: HashMap<u64, Vec<Value>>,
}

impl IdSet {
    fn contains(&self, id: &Value) -> bool {
        self.buckets
            .get(&hash_values(std::slice::from_ref(id)))
            .is_some_and(|bucket| bucket.iter().any(|v| v == id))
    }

    fn insert(&mut self, id: Value) {
        if !self.contains(&id) {
            self.buckets
                .entry(hash_values(std::slice::from_ref(&id)))
                .or_default()
                .push(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanorm_core::{
        AssocKind, AssocMeta, BeanDescriptor, JoinPair, MappingRegistry, PropertyMeta,
    };
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn registry() -> MappingRegistry {
        let mut registry = MappingRegistry::new();
        registry.register(
            BeanDescriptor::new("Customer", "customer", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("name", "name")),
        );
        registry.register(
            BeanDescriptor::new("OrderDetail", "o_order_detail", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("qty", "order_qty")),
        );
        registry.register(
            BeanDescriptor::new("Order", "o_order", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("status", "status"))
                .assoc(AssocMeta::new(
                    "customer",
                    AssocKind::BelongsTo,
                    "Customer",
                    JoinPair::new("kcustomer_id", "id"),
                ))
                .assoc(AssocMeta::new(
                    "details",
                    AssocKind::HasMany,
                    "OrderDetail",
                    JoinPair::new("id", "order_id"),
                )),
        );
        registry
    }

    struct VecCursor {
        rows: VecDeque<Row>,
        closed: Arc<AtomicBool>,
    }

    impl VecCursor {
        fn boxed(rows: Vec<Row>) -> Box<dyn RowCursor> {
            Box::new(Self {
                rows: rows.into(),
                closed: Arc::new(AtomicBool::new(false)),
            })
        }

        fn with_flag(rows: Vec<Row>, closed: Arc<AtomicBool>) -> Box<dyn RowCursor> {
            Box::new(Self {
                rows: rows.into(),
                closed,
            })
        }
    }

    impl RowCursor for VecCursor {
        fn next_row(&mut self) -> Result<Option<Row>> {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(self.rows.pop_front())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn row(values: Vec<Value>) -> Row {
        let names = (0..values.len()).map(|i| format!("c{i}")).collect();
        Row::new(names, values)
    }

    fn details_plan() -> Arc<QueryPlan> {
        // Layout: t0.id(0), t0.status(1), t1.id(2), t1.order_qty(3)
        let query = beanorm_plan::Query::new("Order").fetch("details");
        Arc::new(QueryPlan::build(&registry(), &query).unwrap())
    }

    fn detail_rows() -> Vec<Row> {
        vec![
            row(vec![1.into(), "NEW".into(), 10.into(), 2.into()]),
            row(vec![1.into(), "NEW".into(), 11.into(), 3.into()]),
            row(vec![2.into(), "SHIPPED".into(), Value::Null, Value::Null]),
            row(vec![3.into(), "NEW".into(), 12.into(), 1.into()]),
            row(vec![3.into(), "NEW".into(), 13.into(), 1.into()]),
            row(vec![3.into(), "NEW".into(), 14.into(), 1.into()]),
            row(vec![3.into(), "NEW".into(), 15.into(), 1.into()]),
            row(vec![3.into(), "NEW".into(), 16.into(), 1.into()]),
        ]
    }

    fn detail_count(bean: &BeanRef) -> usize {
        bean.read()
            .unwrap()
            .many("details")
            .map_or(0, |c| c.len())
    }

    #[test]
    fn test_fan_out_collapses_into_distinct_objects() {
        let loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let graph = loader.load_all().unwrap();

        assert_eq!(graph.beans.len(), 3);
        assert_eq!(graph.rows_read, 8);
        assert_eq!(detail_count(&graph.beans[0]), 2);
        assert_eq!(detail_count(&graph.beans[1]), 0);
        assert_eq!(detail_count(&graph.beans[2]), 5);
        assert!(graph.collection.is_finished());
        assert!(!graph.collection.has_more());

        // The empty collection still exists and is marked finished.
        let second = graph.beans[1].read().unwrap();
        let details = second.many("details").unwrap();
        assert!(details.is_finished());
        assert!(details.is_empty());
        // The identity map holds 3 orders and 7 details.
        assert_eq!(graph.context.len(), 10);
    }

    #[test]
    fn test_scalar_properties_hydrated() {
        let loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let graph = loader.load_all().unwrap();

        let order = graph.beans[0].read().unwrap();
        assert_eq!(order.get("id"), Some(&Value::Int(1)));
        assert_eq!(order.get("status"), Some(&Value::Text("NEW".to_string())));

        let details = order.many("details").unwrap().items();
        let first = details[0].read().unwrap();
        assert_eq!(first.get("id"), Some(&Value::Int(10)));
        assert_eq!(first.get("qty"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_state_transitions_with_lookahead() {
        let mut loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        assert_eq!(loader.state(), ReadState::Init);

        // The first object ends when the lookahead row shows a new root id;
        // that row stays loaded for the next call.
        loader.next_bean().unwrap().unwrap();
        assert_eq!(loader.state(), ReadState::RowLoaded);

        loader.next_bean().unwrap().unwrap();
        loader.next_bean().unwrap().unwrap();
        assert_eq!(loader.state(), ReadState::Done);
        assert!(loader.next_bean().unwrap().is_none());
    }

    #[test]
    fn test_shared_to_one_resolves_to_same_instance() {
        // Layout: t0.id(0), t0.status(1), t1.id(2), t1.name(3)
        let query = beanorm_plan::Query::new("Order").fetch("customer");
        let plan = Arc::new(QueryPlan::build(&registry(), &query).unwrap());
        let rows = vec![
            row(vec![1.into(), "NEW".into(), 7.into(), "Rob".into()]),
            row(vec![2.into(), "NEW".into(), 7.into(), "Rob".into()]),
        ];
        let loader = ObjectGraphLoader::new(
            plan,
            VecCursor::boxed(rows),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let graph = loader.load_all().unwrap();

        let a = graph.beans[0].read().unwrap().one("customer").cloned().unwrap();
        let b = graph.beans[1].read().unwrap().one("customer").cloned().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.read().unwrap().get("name"), Some(&Value::Text("Rob".to_string())));
    }

    #[test]
    fn test_non_contiguous_rows_are_a_consistency_error() {
        let rows = vec![
            row(vec![1.into(), "NEW".into(), 10.into(), 2.into()]),
            row(vec![2.into(), "NEW".into(), Value::Null, Value::Null]),
            row(vec![1.into(), "NEW".into(), 11.into(), 3.into()]),
        ];
        let mut loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(rows),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        loader.next_bean().unwrap().unwrap();
        loader.next_bean().unwrap().unwrap();
        let err = loader.next_bean().unwrap_err();
        assert!(matches!(err, Error::Consistency(_)));
        // The error carries the generated SQL for diagnosis.
        assert!(err.to_string().contains("select "));
    }

    #[test]
    fn test_max_rows_probe_sets_has_more() {
        let config = LoaderConfig {
            max_rows: Some(2),
            ..LoaderConfig::default()
        };
        let loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            config,
        );
        let graph = loader.load_all().unwrap();

        assert_eq!(graph.beans.len(), 2);
        assert!(graph.collection.has_more());
        assert!(graph.collection.is_finished());
    }

    #[test]
    fn test_max_rows_exact_boundary_reports_no_more() {
        let config = LoaderConfig {
            max_rows: Some(3),
            ..LoaderConfig::default()
        };
        let loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            config,
        );
        let graph = loader.load_all().unwrap();

        assert_eq!(graph.beans.len(), 3);
        assert!(!graph.collection.has_more());
    }

    #[test]
    fn test_cancellation_between_rows() {
        let config = LoaderConfig::default();
        let cancel = config.cancel.clone();
        let mut loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            config,
        );
        loader.next_bean().unwrap().unwrap();

        cancel.cancel();
        let err = loader.next_bean().unwrap_err();
        assert!(err.is_interrupt());
    }

    #[test]
    fn test_load_each_visits_every_object() {
        let mut loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let mut statuses = Vec::new();
        let count = loader
            .load_each(|bean| {
                statuses.push(bean.read().unwrap().get("status").cloned());
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 3);
        assert_eq!(statuses.len(), 3);

        // The walk registered every instance; the map comes back whole.
        assert_eq!(loader.take_context().len(), 10);
    }

    #[test]
    fn test_take_context_returns_the_map_after_a_listener_error() {
        let mut loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let err = loader.load_each(|_| Err(Error::Custom("stop".to_string())));
        assert!(err.is_err());

        let context = loader.take_context();
        assert!(context.get("Order", &Value::Int(1)).is_some());
    }

    #[test]
    fn test_second_to_many_fetch_degrades_to_placeholder() {
        let mut registry = registry();
        registry.register(
            BeanDescriptor::new("Shipment", "shipment", PropertyMeta::new("id", "id"))
                .property(PropertyMeta::new("carrier", "carrier")),
        );
        registry.register(
            BeanDescriptor::new("BigOrder", "o_order", PropertyMeta::new("id", "id"))
                .assoc(AssocMeta::new(
                    "details",
                    AssocKind::HasMany,
                    "OrderDetail",
                    JoinPair::new("id", "order_id"),
                ))
                .assoc(AssocMeta::new(
                    "shipments",
                    AssocKind::HasMany,
                    "Shipment",
                    JoinPair::new("id", "order_id"),
                )),
        );
        // Only details joins; layout: t0.id(0), t1.id(1), t1.order_qty(2).
        let query = beanorm_plan::Query::new("BigOrder")
            .fetch("details")
            .fetch("shipments");
        let plan = Arc::new(QueryPlan::build(&registry, &query).unwrap());
        let rows = vec![row(vec![1.into(), 10.into(), 2.into()])];
        let loader = ObjectGraphLoader::new(
            plan,
            VecCursor::boxed(rows),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let graph = loader.load_all().unwrap();

        let order = graph.beans[0].read().unwrap();
        let details = order.many("details").unwrap();
        assert_eq!(details.len(), 1);
        assert!(details.is_finished());

        // The collection exists but stays unfinished until a later fetch
        // fills it.
        let shipments = order.many("shipments").unwrap();
        assert!(shipments.is_empty());
        assert!(!shipments.is_finished());
    }

    #[test]
    fn test_map_key_collection() {
        let config = LoaderConfig {
            map_key: Some("status".to_string()),
            ..LoaderConfig::default()
        };
        let loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            config,
        );
        let graph = loader.load_all().unwrap();

        let shipped = graph
            .collection
            .get_keyed(&Value::Text("SHIPPED".to_string()))
            .unwrap();
        assert_eq!(shipped.read().unwrap().get("id"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_background_fetch_continues_the_collection() {
        let loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let fetch = loader.load_background(1).unwrap();
        let collection = Arc::clone(fetch.collection());
        assert!(collection.len() >= 1);

        let added = fetch.join().unwrap();
        assert_eq!(added, 2);
        assert_eq!(collection.len(), 3);
        assert!(collection.is_finished());
    }

    #[test]
    fn test_background_fetch_completed_in_foreground() {
        let loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::boxed(detail_rows()),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        let fetch = loader.load_background(10).unwrap();
        assert!(fetch.collection().is_finished());
        assert_eq!(fetch.collection().len(), 3);
        assert_eq!(fetch.join().unwrap(), 0);
    }

    #[test]
    fn test_cursor_closed_when_loader_dropped_mid_stream() {
        let closed = Arc::new(AtomicBool::new(false));
        let mut loader = ObjectGraphLoader::new(
            details_plan(),
            VecCursor::with_flag(detail_rows(), Arc::clone(&closed)),
            PersistenceContext::new(),
            LoaderConfig::default(),
        );
        loader.next_bean().unwrap().unwrap();
        assert!(!closed.load(Ordering::SeqCst));

        drop(loader);
        assert!(closed.load(Ordering::SeqCst));
    }
}
