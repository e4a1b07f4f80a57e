//! Dynamic bean instances and shared collections.
//!
//! The engine reconstructs object graphs without generated accessors, so a
//! bean is a dynamic record: scalar property values plus attached to-one
//! references and to-many collections. Instances are shared through
//! `Arc<RwLock<_>>` so the identity map can hand out the same live object for
//! the same row-level entity.

use crate::value::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// A shared reference to a bean instance.
pub type BeanRef = Arc<RwLock<Bean>>;

/// One reconstructed bean instance.
#[derive(Debug, Default)]
pub struct Bean {
    bean_type: String,
    values: BTreeMap<String, Value>,
    ones: BTreeMap<String, BeanRef>,
    manys: BTreeMap<String, Arc<BeanCollection>>,
}

impl Bean {
    /// Create an empty bean of the given type.
    pub fn new(bean_type: impl Into<String>) -> Self {
        Self {
            bean_type: bean_type.into(),
            ..Self::default()
        }
    }

    /// The bean type name.
    pub fn bean_type(&self) -> &str {
        &self.bean_type
    }

    /// Set a scalar property value.
    pub fn set(&mut self, property: impl Into<String>, value: Value) {
        self.values.insert(property.into(), value);
    }

    /// Get a scalar property value.
    pub fn get(&self, property: &str) -> Option<&Value> {
        self.values.get(property)
    }

    /// Attach a to-one association.
    pub fn set_one(&mut self, property: impl Into<String>, bean: BeanRef) {
        self.ones.insert(property.into(), bean);
    }

    /// Get a to-one association.
    pub fn one(&self, property: &str) -> Option<&BeanRef> {
        self.ones.get(property)
    }

    /// Attach a to-many collection.
    pub fn set_many(&mut self, property: impl Into<String>, collection: Arc<BeanCollection>) {
        self.manys.insert(property.into(), collection);
    }

    /// Get a to-many collection.
    pub fn many(&self, property: &str) -> Option<&Arc<BeanCollection>> {
        self.manys.get(property)
    }

    /// Names of scalar properties currently set.
    pub fn property_names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Wrap this bean into a shared reference.
    #[must_use]
    pub fn into_ref(self) -> BeanRef {
        Arc::new(RwLock::new(self))
    }
}

/// A bean collection that can be observed while it is still being filled.
///
/// Only one thread writes at a time; ownership transfers from the foreground
/// fetch to the background fetch. Any thread may observe `is_finished`.
#[derive(Debug, Default)]
pub struct BeanCollection {
    inner: Mutex<CollectionInner>,
    finished: AtomicBool,
    has_more: AtomicBool,
}

#[derive(Debug, Default)]
struct CollectionInner {
    items: Vec<BeanRef>,
    keyed: Vec<(Value, BeanRef)>,
}

impl BeanCollection {
    /// Create an empty, unfinished collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a bean.
    pub fn push(&self, bean: BeanRef) {
        self.inner.lock().expect("lock poisoned").items.push(bean);
    }

    /// Append a bean under a map key (map-key property results).
    pub fn push_keyed(&self, key: Value, bean: BeanRef) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.items.push(Arc::clone(&bean));
        inner.keyed.push((key, bean));
    }

    /// Number of beans collected so far.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").items.len()
    }

    /// Check if the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the collected beans, in row order.
    pub fn items(&self) -> Vec<BeanRef> {
        self.inner.lock().expect("lock poisoned").items.clone()
    }

    /// Whether the collection already holds this exact instance.
    pub fn contains(&self, bean: &BeanRef) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .items
            .iter()
            .any(|b| Arc::ptr_eq(b, bean))
    }

    /// Look up a bean by its map key.
    pub fn get_keyed(&self, key: &Value) -> Option<BeanRef> {
        self.inner
            .lock()
            .expect("lock poisoned")
            .keyed
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, b)| Arc::clone(b))
    }

    /// Mark the collection as completely fetched.
    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }

    /// Whether fetching has completed (foreground or background).
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Record that the cursor held more rows beyond the max-rows cap.
    pub fn set_has_more(&self, has_more: bool) {
        self.has_more.store(has_more, Ordering::Release);
    }

    /// Whether the cursor held more rows beyond the max-rows cap.
    pub fn has_more(&self) -> bool {
        self.has_more.load(Ordering::Acquire)
    }
}
