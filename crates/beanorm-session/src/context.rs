//! The per-transaction identity map.

use beanorm_core::{BeanRef, Value, hash_values};
use std::collections::HashMap;

/// One live bean instance per (bean type, id) within a transaction.
///
/// The context has exactly one owner at a time; it moves with the loader
/// when a fetch continues on a background thread, so no locking is needed.
/// Id values hash into buckets and compare by value inside the bucket, so
/// two equal ids always resolve to the same instance.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    map: HashMap<(String, u64), Vec<(Value, BeanRef)>>,
    size: usize,
}

impl PersistenceContext {
    /// Create an empty context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the live instance for an id.
    pub fn get(&self, bean_type: &str, id: &Value) -> Option<BeanRef> {
        let key = (bean_type.to_string(), id_hash(id));
        self.map.get(&key).and_then(|bucket| {
            bucket
                .iter()
                .find(|(existing, _)| existing == id)
                .map(|(_, bean)| bean.clone())
        })
    }

    /// Register an instance, replacing any previous one for the same id.
    pub fn put(&mut self, bean_type: &str, id: Value, bean: BeanRef) {
        let key = (bean_type.to_string(), id_hash(&id));
        let bucket = self.map.entry(key).or_default();
        if let Some(slot) = bucket.iter_mut().find(|(existing, _)| *existing == id) {
            slot.1 = bean;
        } else {
            bucket.push((id, bean));
            self.size += 1;
        }
    }

    /// Get the live instance for an id, creating and registering it on
    /// first sight. Returns the instance and whether it was created.
    pub fn get_or_put(
        &mut self,
        bean_type: &str,
        id: &Value,
        create: impl FnOnce() -> BeanRef,
    ) -> (BeanRef, bool) {
        if let Some(existing) = self.get(bean_type, id) {
            return (existing, false);
        }
        let bean = create();
        self.put(bean_type, id.clone(), bean.clone());
        (bean, true)
    }

    /// Evict one instance, e.g. after a delete.
    pub fn remove(&mut self, bean_type: &str, id: &Value) -> Option<BeanRef> {
        let key = (bean_type.to_string(), id_hash(id));
        let bucket = self.map.get_mut(&key)?;
        let index = bucket.iter().position(|(existing, _)| existing == id)?;
        self.size -= 1;
        Some(bucket.remove(index).1)
    }

    /// Number of registered instances.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Check if the context is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Drop every registered instance.
    pub fn clear(&mut self) {
        self.map.clear();
        self.size = 0;
    }
}

fn id_hash(id: &Value) -> u64 {
    hash_values(std::slice::from_ref(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beanorm_core::Bean;
    use std::sync::Arc;

    #[test]
    fn test_get_or_put_dedups() {
        let mut context = PersistenceContext::new();
        let id = Value::BigInt(1);

        let (first, created) =
            context.get_or_put("Order", &id, || Bean::new("Order").into_ref());
        assert!(created);

        let (second, created) =
            context.get_or_put("Order", &id, || Bean::new("Order").into_ref());
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn test_same_id_different_type() {
        let mut context = PersistenceContext::new();
        let id = Value::BigInt(1);
        context.put("Order", id.clone(), Bean::new("Order").into_ref());
        context.put("Customer", id.clone(), Bean::new("Customer").into_ref());

        assert_eq!(context.len(), 2);
        let order = context.get("Order", &id).unwrap();
        let customer = context.get("Customer", &id).unwrap();
        assert!(!Arc::ptr_eq(&order, &customer));
    }

    #[test]
    fn test_put_replaces() {
        let mut context = PersistenceContext::new();
        let id = Value::BigInt(1);
        context.put("Order", id.clone(), Bean::new("Order").into_ref());

        let replacement = Bean::new("Order").into_ref();
        context.put("Order", id.clone(), replacement.clone());

        assert_eq!(context.len(), 1);
        assert!(Arc::ptr_eq(&context.get("Order", &id).unwrap(), &replacement));
    }

    #[test]
    fn test_remove() {
        let mut context = PersistenceContext::new();
        let id = Value::Text("k-1".to_string());
        context.put("Customer", id.clone(), Bean::new("Customer").into_ref());

        assert!(context.remove("Customer", &id).is_some());
        assert!(context.get("Customer", &id).is_none());
        assert!(context.is_empty());
        assert!(context.remove("Customer", &id).is_none());
    }

    #[test]
    fn test_text_and_numeric_ids_do_not_collide() {
        let mut context = PersistenceContext::new();
        context.put("Order", Value::BigInt(1), Bean::new("Order").into_ref());
        context.put(
            "Order",
            Value::Text("1".to_string()),
            Bean::new("Order").into_ref(),
        );
        assert_eq!(context.len(), 2);
    }
}
