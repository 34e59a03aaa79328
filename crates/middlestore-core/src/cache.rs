//! Identity-map storage.
//!
//! The store keeps committed objects in an [`ObjectCache`]. [`RetainCache`]
//! keeps every object alive for the store's lifetime; [`WeakCache`] only
//! remembers objects that something else still holds.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::object::{ObjectHandle, ObjectKey, PersistentObject};

/// Key to object map used as the store's identity map.
pub trait ObjectCache: Send + Sync {
    fn get(&self, key: &ObjectKey) -> Option<ObjectHandle>;

    /// Insert unless a live entry exists; returns the entry that is now cached.
    fn get_or_insert(&mut self, key: ObjectKey, object: ObjectHandle) -> ObjectHandle;

    fn remove(&mut self, key: &ObjectKey) -> Option<ObjectHandle>;

    /// All live objects.
    fn values(&self) -> Vec<ObjectHandle>;

    /// Number of live objects.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn clear(&mut self);
}

/// Holds strong handles; objects stay cached until removed.
#[derive(Debug, Default)]
pub struct RetainCache {
    objects: HashMap<ObjectKey, ObjectHandle>,
}

impl RetainCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectCache for RetainCache {
    fn get(&self, key: &ObjectKey) -> Option<ObjectHandle> {
        self.objects.get(key).cloned()
    }

    fn get_or_insert(&mut self, key: ObjectKey, object: ObjectHandle) -> ObjectHandle {
        Arc::clone(self.objects.entry(key).or_insert(object))
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<ObjectHandle> {
        self.objects.remove(key)
    }

    fn values(&self) -> Vec<ObjectHandle> {
        self.objects.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.objects.len()
    }

    fn clear(&mut self) {
        self.objects.clear();
    }
}

/// Holds weak handles; an entry disappears once its object is dropped.
#[derive(Debug, Default)]
pub struct WeakCache {
    objects: HashMap<ObjectKey, Weak<PersistentObject>>,
    inserts_since_prune: usize,
}

const PRUNE_INTERVAL: usize = 256;

impl WeakCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(&mut self) {
        self.objects.retain(|_, w| w.strong_count() > 0);
        self.inserts_since_prune = 0;
    }
}

impl ObjectCache for WeakCache {
    fn get(&self, key: &ObjectKey) -> Option<ObjectHandle> {
        self.objects.get(key).and_then(Weak::upgrade)
    }

    fn get_or_insert(&mut self, key: ObjectKey, object: ObjectHandle) -> ObjectHandle {
        if let Some(existing) = self.get(&key) {
            return existing;
        }
        self.inserts_since_prune += 1;
        if self.inserts_since_prune >= PRUNE_INTERVAL {
            self.prune();
        }
        self.objects.insert(key, Arc::downgrade(&object));
        object
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<ObjectHandle> {
        self.objects.remove(key).and_then(|w| w.upgrade())
    }

    fn values(&self) -> Vec<ObjectHandle> {
        self.objects.values().filter_map(Weak::upgrade).collect()
    }

    fn len(&self) -> usize {
        self.objects.values().filter(|w| w.strong_count() > 0).count()
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.inserts_since_prune = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AttrDef, KlassDef, ModelBuilder};

    fn object() -> ObjectHandle {
        let model = ModelBuilder::new("M")
            .klass(KlassDef::new("Thing").attr(AttrDef::int("n")))
            .build()
            .unwrap();
        PersistentObject::new(model.klass("Thing").unwrap())
    }

    #[test]
    fn test_retain_cache_keeps_objects() {
        let mut cache = RetainCache::new();
        let key = ObjectKey::new("Thing", 1);
        cache.get_or_insert(key.clone(), object());
        assert_eq!(cache.len(), 1);
        assert!(cache.get(&key).is_some());
    }

    #[test]
    fn test_get_or_insert_returns_existing() {
        let mut cache = RetainCache::new();
        let key = ObjectKey::new("Thing", 1);
        let first = cache.get_or_insert(key.clone(), object());
        let second = cache.get_or_insert(key, object());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_weak_cache_evicts_dropped_objects() {
        let mut cache = WeakCache::new();
        let key = ObjectKey::new("Thing", 1);
        let held = cache.get_or_insert(key.clone(), object());
        assert!(cache.get(&key).is_some());
        drop(held);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.len(), 0);

        let held = cache.get_or_insert(key.clone(), object());
        let again = cache.get_or_insert(key, object());
        assert!(Arc::ptr_eq(&held, &again));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut cache = WeakCache::new();
        let o = object();
        cache.get_or_insert(ObjectKey::new("Thing", 1), Arc::clone(&o));
        cache.get_or_insert(ObjectKey::new("Thing", 2), object());
        assert!(cache.remove(&ObjectKey::new("Thing", 1)).is_some());
        cache.clear();
        assert!(cache.is_empty());
    }
}
