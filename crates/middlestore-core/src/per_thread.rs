//! Per-thread pending collections.
//!
//! Each thread accumulates its own new, deleted and changed objects so that
//! one thread's save does not commit another thread's half-finished work. In
//! non-threaded mode every thread shares a single slot.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use crate::object::{ObjectHandle, PersistentObject};

// ============================================================================
// Identity Set
// ============================================================================

/// Insertion-ordered set of objects compared by identity.
#[derive(Debug, Default, Clone)]
pub struct IdentitySet {
    items: Vec<ObjectHandle>,
    ids: HashSet<usize>,
}

fn identity(object: &PersistentObject) -> usize {
    std::ptr::from_ref(object) as usize
}

impl IdentitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the object was already present.
    pub fn insert(&mut self, object: &ObjectHandle) -> bool {
        if self.ids.insert(identity(object)) {
            self.items.push(Arc::clone(object));
            true
        } else {
            false
        }
    }

    pub fn contains(&self, object: &PersistentObject) -> bool {
        self.ids.contains(&identity(object))
    }

    pub fn remove(&mut self, object: &PersistentObject) -> bool {
        if self.ids.remove(&identity(object)) {
            let id = identity(object);
            self.items.retain(|o| identity(o) != id);
            true
        } else {
            false
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ObjectHandle> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn to_vec(&self) -> Vec<ObjectHandle> {
        self.items.clone()
    }

    pub fn extend(&mut self, other: IdentitySet) {
        for o in other.items {
            self.insert(&o);
        }
    }
}

// ============================================================================
// Per-Thread Container
// ============================================================================

/// Which threads' pending work an operation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    CurrentThread,
    AllThreads,
}

/// A value of `T` per thread, or one shared value when not threaded.
#[derive(Debug)]
pub struct PerThread<T> {
    threaded: bool,
    slots: Mutex<HashMap<Option<ThreadId>, T>>,
}

impl<T: Default> PerThread<T> {
    pub fn new(threaded: bool) -> Self {
        Self {
            threaded,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot_key(&self) -> Option<ThreadId> {
        self.threaded.then(|| thread::current().id())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Option<ThreadId>, T>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the calling thread's slot.
    pub fn with_current<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let key = self.slot_key();
        let mut slots = self.lock();
        f(slots.entry(key).or_default())
    }

    /// Run `f` on every slot.
    pub fn for_each(&self, mut f: impl FnMut(&mut T)) {
        for slot in self.lock().values_mut() {
            f(slot);
        }
    }

    /// Remove and return the slots covered by `scope`.
    pub fn take(&self, scope: Scope) -> Vec<(Option<ThreadId>, T)> {
        let mut slots = self.lock();
        match scope {
            Scope::CurrentThread => {
                let key = self.slot_key();
                slots.remove(&key).map(|v| (key, v)).into_iter().collect()
            }
            Scope::AllThreads => slots.drain().collect(),
        }
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

impl<T: Default + Clone> PerThread<T> {
    /// Copy of the calling thread's slot.
    pub fn current(&self) -> T {
        self.with_current(|slot| slot.clone())
    }
}

impl PerThread<IdentitySet> {
    /// Every object across all threads.
    pub fn all_objects(&self) -> Vec<ObjectHandle> {
        let mut merged = IdentitySet::new();
        for slot in self.lock().values() {
            for o in slot.iter() {
                merged.insert(o);
            }
        }
        merged.to_vec()
    }

    /// Remove `object` from whichever slots hold it.
    pub fn remove_everywhere(&self, object: &PersistentObject) -> bool {
        let mut removed = false;
        self.for_each(|slot| removed |= slot.remove(object));
        removed
    }

    pub fn contains_anywhere(&self, object: &PersistentObject) -> bool {
        self.lock().values().any(|slot| slot.contains(object))
    }

    /// Number of objects in the calling thread's slot.
    pub fn current_len(&self) -> usize {
        self.with_current(|slot| slot.len())
    }

    pub fn total_len(&self) -> usize {
        self.lock().values().map(IdentitySet::len).sum()
    }

    /// Put taken objects back, ahead of anything added since they were taken.
    pub fn restore(&self, taken: Vec<(Option<ThreadId>, IdentitySet)>) {
        let mut slots = self.lock();
        for (key, mut set) in taken {
            let slot = slots.entry(key).or_default();
            set.extend(std::mem::take(slot));
            *slot = set;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{KlassDef, ModelBuilder};

    fn objects(n: usize) -> Vec<ObjectHandle> {
        let model = ModelBuilder::new("M")
            .klass(KlassDef::new("Thing"))
            .build()
            .unwrap();
        let klass = model.klass("Thing").unwrap();
        (0..n).map(|_| PersistentObject::new(klass)).collect()
    }

    #[test]
    fn test_identity_set_dedups_by_pointer() {
        let objs = objects(2);
        let mut set = IdentitySet::new();
        assert!(set.insert(&objs[0]));
        assert!(!set.insert(&objs[0]));
        assert!(set.insert(&objs[1]));
        assert_eq!(set.len(), 2);
        assert!(set.remove(&objs[0]));
        assert!(!set.contains(&objs[0]));
        assert!(Arc::ptr_eq(&set.to_vec()[0], &objs[1]));
    }

    #[test]
    fn test_threads_get_separate_slots() {
        let objs = objects(2);
        let pending = Arc::new(PerThread::<IdentitySet>::new(true));
        pending.with_current(|s| s.insert(&objs[0]));

        let other = Arc::clone(&pending);
        let second = Arc::clone(&objs[1]);
        std::thread::spawn(move || {
            other.with_current(|s| s.insert(&second));
            assert_eq!(other.current_len(), 1);
        })
        .join()
        .unwrap();

        assert_eq!(pending.current_len(), 1);
        assert_eq!(pending.total_len(), 2);
        assert_eq!(pending.all_objects().len(), 2);
        let taken = pending.take(Scope::CurrentThread);
        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].1.len(), 1);
        assert_eq!(pending.total_len(), 1);
        assert_eq!(pending.take(Scope::AllThreads).len(), 1);
        assert_eq!(pending.total_len(), 0);
    }

    #[test]
    fn test_non_threaded_shares_one_slot() {
        let objs = objects(1);
        let pending = Arc::new(PerThread::<IdentitySet>::new(false));
        let other = Arc::clone(&pending);
        let obj = Arc::clone(&objs[0]);
        std::thread::spawn(move || {
            other.with_current(|s| s.insert(&obj));
        })
        .join()
        .unwrap();
        assert_eq!(pending.current_len(), 1);
    }

    #[test]
    fn test_restore_keeps_order() {
        let objs = objects(3);
        let pending = PerThread::<IdentitySet>::new(true);
        pending.with_current(|s| {
            s.insert(&objs[0]);
            s.insert(&objs[1]);
        });
        let taken = pending.take(Scope::CurrentThread);
        pending.with_current(|s| s.insert(&objs[2]));
        pending.restore(taken);
        let order = pending.current().to_vec();
        assert!(Arc::ptr_eq(&order[0], &objs[0]));
        assert!(Arc::ptr_eq(&order[2], &objs[2]));
        assert!(pending.remove_everywhere(&objs[1]));
        assert!(!pending.contains_anywhere(&objs[1]));
    }
}
