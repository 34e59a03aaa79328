//! The seam between the object store and its backing storage.
//!
//! An [`ObjectStore`] owns one [`Persistence`] implementation. Saves run
//! through a [`SaveTransaction`] whose three phases the store always calls in
//! the same order: deletions, inserts, updates. The SQL backend lives in
//! `middlestore-sql`; [`MemoryPersistence`] keeps rows in memory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Result, config_error};
use crate::model::{Attr, Klass, Model};
use crate::object::{ObjectHandle, ObjectKey, PersistentObject};
use crate::settings::StoreSettings;
use crate::store::ObjectStore;

// ============================================================================
// Fetch Query
// ============================================================================

/// Options for fetching objects of a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchQuery {
    /// Extra SQL (a `WHERE` condition and/or `ORDER BY`), backend specific.
    pub clauses: Option<String>,
    /// Restrict to one serial number.
    pub serial_num: Option<i64>,
    /// Include subclasses.
    pub deep: bool,
    /// Overwrite clean in-memory objects with the stored values.
    pub refresh: bool,
}

impl Default for FetchQuery {
    fn default() -> Self {
        Self {
            clauses: None,
            serial_num: None,
            deep: true,
            refresh: true,
        }
    }
}

impl FetchQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// One object by serial number, this class only.
    pub fn serial(serial_num: i64) -> Self {
        Self {
            serial_num: Some(serial_num),
            deep: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn clauses(mut self, clauses: impl Into<String>) -> Self {
        self.clauses = Some(clauses.into());
        self
    }

    #[must_use]
    pub fn deep(mut self, deep: bool) -> Self {
        self.deep = deep;
        self
    }

    #[must_use]
    pub fn refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Backing storage for an [`ObjectStore`].
pub trait Persistence: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Called once when the store is created.
    fn connect(&self, model: &Arc<Model>, settings: &StoreSettings) -> Result<()> {
        let _ = (model, settings);
        Ok(())
    }

    /// Start a save. Everything done through the returned transaction is
    /// committed or rolled back together.
    fn begin_save<'a>(&'a self, store: &'a ObjectStore) -> Result<Box<dyn SaveTransaction + 'a>>;

    /// Fetch objects of `klass`, reconciled with the store's identity map.
    fn fetch_objects(
        &self,
        store: &ObjectStore,
        klass: &Arc<Klass>,
        query: &FetchQuery,
    ) -> Result<Vec<ObjectHandle>>;

    /// Stored objects of `klass` (or a subclass) whose `attr` refers to
    /// `target`, reconciled with the identity map.
    fn fetch_referencing(
        &self,
        store: &ObjectStore,
        target: &PersistentObject,
        klass: &Arc<Klass>,
        attr: &Arc<Attr>,
    ) -> Result<Vec<ObjectHandle>>;
}

/// One save in progress.
///
/// `commit_inserts` must call [`ObjectStore::register_inserted`] for each
/// object as soon as it has its permanent serial number.
pub trait SaveTransaction {
    fn commit_deletions(&mut self, objects: &[ObjectHandle]) -> Result<()>;

    fn commit_inserts(&mut self, objects: &[ObjectHandle]) -> Result<()>;

    /// Write the changed attributes of each object.
    fn commit_updates(&mut self, objects: &[ObjectHandle]) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;

    fn rollback(self: Box<Self>) -> Result<()>;
}

// ============================================================================
// Memory Persistence
// ============================================================================

/// Keeps committed objects in a map. Useful for tests and for models that
/// never need to outlive the process.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rows: Mutex<HashMap<ObjectKey, ObjectHandle>>,
    next_serials: Mutex<HashMap<String, i64>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<ObjectKey, ObjectHandle>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_serial(&self, klass: &str) -> i64 {
        let mut serials = self.next_serials.lock().unwrap_or_else(PoisonError::into_inner);
        let next = serials.entry(klass.to_string()).or_insert(0);
        *next += 1;
        *next
    }

    /// Number of stored objects.
    pub fn row_count(&self) -> usize {
        self.rows().len()
    }
}

impl Persistence for MemoryPersistence {
    fn name(&self) -> &str {
        "memory"
    }

    fn begin_save<'a>(&'a self, store: &'a ObjectStore) -> Result<Box<dyn SaveTransaction + 'a>> {
        Ok(Box::new(MemorySave {
            persistence: self,
            store,
            undo: Vec::new(),
        }))
    }

    fn fetch_objects(
        &self,
        store: &ObjectStore,
        klass: &Arc<Klass>,
        query: &FetchQuery,
    ) -> Result<Vec<ObjectHandle>> {
        if query.clauses.is_some() {
            return Err(config_error("memory persistence cannot evaluate SQL clauses"));
        }
        let klasses: Vec<Arc<Klass>> = if query.deep {
            store.model().klass_and_descendants(klass)
        } else {
            vec![Arc::clone(klass)]
        };
        let mut matches: Vec<ObjectHandle> = self
            .rows()
            .iter()
            .filter(|(key, _)| klasses.iter().any(|k| k.name() == key.klass()))
            .filter(|(key, _)| query.serial_num.is_none_or(|s| s == key.serial_num()))
            .map(|(_, o)| Arc::clone(o))
            .collect();
        matches.sort_by_key(|o| o.key());
        Ok(matches.iter().filter_map(|o| store.adopt(o)).collect())
    }

    fn fetch_referencing(
        &self,
        store: &ObjectStore,
        target: &PersistentObject,
        klass: &Arc<Klass>,
        attr: &Arc<Attr>,
    ) -> Result<Vec<ObjectHandle>> {
        let candidates: Vec<ObjectHandle> = self
            .rows()
            .values()
            .filter(|o| o.klass().is_kind_of(klass.name()))
            .cloned()
            .collect();
        Ok(candidates
            .iter()
            .filter(|o| o.refers_to(attr, target))
            .filter_map(|o| store.adopt(o))
            .collect())
    }
}

enum Undo {
    Inserted(ObjectKey),
    Deleted(ObjectKey, ObjectHandle),
}

struct MemorySave<'a> {
    persistence: &'a MemoryPersistence,
    store: &'a ObjectStore,
    undo: Vec<Undo>,
}

impl SaveTransaction for MemorySave<'_> {
    fn commit_deletions(&mut self, objects: &[ObjectHandle]) -> Result<()> {
        let mut rows = self.persistence.rows();
        for object in objects {
            if let Some(key) = object.key() {
                if let Some(row) = rows.remove(&key) {
                    self.undo.push(Undo::Deleted(key, row));
                }
            }
        }
        Ok(())
    }

    fn commit_inserts(&mut self, objects: &[ObjectHandle]) -> Result<()> {
        for object in objects {
            let serial_num = self.persistence.next_serial(object.klass().name());
            self.store.register_inserted(object, serial_num)?;
            let key = ObjectKey::new(object.klass().name(), serial_num);
            self.persistence.rows().insert(key.clone(), Arc::clone(object));
            self.undo.push(Undo::Inserted(key));
        }
        Ok(())
    }

    fn commit_updates(&mut self, _objects: &[ObjectHandle]) -> Result<()> {
        // Rows are the live objects themselves.
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn rollback(self: Box<Self>) -> Result<()> {
        let mut rows = self.persistence.rows();
        for undo in self.undo.into_iter().rev() {
            match undo {
                Undo::Inserted(key) => {
                    rows.remove(&key);
                }
                Undo::Deleted(key, row) => {
                    rows.insert(key, row);
                }
            }
        }
        Ok(())
    }
}
