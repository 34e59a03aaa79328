//! The object store: identity map, pending changes and save pipeline.
//!
//! An [`ObjectStore`] guarantees that at most one [`PersistentObject`] exists
//! per [`ObjectKey`], tracks new, changed and deleted objects per thread, and
//! commits them through its [`Persistence`] backend.
//!
//! # Example
//!
//! ```
//! use middlestore_core::model::{AttrDef, KlassDef, ModelBuilder};
//! use middlestore_core::ObjectStore;
//! use std::sync::Arc;
//!
//! let model = ModelBuilder::new("People")
//!     .klass(KlassDef::new("Person").attr(AttrDef::string("name")))
//!     .build()
//!     .unwrap();
//! let store = ObjectStore::in_memory(model).unwrap();
//!
//! let alice = store.create_object("Person").unwrap();
//! assert_eq!(alice.serial_num(), -1);
//! alice.set("name", "Alice").unwrap();
//! store.add_object(&alice).unwrap();
//! store.save_changes().unwrap();
//!
//! assert!(alice.serial_num() > 0);
//! let fetched = store.fetch_object("Person", alice.serial_num()).unwrap();
//! assert!(Arc::ptr_eq(&fetched, &alice));
//! ```

use std::collections::HashSet;
use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Instant;

use crate::cache::{ObjectCache, RetainCache, WeakCache};
use crate::error::{
    Error, InvalidValueKind, LifecycleErrorKind, ModelErrorKind, Result, UnknownObjectError,
    integrity_error, invalid_value, lifecycle_error, model_error,
};
use crate::model::{Attr, Klass, Model};
use crate::object::{FieldValue, Lifecycle, ObjectHandle, ObjectKey, PersistentObject};
use crate::objref::ObjRef;
use crate::per_thread::{IdentitySet, PerThread, Scope};
use crate::persistence::{FetchQuery, MemoryPersistence, Persistence, SaveTransaction};
use crate::settings::StoreSettings;

// ============================================================================
// Object Store
// ============================================================================

/// Identity-mapped store of persistent objects.
pub struct ObjectStore {
    this: Weak<ObjectStore>,
    model: Arc<Model>,
    settings: StoreSettings,
    persistence: Box<dyn Persistence>,
    objects: RwLock<Box<dyn ObjectCache>>,
    new_objects: PerThread<IdentitySet>,
    deleted_objects: PerThread<IdentitySet>,
    changed_objects: PerThread<IdentitySet>,
    /// Keys deleted in memory but not yet saved; fetches must not revive them.
    deleted_keys: Mutex<HashSet<ObjectKey>>,
    next_serial: AtomicI64,
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("model", &self.model.name())
            .field("persistence", &self.persistence.name())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Create a store over `persistence`. The backend's `connect` hook runs
    /// before the store is returned.
    #[tracing::instrument(level = "debug", skip_all, fields(model = %model.name(), backend = persistence.name()))]
    pub fn new(
        model: Arc<Model>,
        settings: StoreSettings,
        persistence: impl Persistence + 'static,
    ) -> Result<Arc<Self>> {
        persistence.connect(&model, &settings)?;
        let cache: Box<dyn ObjectCache> = if settings.cache_objects_forever {
            Box::new(RetainCache::new())
        } else {
            Box::new(WeakCache::new())
        };
        let threaded = settings.threaded;
        tracing::info!(
            model = %model.name(),
            threaded,
            cache_objects_forever = settings.cache_objects_forever,
            "Object store created"
        );
        Ok(Arc::new_cyclic(|this| ObjectStore {
            this: Weak::clone(this),
            model,
            settings,
            persistence: Box::new(persistence),
            objects: RwLock::new(cache),
            new_objects: PerThread::new(threaded),
            deleted_objects: PerThread::new(threaded),
            changed_objects: PerThread::new(threaded),
            deleted_keys: Mutex::new(HashSet::new()),
            next_serial: AtomicI64::new(0),
        }))
    }

    /// Store backed by [`MemoryPersistence`] with default settings.
    pub fn in_memory(model: Arc<Model>) -> Result<Arc<Self>> {
        Self::new(model, StoreSettings::default(), MemoryPersistence::new())
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.persistence.as_ref()
    }

    fn cache_read(&self) -> RwLockReadGuard<'_, Box<dyn ObjectCache>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn cache_write(&self) -> RwLockWriteGuard<'_, Box<dyn ObjectCache>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn deleted_keys(&self) -> MutexGuard<'_, HashSet<ObjectKey>> {
        self.deleted_keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Serial numbers and construction
    // ------------------------------------------------------------------------

    /// Next temporary serial number: -1, -2, ... never repeating.
    pub fn new_serial_num(&self) -> i64 {
        self.next_serial.fetch_sub(1, Ordering::SeqCst) - 1
    }

    /// Construct an instance of `klass` bound to this store, with a fresh
    /// temporary serial number. It is not pending until added.
    pub fn create_object(&self, klass: &str) -> Result<ObjectHandle> {
        let klass = self.model.klass(klass)?;
        if klass.is_abstract() {
            return Err(model_error(
                ModelErrorKind::AbstractKlass,
                format!("cannot instantiate abstract class {}", klass.name()),
            ));
        }
        let object = PersistentObject::with_serial(klass, self.new_serial_num());
        object.attach(&self.this)?;
        Ok(object)
    }

    fn check_klass(&self, object: &PersistentObject) -> Result<()> {
        let ours = self.model.klass(object.klass().name())?;
        if !Arc::ptr_eq(ours, object.klass()) {
            return Err(model_error(
                ModelErrorKind::Inconsistent,
                format!("{} was built from a different model", object.describe()),
            ));
        }
        if ours.is_abstract() {
            return Err(model_error(
                ModelErrorKind::AbstractKlass,
                format!("cannot store instance of abstract class {}", ours.name()),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Adding objects
    // ------------------------------------------------------------------------

    /// Register `object`, and every transient object reachable from it, for
    /// insertion on the next save.
    #[tracing::instrument(level = "debug", skip_all, fields(object = %object.describe()))]
    pub fn add_object(&self, object: &ObjectHandle) -> Result<()> {
        self.add(object, true)
    }

    /// Register `object` only, leaving referenced objects alone.
    pub fn add_object_no_recurse(&self, object: &ObjectHandle) -> Result<()> {
        self.add(object, false)
    }

    fn add(&self, root: &ObjectHandle, recurse: bool) -> Result<()> {
        match root.lifecycle() {
            Lifecycle::Committed => {
                return Err(lifecycle_error(
                    LifecycleErrorKind::AlreadyCommitted,
                    root.describe(),
                    "object already has a key",
                ));
            }
            Lifecycle::Deleted => {
                return Err(lifecycle_error(
                    LifecycleErrorKind::Deleted,
                    root.describe(),
                    "cannot add a deleted object",
                ));
            }
            Lifecycle::PendingInsert => {
                return if root.belongs_to(&self.this) {
                    Ok(())
                } else {
                    Err(lifecycle_error(
                        LifecycleErrorKind::ForeignStore,
                        root.describe(),
                        "object belongs to another store",
                    ))
                };
            }
            Lifecycle::Transient => {}
        }

        // Validate the whole reachable set before touching any of it.
        let mut seen = IdentitySet::new();
        let mut batch = Vec::new();
        let mut stack = vec![Arc::clone(root)];
        while let Some(object) = stack.pop() {
            if object.lifecycle() != Lifecycle::Transient || !seen.insert(&object) {
                continue;
            }
            self.check_klass(&object)?;
            object.check_attachable(&self.this)?;
            if recurse {
                stack.extend(
                    object
                        .loaded_references()
                        .into_iter()
                        .filter(|o| o.lifecycle() == Lifecycle::Transient),
                );
            }
            batch.push(object);
        }

        for object in &batch {
            object.attach(&self.this)?;
        }
        for object in batch {
            object.ensure_temporary_serial(|| self.new_serial_num());
            object.set_lifecycle(Lifecycle::PendingInsert);
            self.new_objects.with_current(|pending| pending.insert(&object));
            tracing::debug!(object = %object.describe(), "Object added");
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Object with `key` from the identity map.
    pub fn object_for_key(&self, key: &ObjectKey) -> Result<ObjectHandle> {
        self.try_object_for_key(key).ok_or_else(|| {
            Error::UnknownObject(UnknownObjectError {
                klass: key.klass().to_string(),
                serial_num: key.serial_num(),
            })
        })
    }

    pub fn try_object_for_key(&self, key: &ObjectKey) -> Option<ObjectHandle> {
        self.cache_read().get(key)
    }

    /// True if `object` is pending insert here or is the identity-map entry
    /// for its key.
    pub fn has_object(&self, object: &ObjectHandle) -> bool {
        if !object.belongs_to(&self.this) {
            return false;
        }
        match object.lifecycle() {
            Lifecycle::PendingInsert => true,
            Lifecycle::Committed => object
                .key()
                .and_then(|key| self.try_object_for_key(&key))
                .is_some_and(|cached| Arc::ptr_eq(&cached, object)),
            Lifecycle::Transient | Lifecycle::Deleted => false,
        }
    }

    /// Object of `klass` with `serial_num`, from memory or storage.
    pub fn fetch_object(&self, klass: &str, serial_num: i64) -> Result<ObjectHandle> {
        self.fetch_object_opt(klass, serial_num)?.ok_or_else(|| {
            Error::UnknownObject(UnknownObjectError {
                klass: klass.to_string(),
                serial_num,
            })
        })
    }

    /// Like [`fetch_object`](Self::fetch_object) but `None` when absent.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn fetch_object_opt(&self, klass: &str, serial_num: i64) -> Result<Option<ObjectHandle>> {
        let klass = Arc::clone(self.model.klass(klass)?);
        let key = ObjectKey::new(klass.name(), serial_num);
        if let Some(object) = self.try_object_for_key(&key) {
            return Ok(Some(object));
        }
        if self.is_pending_delete(&key) {
            return Ok(None);
        }
        let fetched = self
            .persistence
            .fetch_objects(self, &klass, &FetchQuery::serial(serial_num))?;
        Ok(fetched.into_iter().next())
    }

    /// Objects of `klass` (and subclasses unless `query.deep` is false).
    #[tracing::instrument(level = "debug", skip(self, query))]
    pub fn fetch_objects_of_class(&self, klass: &str, query: &FetchQuery) -> Result<Vec<ObjectHandle>> {
        let klass = Arc::clone(self.model.klass(klass)?);
        let objects = self.persistence.fetch_objects(self, &klass, query)?;
        tracing::debug!(klass = %klass.name(), count = objects.len(), "Fetched objects");
        Ok(objects)
    }

    /// Re-read `object` from storage. Objects with unsaved changes keep them.
    pub fn refresh_object(&self, object: &ObjectHandle) -> Result<()> {
        let Some(key) = object.key() else {
            return Ok(());
        };
        self.persistence.fetch_objects(
            self,
            object.klass(),
            &FetchQuery::serial(key.serial_num()).refresh(true),
        )?;
        Ok(())
    }

    /// Object a packed reference points at, or `None` for the null reference.
    ///
    /// A non-null reference with a zero component fails with
    /// `ObjRefZeroSerialNum`; a missing target with `ObjRefDangles`.
    pub fn fetch_obj_ref(&self, obj_ref: ObjRef) -> Result<Option<ObjectHandle>> {
        if obj_ref.is_null() {
            return Ok(None);
        }
        let (klass_id, serial_num) = obj_ref.validate()?;
        let klass = self
            .model
            .klass_for_id(klass_id)
            .ok_or_else(|| obj_ref.dangling())?;
        self.fetch_object_opt(klass.name(), i64::from(serial_num))?
            .map(Some)
            .ok_or_else(|| obj_ref.dangling())
    }

    /// Object a packed reference points at, if already in memory.
    pub fn obj_ref_in_memory(&self, obj_ref: ObjRef) -> Option<ObjectHandle> {
        let (klass_id, serial_num) = obj_ref.validate().ok()?;
        let klass = self.model.klass_for_id(klass_id)?;
        self.try_object_for_key(&ObjectKey::new(klass.name(), i64::from(serial_num)))
    }

    // ------------------------------------------------------------------------
    // Backend support
    // ------------------------------------------------------------------------

    /// Match a stored row against the identity map.
    ///
    /// Returns the live object for the key, refreshed with `values` when
    /// `refresh` is set and it has no unsaved changes, or a new committed
    /// object. Returns `None` for objects deleted but not yet saved.
    pub fn reconcile(
        &self,
        klass: &Arc<Klass>,
        serial_num: i64,
        values: Vec<FieldValue>,
        refresh: bool,
    ) -> Option<ObjectHandle> {
        let key = ObjectKey::new(klass.name(), serial_num);
        if self.is_pending_delete(&key) {
            return None;
        }
        let existing = self.try_object_for_key(&key);
        if let Some(existing) = existing {
            if refresh && !existing.is_dirty() {
                existing.load_values(values);
            }
            return Some(existing);
        }
        let fresh = PersistentObject::loaded(klass, &self.this, serial_num, values);
        let cached = self.cache_write().get_or_insert(key, fresh);
        Some(cached)
    }

    /// Enter an already-built committed object into the identity map.
    pub(crate) fn adopt(&self, object: &ObjectHandle) -> Option<ObjectHandle> {
        let key = object.key()?;
        if self.is_pending_delete(&key) || object.is_deleted() {
            return None;
        }
        Some(self.cache_write().get_or_insert(key, Arc::clone(object)))
    }

    /// Record the permanent serial number of a just-inserted object and put
    /// it into the identity map.
    pub fn register_inserted(&self, object: &ObjectHandle, serial_num: i64) -> Result<()> {
        if serial_num <= 0 {
            return Err(integrity_error(format!(
                "backend assigned non-positive serial {serial_num} to {}",
                object.describe()
            )));
        }
        if object.lifecycle() != Lifecycle::PendingInsert {
            return Err(integrity_error(format!(
                "{} is not pending insert",
                object.describe()
            )));
        }
        let key = ObjectKey::new(object.klass().name(), serial_num);
        let cached = self.cache_write().get_or_insert(key.clone(), Arc::clone(object));
        if !Arc::ptr_eq(&cached, object) {
            return Err(integrity_error(format!("{key} is already in the identity map")));
        }
        object.commit_serial(serial_num);
        tracing::debug!(key = %key, "Object inserted");
        Ok(())
    }

    /// True if `object` was attached to this store.
    pub(crate) fn owns(&self, object: &PersistentObject) -> bool {
        object.belongs_to(&self.this)
    }

    pub fn is_pending_delete(&self, key: &ObjectKey) -> bool {
        self.deleted_keys().contains(key)
    }

    /// Every object in memory: the identity map plus pending inserts.
    pub(crate) fn live_objects(&self) -> Vec<ObjectHandle> {
        let mut objects = self.cache_read().values();
        objects.extend(self.new_objects.all_objects());
        objects
    }

    /// Objects of `klass` whose `attr` refers to `target`, from storage and
    /// from memory. In-memory values win over stored ones.
    pub fn objects_referencing_via(
        &self,
        target: &PersistentObject,
        klass: &Arc<Klass>,
        attr: &Arc<Attr>,
    ) -> Result<Vec<ObjectHandle>> {
        let stored = if target.key().is_some() {
            self.persistence.fetch_referencing(self, target, klass, attr)?
        } else {
            Vec::new()
        };
        let mut found = IdentitySet::new();
        for object in stored.into_iter().chain(self.live_objects()) {
            if !object.is_deleted()
                && object.klass().is_kind_of(klass.name())
                && object.refers_to(attr, target)
            {
                found.insert(&object);
            }
        }
        Ok(found.to_vec())
    }

    /// Every `(object, attr)` whose objref `attr` points at `target`.
    pub fn referencing_objects(
        &self,
        target: &PersistentObject,
    ) -> Result<Vec<(ObjectHandle, Arc<Attr>)>> {
        let mut out = Vec::new();
        for (klass, attr) in self.model.referencing_attrs(target.klass()) {
            for object in self.objects_referencing_via(target, &klass, &attr)? {
                out.push((object, Arc::clone(&attr)));
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Change tracking
    // ------------------------------------------------------------------------

    /// Mark `object` dirty and queue it for update on the calling thread.
    pub fn object_changed(&self, object: &ObjectHandle) {
        if object.is_deleted() || !object.belongs_to(&self.this) {
            return;
        }
        object.mark_dirty();
        self.changed_objects.with_current(|pending| pending.insert(object));
    }

    /// Queue a deleted object for removal from storage.
    pub(crate) fn schedule_delete(&self, object: &ObjectHandle) {
        match object.lifecycle() {
            Lifecycle::PendingInsert => {
                self.new_objects.remove_everywhere(object);
            }
            Lifecycle::Committed => {
                if let Some(key) = object.key() {
                    {
                        let mut cache = self.cache_write();
                        let cached = cache.get(&key);
                        if cached.is_some_and(|c| Arc::ptr_eq(&c, object)) {
                            cache.remove(&key);
                        }
                    }
                    self.deleted_keys().insert(key);
                }
                self.deleted_objects.with_current(|pending| pending.insert(object));
            }
            Lifecycle::Transient | Lifecycle::Deleted => {}
        }
        self.changed_objects.remove_everywhere(object);
        object.mark_deleted();
    }

    /// Unsaved changes exist on any thread.
    pub fn has_changes(&self) -> bool {
        self.new_objects.total_len() > 0
            || self.deleted_objects.total_len() > 0
            || self.changed_objects.total_len() > 0
    }

    /// Unsaved changes exist on the calling thread.
    pub fn has_changes_for_current_thread(&self) -> bool {
        self.new_objects.current_len() > 0
            || self.deleted_objects.current_len() > 0
            || self.changed_objects.current_len() > 0
    }

    // ------------------------------------------------------------------------
    // Saving
    // ------------------------------------------------------------------------

    /// Commit the calling thread's pending changes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn save_changes(&self) -> Result<()> {
        self.save(Scope::CurrentThread)
    }

    /// Commit every thread's pending changes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn save_all_changes(&self) -> Result<()> {
        self.save(Scope::AllThreads)
    }

    fn save(&self, scope: Scope) -> Result<()> {
        let new_taken = self.new_objects.take(scope);
        let deleted_taken = self.deleted_objects.take(scope);
        let changed_taken = self.changed_objects.take(scope);

        let inserts = merge(&new_taken);
        let deletes = merge(&deleted_taken);
        let updates: Vec<ObjectHandle> = merge(&changed_taken)
            .into_iter()
            .filter(|o| o.lifecycle() == Lifecycle::Committed)
            .collect();

        let restore = |store: &Self| {
            store.new_objects.restore(new_taken.clone());
            store.deleted_objects.restore(deleted_taken.clone());
            store.changed_objects.restore(changed_taken.clone());
        };

        if inserts.is_empty() && deletes.is_empty() && updates.is_empty() {
            return Ok(());
        }
        if let Err(e) = check_required(inserts.iter().chain(&updates)) {
            restore(self);
            return Err(e);
        }

        let start = Instant::now();
        tracing::info!(
            inserts = inserts.len(),
            updates = updates.len(),
            deletes = deletes.len(),
            "Saving changes"
        );

        match self.run_save(&deletes, &inserts, &updates) {
            Ok(()) => {
                for object in &updates {
                    object.mark_clean();
                }
                {
                    let mut keys = self.deleted_keys();
                    for object in &deletes {
                        if let Some(key) = object.key() {
                            keys.remove(&key);
                        }
                    }
                }
                tracing::info!(elapsed_ms = start.elapsed().as_millis(), "Save completed");
                Ok(())
            }
            Err(e) => {
                for object in &inserts {
                    if object.lifecycle() == Lifecycle::Committed {
                        if let Some(key) = object.key() {
                            self.cache_write().remove(&key);
                        }
                        object.revert_serial();
                    }
                }
                restore(self);
                tracing::warn!(error = %e, "Save failed; pending changes kept");
                Err(e)
            }
        }
    }

    fn run_save(
        &self,
        deletes: &[ObjectHandle],
        inserts: &[ObjectHandle],
        updates: &[ObjectHandle],
    ) -> Result<()> {
        let mut tx = self.persistence.begin_save(self)?;
        match commit_phases(tx.as_mut(), deletes, inserts, updates) {
            Ok(()) => tx.commit(),
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------------

    /// Empty the identity map. Fails while unsaved changes exist.
    pub fn clear(&self) -> Result<()> {
        if self.has_changes() {
            return Err(lifecycle_error(
                LifecycleErrorKind::PendingChanges,
                self.model.name(),
                "cannot clear a store with unsaved changes",
            ));
        }
        self.cache_write().clear();
        Ok(())
    }

    /// Drop all pending changes on every thread and empty the identity map.
    /// Discarded new objects become transient again.
    pub fn discard_everything(&self) {
        for (_, pending) in self.new_objects.take(Scope::AllThreads) {
            for object in pending.iter() {
                object.set_lifecycle(Lifecycle::Transient);
            }
        }
        self.deleted_objects.clear();
        self.changed_objects.clear();
        self.deleted_keys().clear();
        self.cache_write().clear();
        tracing::info!(model = %self.model.name(), "Discarded all pending changes");
    }

    /// Snapshot of the store's bookkeeping for the calling thread.
    pub fn debug_info(&self) -> StoreDebugInfo {
        StoreDebugInfo {
            cached: self.cache_read().len(),
            pending_new: self.new_objects.current_len(),
            pending_delete: self.deleted_objects.current_len(),
            pending_changed: self.changed_objects.current_len(),
            threaded: self.settings.threaded,
        }
    }

    /// Write every stored object as CSV, one block per concrete class.
    pub fn dump_objects(&self, out: &mut dyn Write) -> Result<()> {
        for klass in self.model.klasses() {
            if klass.is_abstract() {
                continue;
            }
            let objects = self.fetch_objects_of_class(
                klass.name(),
                &FetchQuery::new().deep(false).refresh(false),
            )?;
            writeln!(out, "{} objects", klass.name())?;
            let mut header = vec!["serialNum".to_string()];
            header.extend(klass.sql_attrs().map(|a| a.name().to_string()));
            writeln!(out, "{}", header.join(","))?;
            for object in &objects {
                let mut fields = vec![object.serial_num().to_string()];
                for attr in klass.sql_attrs() {
                    fields.push(csv_field(&self.dump_value(&object.raw_value(attr))));
                }
                writeln!(out, "{}", fields.join(","))?;
            }
            writeln!(out)?;
        }
        Ok(())
    }

    fn dump_value(&self, value: &FieldValue) -> String {
        match value {
            FieldValue::Null | FieldValue::List(_) => String::new(),
            FieldValue::Scalar(v) => v.to_string(),
            FieldValue::Object(o) => o.describe(),
            FieldValue::Unresolved(r) => match self.model.klass_for_id(r.klass_id()) {
                Some(k) => format!("{}.{}", k.name(), r.serial_num()),
                None => r.to_string(),
            },
        }
    }
}

fn merge(taken: &[(Option<std::thread::ThreadId>, IdentitySet)]) -> Vec<ObjectHandle> {
    let mut merged = IdentitySet::new();
    for (_, set) in taken {
        for object in set.iter() {
            merged.insert(object);
        }
    }
    merged.to_vec()
}

fn check_required<'a>(objects: impl Iterator<Item = &'a ObjectHandle>) -> Result<()> {
    for object in objects {
        if let Some(attr) = object.missing_required().first() {
            return Err(invalid_value(
                InvalidValueKind::Required,
                object.klass().name(),
                attr,
                format!("{} requires a value", object.describe()),
            ));
        }
    }
    Ok(())
}

fn commit_phases<'a>(
    tx: &mut (dyn SaveTransaction + 'a),
    deletes: &[ObjectHandle],
    inserts: &[ObjectHandle],
    updates: &[ObjectHandle],
) -> Result<()> {
    tx.commit_deletions(deletes)?;
    tx.commit_inserts(inserts)?;
    tx.commit_updates(updates)
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Debug information about store state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDebugInfo {
    /// Live objects in the identity map.
    pub cached: usize,
    /// Objects pending INSERT on this thread.
    pub pending_new: usize,
    /// Objects pending DELETE on this thread.
    pub pending_delete: usize,
    /// Objects pending UPDATE on this thread.
    pub pending_changed: usize,
    /// Whether pending changes are tracked per thread.
    pub threaded: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================
