//! Persistent objects.
//!
//! A [`PersistentObject`] is an instance of a [`Klass`] whose attribute
//! values live behind a lock. Objects are shared as [`ObjectHandle`]s; the
//! identity map guarantees one handle per key per store, so `Arc::ptr_eq` is
//! object identity.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

use crate::error::{InvalidValueKind, LifecycleErrorKind, Result, invalid_value, lifecycle_error};
use crate::model::{Attr, AttrType, Klass};
use crate::objref::ObjRef;
use crate::store::ObjectStore;
use crate::value::Value;

/// Shared handle to a persistent object.
pub type ObjectHandle = Arc<PersistentObject>;

// ============================================================================
// Object Key
// ============================================================================

/// Identity of a committed object: class name plus serial number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    klass: String,
    serial_num: i64,
}

impl ObjectKey {
    pub fn new(klass: impl Into<String>, serial_num: i64) -> Self {
        Self {
            klass: klass.into(),
            serial_num,
        }
    }

    pub fn klass(&self) -> &str {
        &self.klass
    }

    pub fn serial_num(&self) -> i64 {
        self.serial_num
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.klass, self.serial_num)
    }
}

// ============================================================================
// Field Values
// ============================================================================

/// The value held in one attribute slot.
#[derive(Debug, Clone, Default)]
pub enum FieldValue {
    /// Unset scalar, null reference, or list not yet loaded.
    #[default]
    Null,
    Scalar(Value),
    /// Loaded reference.
    Object(ObjectHandle),
    /// Reference read from storage and not yet resolved.
    Unresolved(ObjRef),
    /// Loaded list contents.
    List(Vec<ObjectHandle>),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&ObjectHandle> {
        match self {
            FieldValue::Object(o) => Some(o),
            _ => None,
        }
    }

    /// True if this slot refers to `target`, loaded or not.
    pub fn refers_to(&self, target: &PersistentObject) -> bool {
        match self {
            FieldValue::Object(o) => std::ptr::eq(Arc::as_ptr(o), target),
            FieldValue::Unresolved(r) => target.obj_ref().is_ok_and(|own| own == *r),
            FieldValue::List(items) => items.iter().any(|o| std::ptr::eq(Arc::as_ptr(o), target)),
            FieldValue::Null | FieldValue::Scalar(_) => false,
        }
    }

    fn describe(&self) -> serde_json::Value {
        match self {
            FieldValue::Null => serde_json::Value::Null,
            FieldValue::Scalar(v) => v.to_json(),
            FieldValue::Object(o) => serde_json::Value::String(o.describe()),
            FieldValue::Unresolved(r) => serde_json::Value::String(format!("ref {r}")),
            FieldValue::List(items) => {
                serde_json::Value::Array(items.iter().map(|o| o.describe().into()).collect())
            }
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        if v.is_null() {
            FieldValue::Null
        } else {
            FieldValue::Scalar(v)
        }
    }
}

macro_rules! scalar_field_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for FieldValue {
                fn from(v: $ty) -> Self {
                    FieldValue::from(Value::from(v))
                }
            }
        )*
    };
}

scalar_field_value!(bool, i32, i64, f64, &str, String, NaiveDate, NaiveTime, NaiveDateTime);

impl From<ObjectHandle> for FieldValue {
    fn from(o: ObjectHandle) -> Self {
        FieldValue::Object(o)
    }
}

impl From<&ObjectHandle> for FieldValue {
    fn from(o: &ObjectHandle) -> Self {
        FieldValue::Object(Arc::clone(o))
    }
}

impl From<Option<ObjectHandle>> for FieldValue {
    fn from(o: Option<ObjectHandle>) -> Self {
        o.map_or(FieldValue::Null, FieldValue::Object)
    }
}

impl From<ObjRef> for FieldValue {
    fn from(r: ObjRef) -> Self {
        if r.is_null() {
            FieldValue::Null
        } else {
            FieldValue::Unresolved(r)
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Where an object is in its persistence lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    /// Constructed, not yet added to a store.
    Transient,
    /// Added; will be inserted on the next save.
    PendingInsert,
    /// Stored with a permanent serial number.
    Committed,
    /// Removed by `delete_object`; no longer usable.
    Deleted,
}

#[derive(Debug)]
struct ObjectState {
    serial_num: i64,
    /// Serial held before the insert, restored if the save rolls back.
    temporary_serial: i64,
    lifecycle: Lifecycle,
    values: Vec<FieldValue>,
    changed: BTreeSet<usize>,
    dirty: bool,
}

// ============================================================================
// Persistent Object
// ============================================================================

/// An instance of a persistent class.
pub struct PersistentObject {
    klass: Arc<Klass>,
    store: OnceLock<Weak<ObjectStore>>,
    state: RwLock<ObjectState>,
}

impl fmt::Debug for PersistentObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read_state();
        f.debug_struct("PersistentObject")
            .field("klass", &self.klass.name())
            .field("serial_num", &state.serial_num)
            .field("lifecycle", &state.lifecycle)
            .field("dirty", &state.dirty)
            .finish_non_exhaustive()
    }
}

impl PersistentObject {
    /// Construct a transient instance with attribute defaults and serial 0.
    pub fn new(klass: &Arc<Klass>) -> ObjectHandle {
        Self::with_serial(klass, 0)
    }

    pub(crate) fn with_serial(klass: &Arc<Klass>, serial_num: i64) -> ObjectHandle {
        let values = klass
            .all_attrs()
            .iter()
            .map(|attr| {
                attr.default_value()
                    .and_then(|v| attr.coerce(v.clone()).ok())
                    .map_or(FieldValue::Null, FieldValue::from)
            })
            .collect();
        Arc::new(Self {
            klass: Arc::clone(klass),
            store: OnceLock::new(),
            state: RwLock::new(ObjectState {
                serial_num,
                temporary_serial: serial_num,
                lifecycle: Lifecycle::Transient,
                values,
                changed: BTreeSet::new(),
                dirty: false,
            }),
        })
    }

    /// Construct a committed instance from stored values.
    pub(crate) fn loaded(
        klass: &Arc<Klass>,
        store: &Weak<ObjectStore>,
        serial_num: i64,
        values: Vec<FieldValue>,
    ) -> ObjectHandle {
        let store_ref = OnceLock::new();
        let _ = store_ref.set(Weak::clone(store));
        Arc::new(Self {
            klass: Arc::clone(klass),
            store: store_ref,
            state: RwLock::new(ObjectState {
                serial_num,
                temporary_serial: 0,
                lifecycle: Lifecycle::Committed,
                values,
                changed: BTreeSet::new(),
                dirty: false,
            }),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ObjectState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ObjectState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Identity and lifecycle
    // ------------------------------------------------------------------------

    pub fn klass(&self) -> &Arc<Klass> {
        &self.klass
    }

    pub fn serial_num(&self) -> i64 {
        self.read_state().serial_num
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.read_state().lifecycle
    }

    /// Permanent key; `None` until the object has been inserted.
    pub fn key(&self) -> Option<ObjectKey> {
        let state = self.read_state();
        (state.serial_num > 0).then(|| ObjectKey::new(self.klass.name(), state.serial_num))
    }

    pub fn is_committed(&self) -> bool {
        self.lifecycle() == Lifecycle::Committed
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle() == Lifecycle::Deleted
    }

    /// True if the object has changes not yet saved.
    pub fn is_dirty(&self) -> bool {
        self.read_state().dirty
    }

    /// Names of attributes changed since the last save.
    pub fn changed_attrs(&self) -> Vec<String> {
        let state = self.read_state();
        state
            .changed
            .iter()
            .map(|&i| self.klass.all_attrs()[i].name().to_string())
            .collect()
    }

    /// Attributes changed since the last save, in declaration order.
    pub fn changed_attr_defs(&self) -> Vec<Arc<Attr>> {
        let state = self.read_state();
        state
            .changed
            .iter()
            .map(|&i| Arc::clone(&self.klass.all_attrs()[i]))
            .collect()
    }

    /// Store this object belongs to, if any and still alive.
    pub fn store(&self) -> Option<Arc<ObjectStore>> {
        self.store.get().and_then(Weak::upgrade)
    }

    pub(crate) fn belongs_to(&self, store: &Weak<ObjectStore>) -> bool {
        self.store.get().is_some_and(|s| Weak::ptr_eq(s, store))
    }

    fn require_store(&self) -> Result<Arc<ObjectStore>> {
        self.store().ok_or_else(|| {
            lifecycle_error(
                LifecycleErrorKind::NotInStore,
                self.describe(),
                "object is not attached to a store",
            )
        })
    }

    /// Packed reference to this object.
    pub fn obj_ref(&self) -> Result<ObjRef> {
        let serial_num = self.serial_num();
        let serial = u32::try_from(serial_num).ok().filter(|&s| s > 0).ok_or_else(|| {
            invalid_value(
                InvalidValueKind::OutOfRange,
                self.klass.name(),
                "serialNum",
                format!("serial number {serial_num} cannot be referenced"),
            )
        })?;
        Ok(ObjRef::join(self.klass.id(), serial))
    }

    /// `Klass.serial` label for logs and errors.
    pub fn describe(&self) -> String {
        format!("{}.{}", self.klass.name(), self.serial_num())
    }

    // ------------------------------------------------------------------------
    // Store bookkeeping
    // ------------------------------------------------------------------------

    /// Fails when the object is already bound to a different store.
    pub(crate) fn check_attachable(&self, store: &Weak<ObjectStore>) -> Result<()> {
        match self.store.get() {
            Some(existing) if !Weak::ptr_eq(existing, store) => Err(lifecycle_error(
                LifecycleErrorKind::ForeignStore,
                self.describe(),
                "object belongs to another store",
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn attach(&self, store: &Weak<ObjectStore>) -> Result<()> {
        self.check_attachable(store)?;
        if self.store.set(Weak::clone(store)).is_err() {
            // Another thread bound it first; only the same store is accepted.
            self.check_attachable(store)?;
        }
        Ok(())
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle) {
        self.write_state().lifecycle = lifecycle;
    }

    pub(crate) fn ensure_temporary_serial(&self, next: impl FnOnce() -> i64) {
        let mut state = self.write_state();
        if state.serial_num == 0 {
            state.serial_num = next();
        }
    }

    /// Give the object its permanent serial number after an insert.
    pub(crate) fn commit_serial(&self, serial_num: i64) {
        let mut state = self.write_state();
        state.temporary_serial = state.serial_num;
        state.serial_num = serial_num;
        state.lifecycle = Lifecycle::Committed;
        state.changed.clear();
        state.dirty = false;
    }

    /// Undo [`commit_serial`](Self::commit_serial) after a rolled back save.
    pub(crate) fn revert_serial(&self) {
        let mut state = self.write_state();
        state.serial_num = state.temporary_serial;
        state.lifecycle = Lifecycle::PendingInsert;
        state.dirty = true;
    }

    pub(crate) fn mark_dirty(&self) {
        self.write_state().dirty = true;
    }

    pub(crate) fn mark_clean(&self) {
        let mut state = self.write_state();
        state.changed.clear();
        state.dirty = false;
    }

    pub(crate) fn mark_deleted(&self) {
        let mut state = self.write_state();
        state.lifecycle = Lifecycle::Deleted;
        state.changed.clear();
        state.dirty = false;
    }

    /// Replace stored values with freshly read ones. List slots are reset
    /// so they reload on next access.
    pub(crate) fn load_values(&self, values: Vec<FieldValue>) {
        let mut state = self.write_state();
        state.values = values;
        state.changed.clear();
        state.dirty = false;
    }

    /// Clear a reference slot as part of a detach. Recorded as a change.
    pub(crate) fn detach_attr(&self, attr: &Attr) {
        let mut state = self.write_state();
        state.values[attr.index()] = FieldValue::Null;
        state.changed.insert(attr.index());
        state.dirty = true;
    }

    /// Drop deleted objects from loaded list slots.
    pub(crate) fn forget_list_members(&self, deleted: &dyn Fn(&ObjectHandle) -> bool) {
        let mut state = self.write_state();
        for value in &mut state.values {
            if let FieldValue::List(items) = value {
                items.retain(|o| !deleted(o));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Attribute access
    // ------------------------------------------------------------------------

    /// Slot contents without resolving references or loading lists.
    pub fn raw_value(&self, attr: &Attr) -> FieldValue {
        self.read_state()
            .values
            .get(attr.index())
            .cloned()
            .unwrap_or_default()
    }

    /// True if `attr` on this object points at `target`.
    pub fn refers_to(&self, attr: &Attr, target: &PersistentObject) -> bool {
        // Cloned first: `target` may be `self`.
        self.raw_value(attr).refers_to(target)
    }

    /// Objects currently held in loaded reference and list slots.
    pub fn loaded_references(&self) -> Vec<ObjectHandle> {
        let state = self.read_state();
        let mut out = Vec::new();
        for value in &state.values {
            match value {
                FieldValue::Object(o) => out.push(Arc::clone(o)),
                FieldValue::List(items) => out.extend(items.iter().cloned()),
                _ => {}
            }
        }
        out
    }

    /// Read an attribute, resolving stored references and loading lists.
    pub fn get(self: &Arc<Self>, name: &str) -> Result<FieldValue> {
        let attr = Arc::clone(self.klass.attr(name)?);
        if attr.is_list() {
            return self.list(name).map(FieldValue::List);
        }
        match self.raw_value(&attr) {
            FieldValue::Unresolved(r) => self.resolve(&attr, r).map(FieldValue::from),
            other => Ok(other),
        }
    }

    /// Scalar value of an attribute; `Value::Null` when unset.
    pub fn value(&self, name: &str) -> Result<Value> {
        let attr = self.klass.attr(name)?;
        match self.raw_value(attr) {
            FieldValue::Null => Ok(Value::Null),
            FieldValue::Scalar(v) => Ok(v),
            _ => Err(invalid_value(
                InvalidValueKind::TypeMismatch,
                self.klass.name(),
                name,
                "attribute does not hold a scalar",
            )),
        }
    }

    pub fn get_string(&self, name: &str) -> Result<Option<String>> {
        Ok(match self.value(name)? {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        })
    }

    pub fn get_i64(&self, name: &str) -> Result<Option<i64>> {
        Ok(self.value(name)?.as_i64())
    }

    pub fn get_f64(&self, name: &str) -> Result<Option<f64>> {
        Ok(self.value(name)?.as_f64())
    }

    pub fn get_bool(&self, name: &str) -> Result<Option<bool>> {
        Ok(self.value(name)?.as_bool())
    }

    /// Referenced object, fetched from the store on first access.
    pub fn get_object(self: &Arc<Self>, name: &str) -> Result<Option<ObjectHandle>> {
        let attr = Arc::clone(self.klass.attr(name)?);
        match self.raw_value(&attr) {
            FieldValue::Null => Ok(None),
            FieldValue::Object(o) => Ok(Some(o)),
            FieldValue::Unresolved(r) => self.resolve(&attr, r),
            _ => Err(invalid_value(
                InvalidValueKind::TypeMismatch,
                self.klass.name(),
                name,
                "attribute is not an object reference",
            )),
        }
    }

    fn resolve(&self, attr: &Attr, r: ObjRef) -> Result<Option<ObjectHandle>> {
        let store = self.require_store()?;
        let target = store.fetch_obj_ref(r)?;
        let mut state = self.write_state();
        if matches!(state.values[attr.index()], FieldValue::Unresolved(current) if current == r) {
            state.values[attr.index()] = target.clone().into();
        }
        Ok(target)
    }

    /// Set an attribute and register the change with the owning store.
    ///
    /// Referencing a transient object from an object already in a store adds
    /// the referenced object to that store.
    pub fn set(self: &Arc<Self>, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        let attr = Arc::clone(self.klass.attr(name)?);
        if attr.is_list() {
            return Err(invalid_value(
                InvalidValueKind::TypeMismatch,
                self.klass.name(),
                name,
                "list attributes are changed through add_to_list",
            ));
        }
        let value = self.check_value(&attr, value.into())?;
        let lifecycle = {
            let mut state = self.write_state();
            if state.lifecycle == Lifecycle::Deleted {
                return Err(lifecycle_error(
                    LifecycleErrorKind::Deleted,
                    format!("{}.{}", self.klass.name(), state.serial_num),
                    "cannot modify a deleted object",
                ));
            }
            state.values[attr.index()] = value.clone();
            state.changed.insert(attr.index());
            state.dirty = true;
            state.lifecycle
        };
        if lifecycle == Lifecycle::Transient {
            return Ok(());
        }
        let store = self.require_store()?;
        if let FieldValue::Object(target) = &value {
            if target.lifecycle() == Lifecycle::Transient {
                store.add_object(target)?;
            }
        }
        store.object_changed(self);
        Ok(())
    }

    pub fn set_null(self: &Arc<Self>, name: &str) -> Result<()> {
        self.set(name, FieldValue::Null)
    }

    fn check_value(&self, attr: &Attr, value: FieldValue) -> Result<FieldValue> {
        let mismatch = |msg: &str| {
            invalid_value(
                InvalidValueKind::TypeMismatch,
                self.klass.name(),
                attr.name(),
                msg,
            )
        };
        match (attr.attr_type(), value) {
            (_, FieldValue::Null) => Ok(FieldValue::Null),
            (AttrType::ObjRef { target }, FieldValue::Object(o)) => {
                if !o.klass().is_kind_of(target) {
                    return Err(mismatch(&format!(
                        "expected {target}, got {}",
                        o.klass().name()
                    )));
                }
                if o.is_deleted() {
                    return Err(lifecycle_error(
                        LifecycleErrorKind::Deleted,
                        o.describe(),
                        "cannot refer to a deleted object",
                    ));
                }
                if let (Some(mine), Some(theirs)) = (self.store.get(), o.store.get()) {
                    if !Weak::ptr_eq(mine, theirs) {
                        return Err(lifecycle_error(
                            LifecycleErrorKind::ForeignStore,
                            o.describe(),
                            "referenced object belongs to another store",
                        ));
                    }
                }
                Ok(FieldValue::Object(o))
            }
            (AttrType::ObjRef { .. }, FieldValue::Unresolved(r)) => Ok(FieldValue::Unresolved(r)),
            (AttrType::ObjRef { .. }, _) => Err(mismatch("expected an object reference")),
            (_, FieldValue::Scalar(v)) => attr.coerce(v).map(FieldValue::from),
            (_, _) => Err(mismatch("expected a scalar value")),
        }
    }

    /// Contents of a list attribute, loaded through the back reference on
    /// first access.
    pub fn list(self: &Arc<Self>, name: &str) -> Result<Vec<ObjectHandle>> {
        let attr = Arc::clone(self.klass.attr(name)?);
        let Some(back_ref) = attr.back_ref() else {
            return Err(invalid_value(
                InvalidValueKind::TypeMismatch,
                self.klass.name(),
                name,
                "attribute is not a list",
            ));
        };
        if let FieldValue::List(items) = self.raw_value(&attr) {
            return Ok(items);
        }
        let items = match self.store() {
            Some(store) => {
                let element = Arc::clone(store.model().klass(attr.target_klass().unwrap_or_default())?);
                let back = Arc::clone(element.attr(back_ref)?);
                store.objects_referencing_via(self, &element, &back)?
            }
            None => Vec::new(),
        };
        let mut state = self.write_state();
        match &state.values[attr.index()] {
            FieldValue::List(existing) => Ok(existing.clone()),
            _ => {
                state.values[attr.index()] = FieldValue::List(items.clone());
                Ok(items)
            }
        }
    }

    /// Append `child` to a list attribute, pointing its back reference here.
    /// A transient child joins this object's store.
    pub fn add_to_list(self: &Arc<Self>, name: &str, child: &ObjectHandle) -> Result<()> {
        let attr = Arc::clone(self.klass.attr(name)?);
        let (Some(element), Some(back_ref)) = (attr.target_klass(), attr.back_ref()) else {
            return Err(invalid_value(
                InvalidValueKind::TypeMismatch,
                self.klass.name(),
                name,
                "attribute is not a list",
            ));
        };
        if !child.klass().is_kind_of(element) {
            return Err(invalid_value(
                InvalidValueKind::TypeMismatch,
                self.klass.name(),
                name,
                format!("expected {element}, got {}", child.klass().name()),
            ));
        }
        self.list(name)?;
        child.set(back_ref, self)?;
        if self.lifecycle() != Lifecycle::Transient && child.lifecycle() == Lifecycle::Transient {
            self.require_store()?.add_object(child)?;
        }
        let mut state = self.write_state();
        if let FieldValue::List(items) = &mut state.values[attr.index()] {
            if !items.iter().any(|o| Arc::ptr_eq(o, child)) {
                items.push(Arc::clone(child));
            }
        }
        Ok(())
    }

    /// Required attributes that are currently unset.
    pub fn missing_required(&self) -> Vec<String> {
        let state = self.read_state();
        self.klass
            .sql_attrs()
            .filter(|a| a.is_required() && state.values[a.index()].is_null())
            .map(|a| a.name().to_string())
            .collect()
    }

    /// JSON rendering of the object's attributes.
    pub fn to_json(&self) -> serde_json::Value {
        let state = self.read_state();
        let mut map = serde_json::Map::new();
        map.insert("klass".into(), self.klass.name().into());
        map.insert("serialNum".into(), state.serial_num.into());
        for attr in self.klass.all_attrs() {
            map.insert(attr.name().into(), state.values[attr.index()].describe());
        }
        serde_json::Value::Object(map)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
