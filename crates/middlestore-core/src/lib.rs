//! Core object model for middlestore.
//!
//! `middlestore-core` holds everything that does not speak SQL:
//!
//! - **Metamodel**: [`Model`], [`Klass`] and [`Attr`] describe persistent
//!   classes, built and validated through [`ModelBuilder`].
//! - **Objects**: [`PersistentObject`] instances shared as [`ObjectHandle`]s,
//!   identified by [`ObjectKey`] once committed and packed into [`ObjRef`]s
//!   for storage.
//! - **Store**: [`ObjectStore`] is the identity map. It tracks new, changed
//!   and deleted objects per thread, plans deletes across reference policies
//!   and commits through a [`Persistence`] backend.
//!
//! The SQL backend lives in `middlestore-sql`; most applications use the
//! `middlestore` facade.

pub mod cache;
pub mod cascade;
pub mod error;
pub mod model;
pub mod object;
pub mod objref;
pub mod per_thread;
pub mod persistence;
pub mod settings;
pub mod store;
pub mod value;

pub use cache::{ObjectCache, RetainCache, WeakCache};
pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DeleteObjectWithReferencesError,
    DeleteReferencedError, Error, IntegrityError, InvalidValueError, InvalidValueKind,
    LifecycleError, LifecycleErrorKind, ModelError, ModelErrorKind, ObjRefError, QueryError,
    QueryErrorKind, ReferenceViolation, Result, ThreadingConfigurationError, UnknownObjectError,
    config_error, integrity_error,
};
pub use model::{Attr, AttrDef, AttrType, DeletePolicy, Klass, KlassDef, Model, ModelBuilder};
pub use object::{FieldValue, Lifecycle, ObjectHandle, ObjectKey, PersistentObject};
pub use objref::ObjRef;
pub use per_thread::{IdentitySet, PerThread, Scope};
pub use persistence::{FetchQuery, MemoryPersistence, Persistence, SaveTransaction};
pub use settings::StoreSettings;
pub use store::{ObjectStore, StoreDebugInfo};
pub use value::Value;
