//! middlestore: an identity-mapped object store with relational persistence.
//!
//! Describe persistent classes with a [`ModelBuilder`], open an
//! [`ObjectStore`] over a SQL database and work with objects; the store
//! keeps exactly one live instance per stored row, tracks what changed on
//! each thread and writes it back with [`ObjectStore::save_changes`].
//!
//! ```
//! use middlestore::prelude::*;
//!
//! # fn main() -> middlestore::Result<()> {
//! let model = ModelBuilder::new("Contacts")
//!     .klass(KlassDef::new("Person").attr(AttrDef::string("name").required()))
//!     .build()?;
//! let (store, _sql) = middlestore::create_sqlite_store(
//!     model,
//!     SqliteDriver::in_memory()?.shared(),
//!     &StoreConfig::default(),
//! )?;
//!
//! let alice = store.create_object("Person")?;
//! alice.set("name", "Alice")?;
//! assert_eq!(alice.serial_num(), -1);
//!
//! store.add_object(&alice)?;
//! store.save_changes()?;
//! assert!(alice.serial_num() > 0);
//!
//! let fetched = store.fetch_object("Person", alice.serial_num())?;
//! assert!(std::sync::Arc::ptr_eq(&fetched, &alice));
//! # Ok(())
//! # }
//! ```
//!
//! The crates behind the facade can be used on their own:
//! `middlestore-core` (model, objects, store), `middlestore-sql` (dialects,
//! schema, SQL persistence) and `middlestore-sqlite` (SQLite driver, behind
//! the default `sqlite` feature).

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use middlestore_core::{
    Attr, AttrDef, AttrType, DeletePolicy, Error, FetchQuery, FieldValue, Klass, KlassDef, Lifecycle,
    MemoryPersistence, Model, ModelBuilder, ObjRef, ObjectHandle, ObjectKey, ObjectStore, Persistence,
    PersistentObject, Result, StoreDebugInfo, StoreSettings, Value, config_error,
};
pub use middlestore_sql::{
    Connection, DeleteBehavior, Dialect, DialectRegistry, Driver, SchemaGenerator, SqlPersistence,
    SqlStoreConfig,
};
#[cfg(feature = "sqlite")]
pub use middlestore_sqlite::{SqliteConnection, SqliteDriver};

/// Common imports.
pub mod prelude {
    pub use crate::StoreConfig;
    pub use middlestore_core::{
        AttrDef, DeletePolicy, Error, FetchQuery, FieldValue, KlassDef, Lifecycle, ModelBuilder, ObjRef,
        ObjectHandle, ObjectStore, Result, StoreSettings, Value,
    };
    pub use middlestore_sql::{DeleteBehavior, SqlPersistence, SqlStoreConfig};
    #[cfg(feature = "sqlite")]
    pub use middlestore_sqlite::SqliteDriver;
}

// ============================================================================
// Configuration
// ============================================================================

/// Store settings and SQL configuration in one document.
///
/// ```
/// use middlestore::StoreConfig;
///
/// let config = StoreConfig::from_json_str(
///     r#"{"store": {"threaded": false}, "sql": {"delete_behavior": "mark"}}"#,
/// )
/// .unwrap();
/// assert!(!config.store.threaded);
/// assert!(config.sql.marks_deletes());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub store: StoreSettings,
    pub sql: SqlStoreConfig,
}

impl StoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn store(mut self, settings: StoreSettings) -> Self {
        self.store = settings;
        self
    }

    #[must_use]
    pub fn sql(mut self, config: SqlStoreConfig) -> Self {
        self.sql = config;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| config_error(format!("invalid store config: {e}")))
    }
}

// ============================================================================
// Opening stores
// ============================================================================

/// Open a store over `driver`, whose database already holds the schema.
///
/// Returns the store and a handle on its SQL backend (for statement counts,
/// schema management and dumps).
#[tracing::instrument(level = "debug", skip_all, fields(model = %model.name(), driver = driver.name()))]
pub fn open_store(
    model: Arc<Model>,
    driver: Arc<dyn Driver>,
    config: &StoreConfig,
) -> Result<(Arc<ObjectStore>, SqlPersistence)> {
    let sql = SqlPersistence::new(driver, config.sql.clone())?;
    let store = ObjectStore::new(model, config.store.clone(), sql.clone())?;
    Ok((store, sql))
}

/// Install the schema for `model` on an empty database, then open a store.
pub fn create_store(
    model: Arc<Model>,
    driver: Arc<dyn Driver>,
    config: &StoreConfig,
) -> Result<(Arc<ObjectStore>, SqlPersistence)> {
    SqlPersistence::new(Arc::clone(&driver), config.sql.clone())?.install_schema(&model)?;
    open_store(model, driver, config)
}

/// [`open_store`] over SQLite.
#[cfg(feature = "sqlite")]
pub fn open_sqlite_store(
    model: Arc<Model>,
    driver: Arc<SqliteDriver>,
    config: &StoreConfig,
) -> Result<(Arc<ObjectStore>, SqlPersistence)> {
    open_store(model, driver, &sqlite_config(config))
}

/// [`create_store`] over SQLite.
#[cfg(feature = "sqlite")]
pub fn create_sqlite_store(
    model: Arc<Model>,
    driver: Arc<SqliteDriver>,
    config: &StoreConfig,
) -> Result<(Arc<ObjectStore>, SqlPersistence)> {
    create_store(model, driver, &sqlite_config(config))
}

#[cfg(feature = "sqlite")]
fn sqlite_config(config: &StoreConfig) -> StoreConfig {
    let mut config = config.clone();
    config.sql.dialect = "sqlite".to_string();
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_config_defaults_and_errors() {
        let config = StoreConfig::default();
        assert!(config.store.threaded);
        assert_eq!(config.sql.dialect, "sqlite");
        let err = StoreConfig::from_json_str(r#"{"stor": {}}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_builder_setters() {
        let config = StoreConfig::new()
            .store(StoreSettings::new().threaded(false))
            .sql(SqlStoreConfig::new().pool_size(4));
        assert!(!config.store.threaded);
        assert_eq!(config.sql.pool_size, 4);
    }
}
