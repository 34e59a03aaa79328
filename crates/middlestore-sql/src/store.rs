//! SQL-backed persistence for an [`ObjectStore`].
//!
//! [`SqlPersistence`] maps every concrete class to a table, reconciles
//! fetched rows with the store's identity map and commits saves in three
//! phases on one connection inside one transaction:
//!
//! 1. deletions (hard `DELETE` or a `deleted` timestamp),
//! 2. inserts, binding `NULL` for references to objects that have no
//!    permanent serial number yet and patching them with deferred updates
//!    once the whole batch is in,
//! 3. updates of the changed columns of modified objects.
//!
//! ```no_run
//! use std::sync::Arc;
//! use middlestore_core::{ObjectStore, StoreSettings};
//! use middlestore_sql::{Driver, SqlPersistence, SqlStoreConfig};
//!
//! fn open(model: Arc<middlestore_core::Model>, driver: Arc<dyn Driver>) -> middlestore_core::Result<()> {
//!     let sql = SqlPersistence::new(driver, SqlStoreConfig::default())?;
//!     sql.install_schema(&model)?;
//!     let store = ObjectStore::new(model, StoreSettings::default(), sql.clone())?;
//!     let person = store.create_object("Person")?;
//!     person.set("name", "Alice")?;
//!     store.add_object(&person)?;
//!     store.save_changes()?;
//!     println!("{} statements", sql.sql_count());
//!     Ok(())
//! }
//! ```

use std::fmt;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Instant;

use middlestore_core::error::{ConnectionErrorKind, ModelError, ModelErrorKind, QueryErrorKind};
use middlestore_core::model::{Attr, Klass, Model};
use middlestore_core::{
    Error, FetchQuery, FieldValue, ObjRef, ObjectHandle, ObjectStore, Persistence, PersistentObject,
    Result, SaveTransaction, StoreSettings, Value, integrity_error,
};

use crate::config::SqlStoreConfig;
use crate::connection::{Connection, Driver, Row, connection_error, query_error};
use crate::dialect::{Dialect, DialectRegistry};
use crate::pool::{ConnectionSource, SourcedConnection};
use crate::schema::{KLASS_IDS_TABLE, SchemaGenerator};
use crate::statements::{Statement, StatementBuilder};

/// Target of the SQL echo.
pub const SQL_LOG_TARGET: &str = "middlestore::sql";

struct SqlInner {
    driver: Arc<dyn Driver>,
    dialect: Arc<dyn Dialect>,
    config: SqlStoreConfig,
    statements: StatementBuilder,
    source: OnceLock<ConnectionSource>,
    sql_count: AtomicU64,
}

/// Relational persistence backend.
///
/// Cheap to clone; clones share connections and the statement counter, so a
/// clone kept by the caller observes the one handed to the store.
#[derive(Clone)]
pub struct SqlPersistence {
    inner: Arc<SqlInner>,
}

impl fmt::Debug for SqlPersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlPersistence")
            .field("driver", &self.inner.driver.name())
            .field("dialect", &self.inner.dialect.name())
            .field("source", &self.inner.source.get())
            .field("sql_count", &self.sql_count())
            .finish()
    }
}

impl SqlPersistence {
    /// Backend for `driver`, using the dialect named in `config`.
    pub fn new(driver: Arc<dyn Driver>, config: SqlStoreConfig) -> Result<Self> {
        let dialect = DialectRegistry::default().get(&config.dialect)?;
        Ok(Self::with_dialect(driver, dialect, config))
    }

    /// Backend with an explicitly chosen dialect; `config.dialect` is ignored.
    pub fn with_dialect(driver: Arc<dyn Driver>, dialect: Arc<dyn Dialect>, config: SqlStoreConfig) -> Self {
        let statements = StatementBuilder::new(Arc::clone(&dialect), config.clone());
        Self {
            inner: Arc::new(SqlInner {
                driver,
                dialect,
                config,
                statements,
                source: OnceLock::new(),
                sql_count: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &SqlStoreConfig {
        &self.inner.config
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.inner.dialect.as_ref()
    }

    pub fn schema_generator(&self) -> SchemaGenerator {
        SchemaGenerator::new(Arc::clone(&self.inner.dialect), self.inner.config.clone())
    }

    /// Statements executed so far.
    pub fn sql_count(&self) -> u64 {
        self.inner.sql_count.load(Ordering::Relaxed)
    }

    /// Create the class tables and the class id table on an empty database.
    #[tracing::instrument(level = "debug", skip(self, model), fields(model = %model.name()))]
    pub fn install_schema(&self, model: &Model) -> Result<()> {
        let mut conn = self.inner.driver.connect()?;
        for sql in self.schema_generator().create_statements(model) {
            self.execute(conn.as_mut(), &Statement { sql, params: Vec::new() })?;
        }
        tracing::info!(model = %model.name(), dialect = self.inner.dialect.name(), "Installed schema");
        Ok(())
    }

    /// Drop everything [`install_schema`](Self::install_schema) created.
    pub fn drop_schema(&self, model: &Model) -> Result<()> {
        let mut conn = self.inner.driver.connect()?;
        for sql in self.schema_generator().drop_statements(model) {
            self.execute(conn.as_mut(), &Statement { sql, params: Vec::new() })?;
        }
        Ok(())
    }

    /// Write the class id table as CSV.
    pub fn dump_klass_ids(&self, out: &mut dyn Write) -> Result<()> {
        let rows = self.read_klass_ids()?;
        writeln!(out, "id,name")?;
        for (id, name) in rows {
            writeln!(out, "{id},{name}")?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Connections and statement execution
    // ------------------------------------------------------------------------

    fn source(&self) -> Result<&ConnectionSource> {
        self.inner.source.get().ok_or_else(|| {
            connection_error(
                ConnectionErrorKind::Connect,
                "SQL persistence is not connected to a store",
            )
        })
    }

    fn acquire(&self) -> Result<SourcedConnection<'_>> {
        self.source()?.acquire()
    }

    fn echo(&self, statement: &Statement) {
        let count = self.inner.sql_count.fetch_add(1, Ordering::Relaxed) + 1;
        if self.inner.config.sql_log {
            tracing::debug!(
                target: SQL_LOG_TARGET,
                count,
                sql = %self.inner.statements.render(statement),
                "SQL"
            );
        }
    }

    fn execute(&self, conn: &mut dyn Connection, statement: &Statement) -> Result<u64> {
        self.echo(statement);
        conn.execute(&statement.sql, &statement.params)
    }

    fn query(&self, conn: &mut dyn Connection, statement: &Statement) -> Result<Vec<Row>> {
        self.echo(statement);
        conn.query(&statement.sql, &statement.params)
    }

    fn read_klass_ids(&self) -> Result<Vec<(i64, String)>> {
        let q = |s: &str| self.inner.dialect.quote_identifier(s);
        let statement = Statement {
            sql: format!(
                "SELECT {}, {} FROM {} ORDER BY {}",
                q("id"),
                q("name"),
                q(KLASS_IDS_TABLE),
                q("id")
            ),
            params: Vec::new(),
        };
        let rows = {
            let mut conn = self.acquire()?;
            self.query(&mut *conn, &statement)?
        };
        rows.iter()
            .map(|row| {
                let id = row.get(0).as_i64();
                let name = row.get(1).as_str();
                match (id, name) {
                    (Some(id), Some(name)) => Ok((id, name.to_string())),
                    _ => Err(query_error(
                        QueryErrorKind::Conversion,
                        "class id rows must hold an integer id and a name",
                        &statement.sql,
                    )),
                }
            })
            .collect()
    }

    fn verify_klass_ids(&self, model: &Model) -> Result<()> {
        for (id, name) in self.read_klass_ids()? {
            let inconsistent = |message: String| {
                Error::Model(ModelError {
                    kind: ModelErrorKind::Inconsistent,
                    message,
                })
            };
            let klass = model.lookup_klass(&name).ok_or_else(|| {
                inconsistent(format!(
                    "the database has a class id for {name:?}, but model {} has no such class",
                    model.name()
                ))
            })?;
            if i64::from(klass.id()) != id {
                return Err(inconsistent(format!(
                    "class {name} has id {id} in the database but {} in the model",
                    klass.id()
                )));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Row decoding
    // ------------------------------------------------------------------------

    /// Serial number and attribute slots of one row selected with
    /// [`StatementBuilder::select_columns`].
    fn decode_row(&self, klass: &Klass, row: &Row, sql: &str) -> Result<(i64, Vec<FieldValue>)> {
        let serial_num = row.get(0).as_i64().ok_or_else(|| {
            query_error(
                QueryErrorKind::Conversion,
                format!("{} row without a serial number", klass.name()),
                sql,
            )
        })?;
        let ref_part = |v: &Value| -> Result<Option<u32>> {
            v.as_i64()
                .map(|raw| {
                    u32::try_from(raw).map_err(|_| {
                        query_error(
                            QueryErrorKind::Conversion,
                            format!("reference component {raw} is out of range"),
                            sql,
                        )
                    })
                })
                .transpose()
        };

        let mut values = Vec::with_capacity(klass.all_attrs().len());
        let mut column = 1;
        for attr in klass.all_attrs() {
            if !attr.has_sql_column() {
                values.push(FieldValue::Null);
                continue;
            }
            if attr.is_obj_ref() {
                if self.inner.config.use_bigint_obj_ref_columns {
                    let raw = row.get(column).as_i64().unwrap_or(0);
                    column += 1;
                    values.push(FieldValue::from(ObjRef::from_i64(raw)));
                } else {
                    let klass_id = ref_part(row.get(column))?;
                    let serial = ref_part(row.get(column + 1))?;
                    column += 2;
                    // A NULL object id, or both parts zero, is no reference.
                    values.push(match serial {
                        None => FieldValue::Null,
                        Some(serial) => FieldValue::from(ObjRef::join(klass_id.unwrap_or(0), serial)),
                    });
                }
            } else {
                let value = attr.coerce(row.get(column).clone())?;
                column += 1;
                values.push(FieldValue::from(value));
            }
        }
        Ok((serial_num, values))
    }

    fn fetch_rows(
        &self,
        store: &ObjectStore,
        klass: &Arc<Klass>,
        statement: &Statement,
        refresh: bool,
        out: &mut Vec<ObjectHandle>,
    ) -> Result<()> {
        let rows = {
            let mut conn = self.acquire()?;
            self.query(&mut *conn, statement)?
        };
        for row in &rows {
            let (serial_num, values) = self.decode_row(klass, row, &statement.sql)?;
            if let Some(object) = store.reconcile(klass, serial_num, values, refresh) {
                out.push(object);
            }
        }
        Ok(())
    }

    fn concrete_klasses(store: &ObjectStore, klass: &Arc<Klass>, deep: bool) -> Vec<Arc<Klass>> {
        let klasses = if deep {
            store.model().klass_and_descendants(klass)
        } else {
            vec![Arc::clone(klass)]
        };
        klasses.into_iter().filter(|k| !k.is_abstract()).collect()
    }

    // ------------------------------------------------------------------------
    // Value encoding
    // ------------------------------------------------------------------------

    /// Parameters for the columns of `attr` on `object`. The flag is set when
    /// the value refers to an object without a permanent serial number and
    /// NULL was bound in its place.
    fn attr_params(&self, object: &PersistentObject, attr: &Attr) -> Result<(Vec<Value>, bool)> {
        let statements = &self.inner.statements;
        match object.raw_value(attr) {
            FieldValue::Object(target) if attr.is_obj_ref() => {
                if target.serial_num() > 0 {
                    Ok((statements.obj_ref_params(Some(target.obj_ref()?)), false))
                } else {
                    Ok((statements.obj_ref_params(None), true))
                }
            }
            FieldValue::Unresolved(obj_ref) => Ok((statements.obj_ref_params(Some(obj_ref)), false)),
            FieldValue::Null if attr.is_obj_ref() => Ok((statements.obj_ref_params(None), false)),
            FieldValue::Scalar(value) => Ok((vec![value], false)),
            FieldValue::Null | FieldValue::Object(_) | FieldValue::List(_) => Ok((vec![Value::Null], false)),
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

impl Persistence for SqlPersistence {
    fn name(&self) -> &str {
        self.inner.dialect.name()
    }

    #[tracing::instrument(level = "debug", skip_all, fields(model = %model.name(), driver = self.inner.driver.name()))]
    fn connect(&self, model: &Arc<Model>, settings: &StoreSettings) -> Result<()> {
        if self.inner.source.get().is_none() {
            let source = ConnectionSource::for_driver(
                Arc::clone(&self.inner.driver),
                settings.threaded,
                self.inner.config.pool_size,
            )?;
            if self.inner.source.set(source).is_err() {
                // A concurrent connect won; the source built here is closed unused.
                tracing::debug!("Connection source already set, keeping the existing one");
            }
        }
        self.verify_klass_ids(model)?;
        tracing::info!(
            driver = self.inner.driver.name(),
            dialect = self.inner.dialect.name(),
            thread_safety = self.inner.driver.thread_safety(),
            threaded = settings.threaded,
            "Connected SQL store"
        );
        Ok(())
    }

    fn begin_save<'a>(&'a self, store: &'a ObjectStore) -> Result<Box<dyn SaveTransaction + 'a>> {
        let mut conn = self.acquire()?;
        self.echo(&Statement {
            sql: "BEGIN".to_string(),
            params: Vec::new(),
        });
        conn.begin()?;
        Ok(Box::new(SqlSave {
            persistence: self,
            store,
            conn,
            started: Instant::now(),
        }))
    }

    fn fetch_objects(
        &self,
        store: &ObjectStore,
        klass: &Arc<Klass>,
        query: &FetchQuery,
    ) -> Result<Vec<ObjectHandle>> {
        let mut out = Vec::new();
        for concrete in Self::concrete_klasses(store, klass, query.deep) {
            let statement = self.inner.statements.select(&concrete, query);
            self.fetch_rows(store, &concrete, &statement, query.refresh, &mut out)?;
        }
        Ok(out)
    }

    fn fetch_referencing(
        &self,
        store: &ObjectStore,
        target: &PersistentObject,
        klass: &Arc<Klass>,
        attr: &Arc<Attr>,
    ) -> Result<Vec<ObjectHandle>> {
        if target.serial_num() <= 0 {
            return Ok(Vec::new());
        }
        let target_ref = target.obj_ref()?;
        let mut out = Vec::new();
        for concrete in Self::concrete_klasses(store, klass, true) {
            let statement = self
                .inner
                .statements
                .select_referencing(&concrete, attr, target_ref);
            self.fetch_rows(store, &concrete, &statement, true, &mut out)?;
        }
        Ok(out)
    }
}

// ============================================================================
// Save transaction
// ============================================================================

struct SqlSave<'a> {
    persistence: &'a SqlPersistence,
    store: &'a ObjectStore,
    conn: SourcedConnection<'a>,
    started: Instant,
}

impl SqlSave<'_> {
    fn execute(&mut self, statement: &Statement) -> Result<u64> {
        self.persistence.execute(&mut *self.conn, statement)
    }

    fn control(&mut self, sql: &str) {
        self.persistence.echo(&Statement {
            sql: sql.to_string(),
            params: Vec::new(),
        });
    }
}

impl SaveTransaction for SqlSave<'_> {
    fn commit_deletions(&mut self, objects: &[ObjectHandle]) -> Result<()> {
        for object in objects {
            let statement = self
                .persistence
                .inner
                .statements
                .delete(object.klass(), object.serial_num());
            self.execute(&statement)?;
        }
        Ok(())
    }

    fn commit_inserts(&mut self, objects: &[ObjectHandle]) -> Result<()> {
        let persistence = self.persistence;
        let config = &persistence.inner.config;
        let statements = &persistence.inner.statements;
        let mut fixups: Vec<(ObjectHandle, Arc<Attr>)> = Vec::new();

        for object in objects {
            let klass = object.klass();
            let allocated = persistence.inner.dialect.next_insert_id(
                &mut *self.conn,
                klass,
                &config.serial_column,
            )?;
            let mut columns = Vec::new();
            let mut params = Vec::new();
            for attr in klass.sql_attrs() {
                let (values, deferred) = persistence.attr_params(object, attr)?;
                if deferred {
                    fixups.push((Arc::clone(object), Arc::clone(attr)));
                }
                columns.extend(config.column_names(attr));
                params.extend(values);
            }
            let statement = statements.insert(klass, allocated, &columns, params);
            self.execute(&statement)?;
            let serial_num = match allocated {
                Some(id) => id,
                None => self.conn.last_insert_id()?,
            };
            self.store.register_inserted(object, serial_num)?;
        }

        for (object, attr) in fixups {
            let FieldValue::Object(target) = object.raw_value(&attr) else {
                continue;
            };
            if target.serial_num() <= 0 {
                return Err(integrity_error(format!(
                    "{}.{} refers to {}, which was not saved with it",
                    object.describe(),
                    attr.name(),
                    target.describe()
                )));
            }
            let params = statements.obj_ref_params(Some(target.obj_ref()?));
            let statement = statements.update(
                object.klass(),
                object.serial_num(),
                &config.column_names(&attr),
                params,
            );
            tracing::debug!(
                object = %object.describe(),
                attr = attr.name(),
                target = %target.describe(),
                "Resolving deferred reference"
            );
            self.execute(&statement)?;
        }
        Ok(())
    }

    fn commit_updates(&mut self, objects: &[ObjectHandle]) -> Result<()> {
        let persistence = self.persistence;
        let config = &persistence.inner.config;
        for object in objects {
            let mut columns = Vec::new();
            let mut params = Vec::new();
            for attr in object.changed_attr_defs().iter().filter(|a| a.has_sql_column()) {
                let (values, deferred) = persistence.attr_params(object, attr)?;
                if deferred {
                    return Err(integrity_error(format!(
                        "{}.{} refers to an object that has not been saved",
                        object.describe(),
                        attr.name()
                    )));
                }
                columns.extend(config.column_names(attr));
                params.extend(values);
            }
            if columns.is_empty() {
                continue;
            }
            let statement = persistence.inner.statements.update(
                object.klass(),
                object.serial_num(),
                &columns,
                params,
            );
            self.execute(&statement)?;
        }
        Ok(())
    }

    fn commit(mut self: Box<Self>) -> Result<()> {
        self.control("COMMIT");
        self.conn.commit()?;
        tracing::debug!(
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "SQL transaction committed"
        );
        Ok(())
    }

    fn rollback(mut self: Box<Self>) -> Result<()> {
        self.control("ROLLBACK");
        self.conn.rollback()?;
        tracing::warn!(
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "SQL transaction rolled back"
        );
        Ok(())
    }
}
