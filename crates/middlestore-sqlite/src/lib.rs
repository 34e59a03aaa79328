//! SQLite driver for middlestore, built on `rusqlite`.
//!
//! [`SqliteDriver`] opens either a database file or a named in-memory
//! database. In-memory databases use SQLite's shared cache so that every
//! connection the driver opens sees the same data; the driver holds one
//! connection open for as long as it lives so the database is not dropped
//! between operations.
//!
//! The driver reports thread-safety level 1: it may be shared between
//! threads, but each thread works on its own connection.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{ErrorCode, OpenFlags, params_from_iter};

use middlestore_core::error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind};
use middlestore_core::{Error, Result, Value};
use middlestore_sql::{Connection, Driver, Row};

/// How long a connection waits on a locked database file.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static MEMORY_DATABASES: AtomicU64 = AtomicU64::new(0);

// ============================================================================
// Driver
// ============================================================================

#[derive(Debug, Clone)]
enum Target {
    File(PathBuf),
    /// Shared-cache URI of a named in-memory database.
    Memory(String),
}

/// Opens SQLite connections.
pub struct SqliteDriver {
    target: Target,
    keep_alive: Option<Mutex<rusqlite::Connection>>,
}

impl fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDriver").field("target", &self.target).finish()
    }
}

impl SqliteDriver {
    /// Driver for the database file at `path`, created on first connect.
    pub fn open(path: impl AsRef<Path>) -> Self {
        Self {
            target: Target::File(path.as_ref().to_path_buf()),
            keep_alive: None,
        }
    }

    /// Driver for a fresh in-memory database private to this driver.
    pub fn in_memory() -> Result<Self> {
        let n = MEMORY_DATABASES.fetch_add(1, Ordering::Relaxed);
        let target = Target::Memory(format!(
            "file:middlestore-{}-{n}?mode=memory&cache=shared",
            std::process::id()
        ));
        let keep_alive = open_target(&target)?;
        Ok(Self {
            target,
            keep_alive: Some(Mutex::new(keep_alive)),
        })
    }

    /// Shared driver handle, as expected by `SqlPersistence`.
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn is_in_memory(&self) -> bool {
        self.keep_alive.is_some()
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::File(path) => Some(path),
            Target::Memory(_) => None,
        }
    }

    /// Open a raw connection to the driver's database.
    pub fn connect_sqlite(&self) -> Result<SqliteConnection> {
        Ok(SqliteConnection {
            conn: open_target(&self.target)?,
        })
    }
}

fn open_target(target: &Target) -> Result<rusqlite::Connection> {
    let conn = match target {
        Target::File(path) => rusqlite::Connection::open(path),
        Target::Memory(uri) => rusqlite::Connection::open_with_flags(
            uri,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_URI,
        ),
    }
    .map_err(|e| connect_error(&format!("cannot open SQLite database {target:?}"), e))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| connect_error("cannot set SQLite busy timeout", e))?;
    tracing::trace!(target = ?target, "Opened SQLite connection");
    Ok(conn)
}

impl Driver for SqliteDriver {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn thread_safety(&self) -> u8 {
        1
    }

    fn connect(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(self.connect_sqlite()?))
    }
}

// ============================================================================
// Connection
// ============================================================================

/// One SQLite connection.
pub struct SqliteConnection {
    conn: rusqlite::Connection,
}

impl fmt::Debug for SqliteConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConnection")
            .field("path", &self.conn.path())
            .finish()
    }
}

impl SqliteConnection {
    /// The underlying `rusqlite` connection.
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.conn
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|e| query_error(e, sql, QueryErrorKind::Syntax))?;
        let changed = stmt
            .execute(params_from_iter(params.iter().map(to_sqlite)))
            .map_err(|e| query_error(e, sql, QueryErrorKind::Database))?;
        Ok(changed as u64)
    }

    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut stmt = self
            .conn
            .prepare_cached(sql)
            .map_err(|e| query_error(e, sql, QueryErrorKind::Syntax))?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
            .into();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sqlite)))
            .map_err(|e| query_error(e, sql, QueryErrorKind::Database))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .map_err(|e| query_error(e, sql, QueryErrorKind::Database))?
        {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let value = row
                    .get_ref(i)
                    .map_err(|e| query_error(e, sql, QueryErrorKind::Conversion))?;
                values.push(from_sqlite(value));
            }
            out.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(out)
    }

    fn last_insert_id(&mut self) -> Result<i64> {
        Ok(self.conn.last_insert_rowid())
    }
}

// ============================================================================
// Value mapping
// ============================================================================

/// Bind form of a value. Dates and decimals are stored as text.
fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        Value::Int(i) => SqliteValue::Integer(i64::from(*i)),
        Value::BigInt(i) => SqliteValue::Integer(*i),
        Value::Double(d) => SqliteValue::Real(*d),
        Value::Text(s) | Value::Decimal(s) => SqliteValue::Text(s.clone()),
        Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => SqliteValue::Text(value.to_string()),
    }
}

/// Storage class to value. Attribute types are applied later by coercion.
fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::BigInt(i),
        ValueRef::Real(f) => Value::Double(f),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => Value::Text(String::from_utf8_lossy(bytes).into_owned()),
    }
}

// ============================================================================
// Errors
// ============================================================================

fn connect_error(message: &str, e: rusqlite::Error) -> Error {
    Error::Connection(ConnectionError {
        kind: ConnectionErrorKind::Connect,
        message: format!("{message}: {e}"),
        source: Some(Box::new(e)),
    })
}

/// Map a rusqlite error. Constraint violations are recognized wherever they
/// occur; otherwise `fallback` says which phase failed.
fn query_error(e: rusqlite::Error, sql: &str, fallback: QueryErrorKind) -> Error {
    let kind = match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            QueryErrorKind::Constraint
        }
        rusqlite::Error::FromSqlConversionFailure(..)
        | rusqlite::Error::InvalidColumnType(..)
        | rusqlite::Error::IntegralValueOutOfRange(..) => QueryErrorKind::Conversion,
        _ => fallback,
    };
    Error::Query(QueryError {
        kind,
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    })
}
