//! Blocking database connection contract.
//!
//! Drivers implement [`Driver`] and [`Connection`]; the SQL persistence layer
//! only talks to these traits. Statements use positional parameters rendered
//! by the active [`Dialect`](crate::dialect::Dialect).

use std::sync::Arc;

use middlestore_core::error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind};
use middlestore_core::{Error, Result, Value};

// ============================================================================
// Row
// ============================================================================

/// One result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Value at `index`; `Value::Null` past the end.
    pub fn get(&self, index: usize) -> &Value {
        static NULL: Value = Value::Null;
        self.values.get(index).unwrap_or(&NULL)
    }

    /// Value of the column named `name` (case-insensitive).
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|i| self.values.get(i))
    }
}

// ============================================================================
// Traits
// ============================================================================

/// An open database connection.
pub trait Connection: Send {
    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run a query and collect its rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Id generated by the most recent INSERT on this connection.
    fn last_insert_id(&mut self) -> Result<i64>;

    fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN", &[]).map(|_| ())
    }

    fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT", &[]).map(|_| ())
    }

    fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK", &[]).map(|_| ())
    }
}

/// Opens connections and reports how they may be shared.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    /// Thread-safety level of the driver:
    ///
    /// - `0`: connections and the driver itself must stay on one thread
    /// - `1`: the driver may be shared; each thread needs its own connection
    /// - `2`, `3`: connections may be shared between threads
    fn thread_safety(&self) -> u8;

    fn connect(&self) -> Result<Box<dyn Connection>>;
}

// ============================================================================
// Error helpers
// ============================================================================

/// Build a connection error.
pub fn connection_error(kind: ConnectionErrorKind, msg: impl Into<String>) -> Error {
    Error::Connection(ConnectionError {
        kind,
        message: msg.into(),
        source: None,
    })
}

/// Build a query error carrying the offending SQL.
pub fn query_error(kind: QueryErrorKind, msg: impl Into<String>, sql: &str) -> Error {
    Error::Query(QueryError {
        kind,
        message: msg.into(),
        sql: Some(sql.to_string()),
        source: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Row {
        let columns: Arc<[String]> = vec!["serialNum".to_string(), "name".to_string()].into();
        Row::new(columns, vec![Value::BigInt(3), Value::from("Ann")])
    }

    #[test]
    fn test_row_access() {
        let row = row();
        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), &Value::BigInt(3));
        assert_eq!(row.get(9), &Value::Null);
        assert_eq!(row.get_named("NAME"), Some(&Value::from("Ann")));
        assert!(row.get_named("missing").is_none());
    }

    #[test]
    fn test_query_error_keeps_sql() {
        let err = query_error(QueryErrorKind::Syntax, "bad", "SELEC 1");
        assert_eq!(err.sql(), Some("SELEC 1"));
        assert!(err.to_string().contains("SELEC 1"));
    }
}
