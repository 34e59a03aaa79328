//! SQL dialect strategies.
//!
//! A [`Dialect`] captures everything that differs between database products:
//! parameter placeholders, identifier quoting, column types, literal
//! rendering, primary keys, sequences and how new ids are obtained. Dialects
//! are looked up by name in a [`DialectRegistry`]; custom ones are added with
//! [`DialectRegistry::register`].

mod mysql;
mod postgres;
mod sqlite;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use middlestore_core::model::{AttrType, Klass};
use middlestore_core::{Result, Value, config_error};

use crate::connection::Connection;

pub use mysql::MySqlDialect;
pub use postgres::PostgresDialect;
pub use sqlite::SqliteDialect;

/// Product-specific SQL rendering.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Registry name, lowercase.
    fn name(&self) -> &'static str;

    /// Placeholder for the `index`-th parameter (1-based).
    fn placeholder(&self, index: usize) -> String {
        let _ = index;
        "?".to_string()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// Column type for an attribute type. Object references use the packed
    /// 64-bit form; split reference columns use the `Int` type.
    fn sql_type(&self, attr_type: &AttrType) -> String;

    fn sql_for_null(&self) -> &'static str {
        "NULL"
    }

    /// SQL literal for a non-null value.
    fn sql_for_non_null(&self, value: &Value) -> String {
        match value {
            Value::Null => self.sql_for_null().to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Double(d) => d.to_string(),
            Value::Decimal(d) => d.clone(),
            Value::Text(s) => quote_string(s),
            Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => quote_string(&value.to_string()),
        }
    }

    /// Literal for any value, null included.
    fn sql_value(&self, value: &Value) -> String {
        if value.is_null() {
            self.sql_for_null().to_string()
        } else {
            self.sql_for_non_null(value)
        }
    }

    /// Column definition of the serial primary key.
    fn primary_key_def(&self, klass: &Klass, serial_column: &str) -> String;

    /// `CREATE INDEX` statements for the indexed columns of `klass`.
    fn write_index_defs(&self, klass: &Klass, columns: &[String]) -> Vec<String> {
        let table = klass.sql_table_name();
        columns
            .iter()
            .map(|column| {
                format!(
                    "CREATE INDEX {} ON {} ({})",
                    self.quote_identifier(&format!("{table}_{column}_index")),
                    self.quote_identifier(table),
                    self.quote_identifier(column)
                )
            })
            .collect()
    }

    /// Expression for the current timestamp.
    fn now_call(&self) -> &'static str {
        "CURRENT_TIMESTAMP"
    }

    /// INSERT for a row with no explicit column values.
    fn insert_default_values(&self, table: &str) -> String {
        format!("INSERT INTO {} DEFAULT VALUES", self.quote_identifier(table))
    }

    /// Pre-allocate the serial number of the next row of `klass`, or `None`
    /// when the id is only known after the insert.
    fn next_insert_id(
        &self,
        conn: &mut dyn Connection,
        klass: &Klass,
        serial_column: &str,
    ) -> Result<Option<i64>> {
        let _ = (conn, klass, serial_column);
        Ok(None)
    }

    /// DDL that must run before the class table is created.
    fn create_sequence_defs(&self, klass: &Klass, serial_column: &str) -> Vec<String> {
        let _ = (klass, serial_column);
        Vec::new()
    }

    /// DDL undoing [`create_sequence_defs`](Self::create_sequence_defs).
    fn drop_sequence_defs(&self, klass: &Klass, serial_column: &str) -> Vec<String> {
        let _ = (klass, serial_column);
        Vec::new()
    }
}

/// Single-quote a string literal, doubling embedded quotes.
pub fn quote_string(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

// ============================================================================
// Registry
// ============================================================================

/// Dialects by name.
#[derive(Debug, Clone)]
pub struct DialectRegistry {
    dialects: BTreeMap<String, Arc<dyn Dialect>>,
}

impl Default for DialectRegistry {
    /// Registry holding `sqlite`, `postgresql` and `mysql`.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SqliteDialect));
        registry.register(Arc::new(PostgresDialect));
        registry.register(Arc::new(MySqlDialect));
        registry
    }
}

impl DialectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn empty() -> Self {
        Self {
            dialects: BTreeMap::new(),
        }
    }

    /// Add or replace a dialect under its own name.
    pub fn register(&mut self, dialect: Arc<dyn Dialect>) {
        self.dialects.insert(dialect.name().to_ascii_lowercase(), dialect);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Dialect>> {
        self.dialects
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| {
                config_error(format!(
                    "unknown SQL dialect {name:?}; registered: {}",
                    self.names().join(", ")
                ))
            })
    }

    pub fn names(&self) -> Vec<&str> {
        self.dialects.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_builtin_dialects_are_registered() {
        let registry = DialectRegistry::default();
        assert_eq!(registry.names(), vec!["mysql", "postgresql", "sqlite"]);
        assert_eq!(registry.get("SQLite").unwrap().name(), "sqlite");
        let err = registry.get("oracle").unwrap_err();
        assert!(matches!(err, middlestore_core::Error::Config(_)));
    }

    #[test]
    fn test_register_custom_dialect() {
        #[derive(Debug)]
        struct Quirky;

        impl Dialect for Quirky {
            fn name(&self) -> &'static str {
                "quirky"
            }

            fn sql_type(&self, _attr_type: &AttrType) -> String {
                "blob".to_string()
            }

            fn primary_key_def(&self, _klass: &Klass, serial_column: &str) -> String {
                format!("{serial_column} serial")
            }
        }

        let mut registry = DialectRegistry::empty();
        assert!(registry.get("quirky").is_err());
        registry.register(Arc::new(Quirky));
        let quirky = registry.get("quirky").unwrap();
        assert_eq!(quirky.placeholder(3), "?");
        assert_eq!(quirky.now_call(), "CURRENT_TIMESTAMP");
    }

    #[test]
    fn test_default_literals() {
        let d = SqliteDialect;
        assert_eq!(d.sql_value(&Value::Null), "NULL");
        assert_eq!(d.sql_value(&Value::Bool(true)), "1");
        assert_eq!(d.sql_value(&Value::from("O'Hara")), "'O''Hara'");
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(d.sql_value(&Value::Date(date)), "'2024-02-29'");
    }
}
