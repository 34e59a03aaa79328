use middlestore_core::error::QueryErrorKind;
use middlestore_core::model::{AttrType, Klass};
use middlestore_core::{Result, Value};

use super::{Dialect, quote_string};
use crate::connection::{Connection, query_error};

/// PostgreSQL. Every class table draws its serial numbers from its own
/// sequence, and the next value is taken before the insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl PostgresDialect {
    /// Sequence backing the serial column of `klass`.
    pub fn sequence_name(klass: &Klass, serial_column: &str) -> String {
        format!("{}_{}_seq", klass.sql_table_name(), serial_column)
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn placeholder(&self, index: usize) -> String {
        format!("${index}")
    }

    fn sql_type(&self, attr_type: &AttrType) -> String {
        match attr_type {
            AttrType::Bool => "boolean".to_string(),
            AttrType::Int => "integer".to_string(),
            AttrType::Long | AttrType::ObjRef { .. } | AttrType::List { .. } => "bigint".to_string(),
            AttrType::Float => "double precision".to_string(),
            AttrType::String {
                max_length: Some(max),
            } => format!("varchar({max})"),
            AttrType::String { max_length: None } => "text".to_string(),
            AttrType::Enum { values } => {
                let width = values.iter().map(String::len).max().unwrap_or(1);
                format!("varchar({width})")
            }
            AttrType::Date => "date".to_string(),
            AttrType::Time => "time".to_string(),
            AttrType::DateTime => "timestamp".to_string(),
            AttrType::Decimal { precision, scale } => format!("decimal({precision}, {scale})"),
        }
    }

    fn sql_for_non_null(&self, value: &Value) -> String {
        match value {
            Value::Bool(b) => if *b { "true" } else { "false" }.to_string(),
            Value::Text(s) => quote_string(s),
            Value::Null => self.sql_for_null().to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Double(d) => d.to_string(),
            Value::Decimal(d) => d.clone(),
            Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => quote_string(&value.to_string()),
        }
    }

    fn primary_key_def(&self, klass: &Klass, serial_column: &str) -> String {
        let sequence = Self::sequence_name(klass, serial_column);
        format!(
            "{} integer not null primary key default nextval({})",
            self.quote_identifier(serial_column),
            quote_string(&self.quote_identifier(&sequence))
        )
    }

    fn now_call(&self) -> &'static str {
        "now()"
    }

    fn next_insert_id(
        &self,
        conn: &mut dyn Connection,
        klass: &Klass,
        serial_column: &str,
    ) -> Result<Option<i64>> {
        let sequence = Self::sequence_name(klass, serial_column);
        let sql = format!(
            "SELECT nextval({})",
            quote_string(&self.quote_identifier(&sequence))
        );
        let rows = conn.query(&sql, &[])?;
        let id = rows
            .first()
            .and_then(|row| row.get(0).as_i64())
            .ok_or_else(|| query_error(QueryErrorKind::Conversion, "nextval returned no id", &sql))?;
        Ok(Some(id))
    }

    fn create_sequence_defs(&self, klass: &Klass, serial_column: &str) -> Vec<String> {
        vec![format!(
            "CREATE SEQUENCE {} START 1 MINVALUE 1",
            self.quote_identifier(&Self::sequence_name(klass, serial_column))
        )]
    }

    fn drop_sequence_defs(&self, klass: &Klass, serial_column: &str) -> Vec<String> {
        vec![format!(
            "DROP SEQUENCE IF EXISTS {}",
            self.quote_identifier(&Self::sequence_name(klass, serial_column))
        )]
    }
}
