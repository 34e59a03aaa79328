use middlestore_core::Value;
use middlestore_core::model::{AttrType, Klass};

use super::Dialect;

/// MySQL / MariaDB.
#[derive(Debug, Clone, Copy, Default)]
pub struct MySqlDialect;

fn quote_mysql_string(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

impl Dialect for MySqlDialect {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        format!("`{}`", ident.replace('`', "``"))
    }

    fn sql_type(&self, attr_type: &AttrType) -> String {
        match attr_type {
            AttrType::Bool => "bool".to_string(),
            AttrType::Int => "int".to_string(),
            AttrType::Long => "bigint".to_string(),
            AttrType::ObjRef { .. } | AttrType::List { .. } => "bigint unsigned".to_string(),
            AttrType::Float => "double".to_string(),
            AttrType::String {
                max_length: Some(max),
            } if *max <= 255 => format!("varchar({max})"),
            AttrType::String { .. } => "text".to_string(),
            AttrType::Enum { values } => {
                let values: Vec<String> = values.iter().map(|v| quote_mysql_string(v)).collect();
                format!("enum({})", values.join(", "))
            }
            AttrType::Date => "date".to_string(),
            AttrType::Time => "time".to_string(),
            AttrType::DateTime => "datetime".to_string(),
            AttrType::Decimal { precision, scale } => format!("decimal({precision}, {scale})"),
        }
    }

    fn sql_for_non_null(&self, value: &Value) -> String {
        match value {
            Value::Text(s) => quote_mysql_string(s),
            Value::Date(_) | Value::Time(_) | Value::Timestamp(_) => quote_mysql_string(&value.to_string()),
            Value::Null => self.sql_for_null().to_string(),
            Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            Value::Int(i) => i.to_string(),
            Value::BigInt(i) => i.to_string(),
            Value::Double(d) => d.to_string(),
            Value::Decimal(d) => d.clone(),
        }
    }

    fn primary_key_def(&self, _klass: &Klass, serial_column: &str) -> String {
        format!(
            "{} int not null primary key auto_increment",
            self.quote_identifier(serial_column)
        )
    }

    fn now_call(&self) -> &'static str {
        "NOW()"
    }

    fn insert_default_values(&self, table: &str) -> String {
        format!("INSERT INTO {} () VALUES ()", self.quote_identifier(table))
    }
}
