use middlestore_core::model::{AttrType, Klass};

use super::Dialect;

/// SQLite. Ids come from `AUTOINCREMENT` and are read back after the insert.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn sql_type(&self, attr_type: &AttrType) -> String {
        match attr_type {
            AttrType::Bool => "bool".to_string(),
            AttrType::Int => "int".to_string(),
            AttrType::Long | AttrType::ObjRef { .. } | AttrType::List { .. } => "integer".to_string(),
            AttrType::Float => "double".to_string(),
            AttrType::String { .. } | AttrType::Enum { .. } => "text".to_string(),
            AttrType::Date => "date".to_string(),
            AttrType::Time => "time".to_string(),
            AttrType::DateTime => "datetime".to_string(),
            AttrType::Decimal { precision, scale } => format!("decimal({precision}, {scale})"),
        }
    }

    fn primary_key_def(&self, _klass: &Klass, serial_column: &str) -> String {
        format!(
            "{} integer primary key autoincrement",
            self.quote_identifier(serial_column)
        )
    }

    fn now_call(&self) -> &'static str {
        "datetime('now')"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use middlestore_core::model::{AttrDef, KlassDef, ModelBuilder};

    #[test]
    fn test_sqlite_types_and_key() {
        let model = ModelBuilder::new("M")
            .klass(KlassDef::new("Person").attr(AttrDef::string("name").max_length(40)))
            .build()
            .unwrap();
        let person = model.klass("Person").unwrap();
        let d = SqliteDialect;
        assert_eq!(d.sql_type(person.attr("name").unwrap().attr_type()), "text");
        assert_eq!(
            d.sql_type(&AttrType::ObjRef {
                target: "Person".to_string()
            }),
            "integer"
        );
        assert_eq!(
            d.primary_key_def(person, "serialNum"),
            "\"serialNum\" integer primary key autoincrement"
        );
        assert_eq!(d.insert_default_values("Person"), "INSERT INTO \"Person\" DEFAULT VALUES");
        assert_eq!(
            d.write_index_defs(person, &["name".to_string()]),
            vec!["CREATE INDEX \"Person_name_index\" ON \"Person\" (\"name\")"]
        );
    }
}
