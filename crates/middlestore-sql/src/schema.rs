//! DDL generation for a model.
//!
//! Every concrete class gets one table keyed by the serial column. Scalar
//! attributes map to one column each, object references to a class id plus
//! object id pair (or one packed column), and list attributes to nothing:
//! they are the inverse of a reference stored on the element class. The
//! `_MKClassIds` table records the id of every class so that stored
//! references can be decoded later.

use std::sync::Arc;

use middlestore_core::model::{AttrType, Klass, Model};

use crate::config::SqlStoreConfig;
use crate::dialect::{Dialect, quote_string};

/// Table mapping class ids to class names.
pub const KLASS_IDS_TABLE: &str = "_MKClassIds";

/// Column holding the mark-delete timestamp.
pub const DELETED_COLUMN: &str = "deleted";

/// Builds CREATE and DROP statements for a model.
#[derive(Debug, Clone)]
pub struct SchemaGenerator {
    dialect: Arc<dyn Dialect>,
    config: SqlStoreConfig,
}

impl SchemaGenerator {
    pub fn new(dialect: Arc<dyn Dialect>, config: SqlStoreConfig) -> Self {
        Self { dialect, config }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    /// Statements that create the whole schema, in execution order.
    pub fn create_statements(&self, model: &Model) -> Vec<String> {
        let mut statements = vec![self.klass_ids_table()];
        let serial_column = &self.config.serial_column;
        for klass in model.klasses().iter().filter(|k| !k.is_abstract()) {
            statements.extend(self.dialect.create_sequence_defs(klass, serial_column));
            statements.push(self.create_table(klass));
            statements.extend(self.dialect.write_index_defs(klass, &self.indexed_columns(klass)));
        }
        statements.extend(self.klass_id_inserts(model));
        tracing::debug!(
            dialect = self.dialect.name(),
            count = statements.len(),
            "Generated schema"
        );
        statements
    }

    /// Statements that drop everything [`create_statements`](Self::create_statements) creates.
    pub fn drop_statements(&self, model: &Model) -> Vec<String> {
        let serial_column = &self.config.serial_column;
        let mut statements = Vec::new();
        for klass in model.klasses().iter().rev().filter(|k| !k.is_abstract()) {
            statements.push(format!(
                "DROP TABLE IF EXISTS {}",
                self.dialect.quote_identifier(klass.sql_table_name())
            ));
            statements.extend(self.dialect.drop_sequence_defs(klass, serial_column));
        }
        statements.push(format!(
            "DROP TABLE IF EXISTS {}",
            self.dialect.quote_identifier(KLASS_IDS_TABLE)
        ));
        statements
    }

    fn klass_ids_table(&self) -> String {
        let q = |s: &str| self.dialect.quote_identifier(s);
        format!(
            "CREATE TABLE {} (\n    {} int not null primary key,\n    {} varchar(100)\n)",
            q(KLASS_IDS_TABLE),
            q("id"),
            q("name")
        )
    }

    fn klass_id_inserts(&self, model: &Model) -> Vec<String> {
        let q = |s: &str| self.dialect.quote_identifier(s);
        model
            .klasses()
            .iter()
            .map(|klass| {
                format!(
                    "INSERT INTO {} ({}, {}) VALUES ({}, {})",
                    q(KLASS_IDS_TABLE),
                    q("id"),
                    q("name"),
                    klass.id(),
                    quote_string(klass.name())
                )
            })
            .collect()
    }

    /// CREATE TABLE for one concrete class.
    pub fn create_table(&self, klass: &Klass) -> String {
        let mut columns = vec![
            self.dialect
                .primary_key_def(klass, &self.config.serial_column),
        ];
        for attr in klass.sql_attrs() {
            let names = self.config.column_names(attr);
            match attr.attr_type() {
                // Reference columns stay nullable: inserts of forward
                // references write NULL and fix the value up afterwards.
                AttrType::ObjRef { .. } if self.config.use_bigint_obj_ref_columns => {
                    for name in &names {
                        columns.push(format!(
                            "{} {}",
                            self.dialect.quote_identifier(name),
                            self.dialect.sql_type(attr.attr_type())
                        ));
                    }
                }
                AttrType::ObjRef { .. } => {
                    for name in &names {
                        columns.push(format!(
                            "{} {}",
                            self.dialect.quote_identifier(name),
                            self.dialect.sql_type(&AttrType::Int)
                        ));
                    }
                }
                _ => {
                    for name in &names {
                        let mut def = format!(
                            "{} {}",
                            self.dialect.quote_identifier(name),
                            self.dialect.sql_type(attr.attr_type())
                        );
                        if attr.is_required() {
                            def.push_str(" not null");
                        }
                        if let Some(default) = attr.default_value().filter(|v| !v.is_null()) {
                            def.push_str(" default ");
                            def.push_str(&self.dialect.sql_for_non_null(default));
                        }
                        columns.push(def);
                    }
                }
            }
        }
        if self.config.marks_deletes() {
            columns.push(format!(
                "{} {}",
                self.dialect.quote_identifier(DELETED_COLUMN),
                self.dialect.sql_type(&AttrType::DateTime)
            ));
        }
        format!(
            "CREATE TABLE {} (\n    {}\n)",
            self.dialect.quote_identifier(klass.sql_table_name()),
            columns.join(",\n    ")
        )
    }

    fn indexed_columns(&self, klass: &Klass) -> Vec<String> {
        klass
            .sql_attrs()
            .filter(|a| a.is_indexed())
            .flat_map(|a| self.config.column_names(a))
            .collect()
    }
}
