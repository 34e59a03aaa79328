//! DML builders used by the SQL persistence layer.
//!
//! Every builder returns the statement text with dialect placeholders
//! numbered from 1; values are bound separately.

use std::sync::Arc;

use middlestore_core::model::{Attr, Klass};
use middlestore_core::{FetchQuery, ObjRef, Value};

use crate::config::SqlStoreConfig;
use crate::dialect::Dialect;
use crate::schema::DELETED_COLUMN;

/// A statement and its parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    fn new(sql: String, params: Vec<Value>) -> Self {
        Self { sql, params }
    }
}

/// Builds SELECT, INSERT, UPDATE and DELETE statements for class tables.
#[derive(Debug, Clone)]
pub struct StatementBuilder {
    dialect: Arc<dyn Dialect>,
    config: SqlStoreConfig,
}

impl StatementBuilder {
    pub fn new(dialect: Arc<dyn Dialect>, config: SqlStoreConfig) -> Self {
        Self { dialect, config }
    }

    pub fn config(&self) -> &SqlStoreConfig {
        &self.config
    }

    fn q(&self, ident: &str) -> String {
        self.dialect.quote_identifier(ident)
    }

    fn table(&self, klass: &Klass) -> String {
        self.q(klass.sql_table_name())
    }

    /// Selected columns: the serial column first, then every column of
    /// every stored attribute.
    pub fn select_columns(&self, klass: &Klass) -> Vec<String> {
        let mut columns = vec![self.config.serial_column.clone()];
        for attr in klass.sql_attrs() {
            columns.extend(self.config.column_names(attr));
        }
        columns
    }

    /// SELECT for objects of exactly `klass`.
    ///
    /// A serial number in `query` overrides its clauses.
    pub fn select(&self, klass: &Klass, query: &FetchQuery) -> Statement {
        match (query.serial_num, query.clauses.as_deref()) {
            (Some(serial_num), _) => {
                let clauses = format!(
                    "WHERE {} = {}",
                    self.q(&self.config.serial_column),
                    self.dialect.placeholder(1)
                );
                self.select_with(klass, &clauses, vec![Value::BigInt(serial_num)])
            }
            (None, Some(clauses)) => self.select_with(klass, clauses, Vec::new()),
            (None, None) => self.select_with(klass, "", Vec::new()),
        }
    }

    /// SELECT for objects of exactly `klass` whose `attr` refers to `target`.
    pub fn select_referencing(&self, klass: &Klass, attr: &Attr, target: ObjRef) -> Statement {
        let (condition, params) = self.refers_to_condition(attr, target, 1);
        self.select_with(klass, &format!("WHERE {condition}"), params)
    }

    fn select_with(&self, klass: &Klass, clauses: &str, params: Vec<Value>) -> Statement {
        let columns: Vec<String> = self.select_columns(klass).iter().map(|c| self.q(c)).collect();
        let mut sql = format!("SELECT {} FROM {}", columns.join(", "), self.table(klass));
        let clauses = if self.config.marks_deletes() {
            self.add_deleted_to_clauses(clauses)
        } else {
            clauses.trim().to_string()
        };
        if !clauses.is_empty() {
            sql.push(' ');
            sql.push_str(&clauses);
        }
        Statement::new(sql, params)
    }

    /// Restrict `clauses` to rows that are not marked deleted, keeping any
    /// `ORDER BY` after the combined condition.
    pub fn add_deleted_to_clauses(&self, clauses: &str) -> String {
        let deleted = self.q(DELETED_COLUMN);
        let clauses = clauses.trim();
        let starts_with_where = clauses
            .get(..5)
            .is_some_and(|head| head.eq_ignore_ascii_case("where"));
        if !starts_with_where {
            return format!("WHERE {deleted} IS NULL {clauses}").trim_end().to_string();
        }
        let condition = &clauses[5..];
        let (condition, order_by) = match condition.to_ascii_lowercase().find("order by") {
            Some(at) => condition.split_at(at),
            None => (condition, ""),
        };
        format!("WHERE {deleted} IS NULL AND ({}) {order_by}", condition.trim())
            .trim_end()
            .to_string()
    }

    /// `<columns> = <placeholders>` matching a reference to `target`.
    fn refers_to_condition(&self, attr: &Attr, target: ObjRef, first: usize) -> (String, Vec<Value>) {
        let columns = self.config.column_names(attr);
        let params = self.obj_ref_params(Some(target));
        let condition = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.q(c), self.dialect.placeholder(first + i)))
            .collect::<Vec<_>>()
            .join(" AND ");
        (condition, params)
    }

    /// Column values for a reference; `None` binds NULLs.
    pub fn obj_ref_params(&self, obj_ref: Option<ObjRef>) -> Vec<Value> {
        match (obj_ref, self.config.use_bigint_obj_ref_columns) {
            (Some(r), true) => vec![Value::BigInt(r.as_i64())],
            (Some(r), false) => vec![
                Value::BigInt(i64::from(r.klass_id())),
                Value::BigInt(i64::from(r.serial_num())),
            ],
            (None, true) => vec![Value::Null],
            (None, false) => vec![Value::Null, Value::Null],
        }
    }

    /// INSERT of one row. An empty column list inserts a row of defaults.
    /// `serial_num` is set when the id was allocated before the insert.
    pub fn insert(
        &self,
        klass: &Klass,
        serial_num: Option<i64>,
        columns: &[String],
        mut params: Vec<Value>,
    ) -> Statement {
        let mut columns: Vec<String> = columns.to_vec();
        if let Some(serial_num) = serial_num {
            columns.insert(0, self.config.serial_column.clone());
            params.insert(0, Value::BigInt(serial_num));
        }
        if columns.is_empty() {
            return Statement::new(self.dialect.insert_default_values(klass.sql_table_name()), params);
        }
        let names: Vec<String> = columns.iter().map(|c| self.q(c)).collect();
        let placeholders: Vec<String> = (1..=columns.len()).map(|i| self.dialect.placeholder(i)).collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(klass),
            names.join(", "),
            placeholders.join(", ")
        );
        Statement::new(sql, params)
    }

    /// UPDATE of the given columns of one row.
    pub fn update(&self, klass: &Klass, serial_num: i64, columns: &[String], mut params: Vec<Value>) -> Statement {
        let assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{} = {}", self.q(c), self.dialect.placeholder(i + 1)))
            .collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = {}",
            self.table(klass),
            assignments.join(", "),
            self.q(&self.config.serial_column),
            self.dialect.placeholder(columns.len() + 1)
        );
        params.push(Value::BigInt(serial_num));
        Statement::new(sql, params)
    }

    /// DELETE of one row, or the mark-delete UPDATE when deletes are marked.
    pub fn delete(&self, klass: &Klass, serial_num: i64) -> Statement {
        let where_clause = format!(
            "WHERE {} = {}",
            self.q(&self.config.serial_column),
            self.dialect.placeholder(1)
        );
        let sql = if self.config.marks_deletes() {
            format!(
                "UPDATE {} SET {} = {} {where_clause}",
                self.table(klass),
                self.q(DELETED_COLUMN),
                self.dialect.now_call()
            )
        } else {
            format!("DELETE FROM {} {where_clause}", self.table(klass))
        };
        Statement::new(sql, vec![Value::BigInt(serial_num)])
    }

    /// Literal rendering of a statement, for the SQL echo.
    pub fn render(&self, statement: &Statement) -> String {
        if statement.params.is_empty() {
            return statement.sql.clone();
        }
        let params: Vec<String> = statement.params.iter().map(|v| self.dialect.sql_value(v)).collect();
        format!("{} -- [{}]", statement.sql, params.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeleteBehavior;
    use crate::dialect::{PostgresDialect, SqliteDialect};
    use middlestore_core::model::{AttrDef, KlassDef, Model, ModelBuilder};

    fn model() -> Arc<Model> {
        ModelBuilder::new("M")
            .klass(
                KlassDef::new("Pet")
                    .attr(AttrDef::string("name"))
                    .attr(AttrDef::obj_ref("owner", "Owner")),
            )
            .klass(KlassDef::new("Owner").attr(AttrDef::string("name")))
            .build()
            .unwrap()
    }

    fn sqlite(config: SqlStoreConfig) -> StatementBuilder {
        StatementBuilder::new(Arc::new(SqliteDialect), config)
    }

    #[test]
    fn test_select_by_serial_ignores_clauses() {
        let model = model();
        let pet = model.klass("Pet").unwrap();
        let b = sqlite(SqlStoreConfig::default());
        let stmt = b.select(pet, &FetchQuery::serial(7).clauses("WHERE name = 'x'"));
        assert_eq!(
            stmt.sql,
            "SELECT \"serialNum\", \"name\", \"ownerClassId\", \"ownerObjId\" FROM \"Pet\" WHERE \"serialNum\" = ?"
        );
        assert_eq!(stmt.params, vec![Value::BigInt(7)]);
    }

    #[test]
    fn test_deleted_filter() {
        let b = sqlite(SqlStoreConfig::default().delete_behavior(DeleteBehavior::Mark));
        assert_eq!(b.add_deleted_to_clauses(""), "WHERE \"deleted\" IS NULL");
        assert_eq!(
            b.add_deleted_to_clauses("ORDER BY name"),
            "WHERE \"deleted\" IS NULL ORDER BY name"
        );
        assert_eq!(
            b.add_deleted_to_clauses(" where name = 'a' or name = 'b' order by name "),
            "WHERE \"deleted\" IS NULL AND (name = 'a' or name = 'b') order by name"
        );

        let model = model();
        let stmt = b.select(model.klass("Owner").unwrap(), &FetchQuery::new());
        assert!(stmt.sql.ends_with("FROM \"Owner\" WHERE \"deleted\" IS NULL"));
    }

    #[test]
    fn test_referencing_select() {
        let model = model();
        let pet = model.klass("Pet").unwrap();
        let owner = pet.attr("owner").unwrap();
        let target = ObjRef::join(2, 5);

        let split = sqlite(SqlStoreConfig::default()).select_referencing(pet, owner, target);
        assert!(split.sql.ends_with("WHERE \"ownerClassId\" = ? AND \"ownerObjId\" = ?"));
        assert_eq!(split.params, vec![Value::BigInt(2), Value::BigInt(5)]);

        let packed = sqlite(SqlStoreConfig::default().use_bigint_obj_ref_columns(true))
            .select_referencing(pet, owner, target);
        assert!(packed.sql.ends_with("WHERE \"ownerId\" = ?"));
        assert_eq!(packed.params, vec![Value::BigInt(target.as_i64())]);
    }

    #[test]
    fn test_insert_update_delete() {
        let model = model();
        let pet = model.klass("Pet").unwrap();
        let pg = StatementBuilder::new(Arc::new(PostgresDialect), SqlStoreConfig::default());

        let insert = pg.insert(pet, Some(4), &["name".to_string()], vec![Value::from("Rex")]);
        assert_eq!(insert.sql, "INSERT INTO \"Pet\" (\"serialNum\", \"name\") VALUES ($1, $2)");
        assert_eq!(insert.params, vec![Value::BigInt(4), Value::from("Rex")]);

        let empty = sqlite(SqlStoreConfig::default()).insert(pet, None, &[], Vec::new());
        assert_eq!(empty.sql, "INSERT INTO \"Pet\" DEFAULT VALUES");

        let update = pg.update(pet, 4, &["name".to_string()], vec![Value::from("Max")]);
        assert_eq!(update.sql, "UPDATE \"Pet\" SET \"name\" = $1 WHERE \"serialNum\" = $2");
        assert_eq!(update.params, vec![Value::from("Max"), Value::BigInt(4)]);

        assert_eq!(pg.delete(pet, 4).sql, "DELETE FROM \"Pet\" WHERE \"serialNum\" = $1");
        let marking = StatementBuilder::new(
            Arc::new(PostgresDialect),
            SqlStoreConfig::default().delete_behavior(DeleteBehavior::Mark),
        );
        assert_eq!(
            marking.delete(pet, 4).sql,
            "UPDATE \"Pet\" SET \"deleted\" = now() WHERE \"serialNum\" = $1"
        );
    }

    #[test]
    fn test_render_inlines_params() {
        let b = sqlite(SqlStoreConfig::default());
        let stmt = Statement::new("SELECT ?".to_string(), vec![Value::from("it's")]);
        assert_eq!(b.render(&stmt), "SELECT ? -- ['it''s']");
    }
}
