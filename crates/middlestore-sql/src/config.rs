//! SQL store configuration.
//!
//! Controls the dialect, how deletes are persisted, how object references are
//! laid out in columns, connection pooling and SQL echo.

use serde::{Deserialize, Serialize};

use middlestore_core::model::{Attr, AttrType};
use middlestore_core::{Result, config_error};

/// What a delete does to the stored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeleteBehavior {
    /// `DELETE` the row.
    #[default]
    Delete,
    /// Keep the row and stamp its `deleted` column with the current time.
    Mark,
}

/// Configuration for [`SqlPersistence`](crate::store::SqlPersistence).
///
/// ```
/// use middlestore_sql::{DeleteBehavior, SqlStoreConfig};
///
/// let config = SqlStoreConfig::from_json_str(
///     r#"{"dialect": "postgresql", "delete_behavior": "mark"}"#,
/// )
/// .unwrap();
/// assert_eq!(config.delete_behavior, DeleteBehavior::Mark);
/// assert_eq!(config.serial_column, "serialNum");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SqlStoreConfig {
    /// Registered dialect name.
    pub dialect: String,
    pub delete_behavior: DeleteBehavior,
    /// Store each object reference in one packed 64-bit `<name>Id` column
    /// instead of a class id column plus an object id column.
    pub use_bigint_obj_ref_columns: bool,
    /// Suffixes for the class id and object id columns of a reference.
    pub obj_ref_suffixes: (String, String),
    /// Primary key column of every class table.
    pub serial_column: String,
    /// Connections kept in a pool for threaded stores. Zero disables pooling.
    pub pool_size: usize,
    /// Echo every statement at debug level under the `middlestore::sql` target.
    pub sql_log: bool,
}

impl Default for SqlStoreConfig {
    fn default() -> Self {
        Self {
            dialect: "sqlite".to_string(),
            delete_behavior: DeleteBehavior::Delete,
            use_bigint_obj_ref_columns: false,
            obj_ref_suffixes: ("ClassId".to_string(), "ObjId".to_string()),
            serial_column: "serialNum".to_string(),
            pool_size: 0,
            sql_log: false,
        }
    }
}

impl SqlStoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn dialect(mut self, name: impl Into<String>) -> Self {
        self.dialect = name.into();
        self
    }

    #[must_use]
    pub fn delete_behavior(mut self, behavior: DeleteBehavior) -> Self {
        self.delete_behavior = behavior;
        self
    }

    #[must_use]
    pub fn use_bigint_obj_ref_columns(mut self, packed: bool) -> Self {
        self.use_bigint_obj_ref_columns = packed;
        self
    }

    #[must_use]
    pub fn obj_ref_suffixes(mut self, class_id: impl Into<String>, obj_id: impl Into<String>) -> Self {
        self.obj_ref_suffixes = (class_id.into(), obj_id.into());
        self
    }

    #[must_use]
    pub fn serial_column(mut self, name: impl Into<String>) -> Self {
        self.serial_column = name.into();
        self
    }

    #[must_use]
    pub fn pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    #[must_use]
    pub fn sql_log(mut self, enabled: bool) -> Self {
        self.sql_log = enabled;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| config_error(format!("invalid SQL store config: {e}")))
    }

    pub fn marks_deletes(&self) -> bool {
        self.delete_behavior == DeleteBehavior::Mark
    }

    /// Column names backing `attr`: none for lists, two for a split object
    /// reference, one otherwise.
    pub fn column_names(&self, attr: &Attr) -> Vec<String> {
        match attr.attr_type() {
            AttrType::List { .. } => Vec::new(),
            AttrType::ObjRef { .. } if self.use_bigint_obj_ref_columns => {
                vec![format!("{}Id", attr.name())]
            }
            AttrType::ObjRef { .. } => vec![
                format!("{}{}", attr.name(), self.obj_ref_suffixes.0),
                format!("{}{}", attr.name(), self.obj_ref_suffixes.1),
            ],
            _ => vec![attr.name().to_string()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use middlestore_core::model::{AttrDef, KlassDef, ModelBuilder};

    #[test]
    fn test_defaults() {
        let config = SqlStoreConfig::default();
        assert_eq!(config.dialect, "sqlite");
        assert!(!config.marks_deletes());
        assert_eq!(config.obj_ref_suffixes.0, "ClassId");
        assert_eq!(config.pool_size, 0);
    }

    #[test]
    fn test_json_errors_are_config_errors() {
        let err = SqlStoreConfig::from_json_str(r#"{"delete_behavior": "shred"}"#).unwrap_err();
        assert!(matches!(err, middlestore_core::Error::Config(_)));
    }

    #[test]
    fn test_column_names() {
        let model = ModelBuilder::new("M")
            .klass(
                KlassDef::new("Pet")
                    .attr(AttrDef::string("name"))
                    .attr(AttrDef::obj_ref("owner", "Pet"))
                    .attr(AttrDef::list("pups", "Pet", "owner")),
            )
            .build()
            .unwrap();
        let pet = model.klass("Pet").unwrap();
        let split = SqlStoreConfig::default();
        let packed = SqlStoreConfig::default().use_bigint_obj_ref_columns(true);

        assert_eq!(split.column_names(pet.attr("name").unwrap()), vec!["name"]);
        assert_eq!(
            split.column_names(pet.attr("owner").unwrap()),
            vec!["ownerClassId", "ownerObjId"]
        );
        assert_eq!(packed.column_names(pet.attr("owner").unwrap()), vec!["ownerId"]);
        assert!(split.column_names(pet.attr("pups").unwrap()).is_empty());
    }
}
