//! Error types for middlestore.
//!
//! Every fallible operation in the workspace returns [`Result`]. Variants carry a
//! payload struct so callers can inspect the offending objects or SQL text
//! instead of parsing messages.

use std::error::Error as StdError;
use std::fmt;

use crate::object::ObjectHandle;
use crate::objref::ObjRef;

/// The main error type.
#[derive(Debug)]
pub enum Error {
    /// No object with the requested key is known to the store.
    UnknownObject(UnknownObjectError),
    /// Deleting would leave other objects pointing at a deleted object.
    DeleteReferenced(DeleteReferencedError),
    /// The object refers to objects whose `on_delete_self` policy is deny.
    DeleteObjectWithReferences(DeleteObjectWithReferencesError),
    /// A stored reference names a class id but carries a zero serial number.
    ObjRefZeroSerialNum(ObjRefError),
    /// A stored reference points at a row that does not exist.
    ObjRefDangles(ObjRefError),
    /// The driver cannot be used with the configured threading mode.
    ThreadingConfiguration(ThreadingConfigurationError),
    /// Connection could not be opened or was lost.
    Connection(ConnectionError),
    /// A statement failed.
    Query(QueryError),
    /// Persistent state is inconsistent (fatal for the current save).
    Integrity(IntegrityError),
    /// Unknown class or attribute, or an invalid model definition.
    Model(ModelError),
    /// A value does not fit its attribute.
    InvalidValue(InvalidValueError),
    /// The object is in the wrong lifecycle state for the operation.
    Lifecycle(LifecycleError),
    /// Invalid settings.
    Config(ConfigError),
    /// Writing a dump failed.
    Io(std::io::Error),
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownObjectError {
    pub klass: String,
    pub serial_num: i64,
}

/// One reference that blocks a delete.
#[derive(Debug, Clone)]
pub struct ReferenceViolation {
    /// Object holding the reference.
    pub referencing: ObjectHandle,
    /// Attribute on `referencing` that holds the reference.
    pub attr: String,
    /// Object being referenced.
    pub referenced: ObjectHandle,
}

impl fmt::Display for ReferenceViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}",
            self.referencing.describe(),
            self.attr,
            self.referenced.describe()
        )
    }
}

#[derive(Debug, Clone)]
pub struct DeleteReferencedError {
    /// Object whose deletion was requested.
    pub target: ObjectHandle,
    /// Objects outside the delete set that still refer into it.
    pub violations: Vec<ReferenceViolation>,
}

#[derive(Debug, Clone)]
pub struct DeleteObjectWithReferencesError {
    /// Object whose deletion was requested.
    pub target: ObjectHandle,
    /// References held by deleted objects whose `on_delete_self` policy is deny.
    pub violations: Vec<ReferenceViolation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRefError {
    pub obj_ref: ObjRef,
    pub klass_id: u32,
    pub serial_num: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadingConfigurationError {
    pub driver: String,
    pub thread_safety: u8,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open a connection.
    Connect,
    /// Pool could not hand out a connection.
    Pool,
    /// Connection was used after being closed.
    Closed,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Statement could not be prepared.
    Syntax,
    /// Constraint violated.
    Constraint,
    /// Statement executed but failed.
    Database,
    /// Row value could not be converted.
    Conversion,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
    pub sql: Option<String>,
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityError {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelErrorKind {
    UnknownKlass,
    UnknownAttr,
    AbstractKlass,
    InvalidName,
    Duplicate,
    Inconsistent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidValueKind {
    TypeMismatch,
    Required,
    NotAllowed,
    OutOfRange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidValueError {
    pub kind: InvalidValueKind,
    pub klass: String,
    pub attr: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleErrorKind {
    /// Object already has a permanent key.
    AlreadyCommitted,
    /// Object was deleted.
    Deleted,
    /// Object belongs to another store.
    ForeignStore,
    /// Object is not attached to a store.
    NotInStore,
    /// The store still holds unsaved changes.
    PendingChanges,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleError {
    pub kind: LifecycleErrorKind,
    pub object: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::UnknownObject(e) => {
                write!(f, "unknown object {}.{}", e.klass, e.serial_num)
            }
            Error::DeleteReferenced(e) => {
                write!(
                    f,
                    "cannot delete {}: still referenced by ",
                    e.target.describe()
                )?;
                write_violations(f, &e.violations)
            }
            Error::DeleteObjectWithReferences(e) => {
                write!(
                    f,
                    "cannot delete {}: it refers to objects that deny deletion: ",
                    e.target.describe()
                )?;
                write_violations(f, &e.violations)
            }
            Error::ObjRefZeroSerialNum(e) => write!(
                f,
                "object reference {} (class id {}) has a zero serial number",
                e.obj_ref.as_u64(),
                e.klass_id
            ),
            Error::ObjRefDangles(e) => write!(
                f,
                "object reference {} points to missing object (class id {}, serial {})",
                e.obj_ref.as_u64(),
                e.klass_id,
                e.serial_num
            ),
            Error::ThreadingConfiguration(e) => write!(
                f,
                "threading configuration error for driver {} (thread safety {}): {}",
                e.driver, e.thread_safety, e.message
            ),
            Error::Connection(e) => write!(f, "connection error: {}", e.message),
            Error::Query(e) => match &e.sql {
                Some(sql) => write!(f, "query error: {} [{}]", e.message, sql),
                None => write!(f, "query error: {}", e.message),
            },
            Error::Integrity(e) => write!(f, "integrity error: {}", e.message),
            Error::Model(e) => write!(f, "model error: {}", e.message),
            Error::InvalidValue(e) => {
                write!(f, "invalid value for {}.{}: {}", e.klass, e.attr, e.message)
            }
            Error::Lifecycle(e) => write!(f, "{}: {}", e.object, e.message),
            Error::Config(e) => write!(f, "configuration error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

fn write_violations(f: &mut fmt::Formatter<'_>, violations: &[ReferenceViolation]) -> fmt::Result {
    for (i, v) in violations.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{v}")?;
    }
    Ok(())
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn StdError + 'static)),
            Error::Query(e) => e
                .source
                .as_ref()
                .map(|s| s.as_ref() as &(dyn StdError + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl Error {
    /// Whether the caller can reasonably continue after this error.
    ///
    /// Dangling and zero-serial references are data problems local to one
    /// attribute; integrity and threading errors are not.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::Integrity(_)
                | Error::ThreadingConfiguration(_)
                | Error::Connection(_)
                | Error::Io(_)
        )
    }

    /// SQL text attached to a query error, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(e) => e.sql.as_deref(),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

// ============================================================================
// Constructors
// ============================================================================

pub(crate) fn model_error(kind: ModelErrorKind, msg: impl Into<String>) -> Error {
    Error::Model(ModelError {
        kind,
        message: msg.into(),
    })
}

pub(crate) fn unknown_klass(name: &str) -> Error {
    model_error(ModelErrorKind::UnknownKlass, format!("unknown class {name}"))
}

pub(crate) fn unknown_attr(klass: &str, attr: &str) -> Error {
    model_error(
        ModelErrorKind::UnknownAttr,
        format!("class {klass} has no attribute {attr}"),
    )
}

pub(crate) fn lifecycle_error(
    kind: LifecycleErrorKind,
    object: impl Into<String>,
    msg: impl Into<String>,
) -> Error {
    Error::Lifecycle(LifecycleError {
        kind,
        object: object.into(),
        message: msg.into(),
    })
}

pub(crate) fn invalid_value(
    kind: InvalidValueKind,
    klass: &str,
    attr: &str,
    msg: impl Into<String>,
) -> Error {
    Error::InvalidValue(InvalidValueError {
        kind,
        klass: klass.to_string(),
        attr: attr.to_string(),
        message: msg.into(),
    })
}

/// Build an integrity error.
pub fn integrity_error(msg: impl Into<String>) -> Error {
    Error::Integrity(IntegrityError {
        message: msg.into(),
    })
}

/// Build a configuration error.
pub fn config_error(msg: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: msg.into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_obj_ref_errors() {
        let r = ObjRef::join(3, 0);
        let err = Error::ObjRefZeroSerialNum(ObjRefError {
            obj_ref: r,
            klass_id: 3,
            serial_num: 0,
        });
        assert!(err.to_string().contains("zero serial"));
        assert!(err.is_recoverable());

        let err = Error::ObjRefDangles(ObjRefError {
            obj_ref: ObjRef::join(3, 9),
            klass_id: 3,
            serial_num: 9,
        });
        assert!(err.to_string().contains("serial 9"));
    }

    #[test]
    fn test_integrity_not_recoverable() {
        let err = integrity_error("forward reference never resolved");
        assert!(!err.is_recoverable());
        assert_eq!(
            err.to_string(),
            "integrity error: forward reference never resolved"
        );
    }

    #[test]
    fn test_query_error_source_and_sql() {
        let io = std::io::Error::other("disk gone");
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Database,
            message: "write failed".into(),
            sql: Some("DELETE FROM Person".into()),
            source: Some(Box::new(io)),
        });
        assert_eq!(err.sql(), Some("DELETE FROM Person"));
        assert!(StdError::source(&err).is_some());
        assert!(err.to_string().contains("[DELETE FROM Person]"));
    }
}
