//! Relational persistence for middlestore.
//!
//! - [`Driver`] / [`Connection`]: the blocking contract database drivers
//!   implement.
//! - [`ConnectionSource`] and [`Pool`]: connection sharing chosen from the
//!   driver's thread-safety level.
//! - [`Dialect`] / [`DialectRegistry`]: per-product SQL rendering, with
//!   `sqlite`, `postgresql` and `mysql` built in.
//! - [`SchemaGenerator`]: DDL for a model.
//! - [`SqlPersistence`]: the [`Persistence`](middlestore_core::Persistence)
//!   implementation an [`ObjectStore`](middlestore_core::ObjectStore) runs on.

pub mod config;
pub mod connection;
pub mod dialect;
pub mod pool;
pub mod schema;
pub mod statements;
pub mod store;

pub use config::{DeleteBehavior, SqlStoreConfig};
pub use connection::{Connection, Driver, Row, connection_error, query_error};
pub use dialect::{Dialect, DialectRegistry, MySqlDialect, PostgresDialect, SqliteDialect};
pub use pool::{ConnectionSource, Pool, PoolStats, PooledConnection, SourcedConnection};
pub use schema::{DELETED_COLUMN, KLASS_IDS_TABLE, SchemaGenerator};
pub use statements::{Statement, StatementBuilder};
pub use store::{SQL_LOG_TARGET, SqlPersistence};
