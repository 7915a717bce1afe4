#![forbid(unsafe_code)]
//! Facade crate for the `sqlscope` database-access layer.
//!
//! Re-exports the backend-agnostic API from `sqlscope_core` and wires in the
//! drivers selected through cargo features, so applications only need this
//! crate as a dependency.
//!
//! | feature            | driver names           |
//! |--------------------|------------------------|
//! | `libsql-backend`   | `libsql`, `sqlite`     |
//! | `postgres-backend` | `postgres`, `postgresql` |
//!
//! # Example
//!
//! ```ignore
//! // Non-runnable: needs a backend feature and touches a real database.
//! use sqlscope::{params, QueryOptions};
//!
//! let spec = "sqlite::memory:".parse()?;
//! sqlscope::with_connection(&spec, |conn| {
//!     conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, email TEXT)")?;
//!     conn.atomic(|tx| {
//!         tx.execute(("INSERT INTO users(email) VALUES (?)", params!["a@example.com"]))?;
//!         // Nested scopes run inside a savepoint.
//!         tx.atomic(|nested| nested.execute("UPDATE users SET email = lower(email)"))
//!     })?;
//!     let rows = conn.query("SELECT email FROM users", &QueryOptions::default())?;
//!     assert_eq!(rows.len(), 1);
//!     Ok::<_, sqlscope::Error>(())
//! })?;
//! ```

#![allow(unexpected_cfgs)]

use std::sync::Once;

// Re-export the core API.
pub use sqlscope_core::{
    atomic, atomic_with, bind_parameter, cursor, execute, execute_prepared, fetch_one,
    from_driver_type, lookup_driver, params, prepare, prepare_with, query, register_column_kind,
    register_driver, register_param_type, registered_drivers, to_driver_type, BoxError,
    ColumnConverter, ColumnKind, Connection, ConnectionSpec, Cursor, DefaultStrategy, DriverValue,
    Error, ExecuteOptions, Executed, IsolationLevel, NoopStrategy, Object, ParamConverter,
    PreparedStatement, QueryOptions, Record, Result, Returning, Row, Sql, SqlDescriptor,
    TransactionOptions, TransactionStrategy, Value,
};

/// Driver boundary for implementing additional backends.
pub use sqlscope_core::driver;
pub use sqlscope_core::transactions;

/// Register every driver enabled through cargo features. Idempotent.
///
/// [`open`] and [`with_connection`] call this themselves; call it directly
/// before using `Connection::open` from the core crate.
pub fn register_builtin_drivers() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        #[cfg(feature = "libsql-backend")]
        sqlscope_libsql::LibsqlDriver::register();
        #[cfg(feature = "postgres-backend")]
        sqlscope_tokio_postgres::TokioPostgresDriver::register();
        #[cfg(feature = "tracing")]
        tracing::debug!(drivers = ?registered_drivers(), "registered built-in drivers");
    });
}

/// Open a connection after making sure the built-in drivers are registered.
pub fn open(spec: &ConnectionSpec) -> Result<Connection> {
    register_builtin_drivers();
    Connection::open(spec)
}

/// Parse `uri` and [`open`] it.
pub fn open_uri(uri: &str) -> Result<Connection> {
    open(&ConnectionSpec::from_uri(uri)?)
}

/// Open a connection, run `f`, and always close it.
///
/// An error from `f` takes precedence over a failure while closing.
pub fn with_connection<R, E, F>(spec: &ConnectionSpec, f: F) -> std::result::Result<R, E>
where
    E: From<Error>,
    F: FnOnce(&Connection) -> std::result::Result<R, E>,
{
    register_builtin_drivers();
    sqlscope_core::with_connection(spec, f)
}

// Backend drivers re-exported under a neutral namespace, so end-users don't
// have to depend on backend crates directly.
pub mod backends {
    #[cfg(feature = "libsql-backend")]
    pub use sqlscope_libsql::LibsqlDriver;
    #[cfg(feature = "postgres-backend")]
    pub use sqlscope_tokio_postgres::{PgParam, PgRaw, TokioPostgresDriver};
}
