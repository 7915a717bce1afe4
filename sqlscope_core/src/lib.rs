#![forbid(unsafe_code)]
//! Core of the sqlscope database-access layer.
//!
//! This crate is database-agnostic: it owns the connection wrapper, the
//! savepoint-based transaction state machine, the pluggable commit/rollback
//! strategy, the statement executor and the type protocol. Concrete drivers
//! live in backend crates and plug in through the traits in [`driver`].

// Public modules
pub mod connection;
pub mod driver;
pub mod executor;
pub mod spec;
pub mod transactions;
pub mod types;
pub mod value;

#[cfg(test)]
#[allow(dead_code)]
mod stub;

pub use connection::{with_connection, Connection, PriorSettings, RollbackFlag, TransactionState};
pub use driver::{
    lookup_driver, register_driver, registered_drivers, ColumnMeta, Driver, DriverError,
    DriverResult, GeneratedKeys, RawConnection, RawStatement, ResultMetadata, ResultSet, RowBuffer,
    Savepoint,
};
pub use executor::{
    cursor, execute, execute_prepared, fetch_one, prepare, prepare_with, query, Cursor,
    ExecuteOptions, Executed, PreparedStatement, QueryOptions, Record, Returning, Row, Sql,
    SqlDescriptor,
};
pub use spec::{ConnectionSpec, IsolationLevel};
pub use transactions::{
    atomic, atomic_with, DefaultStrategy, NoopStrategy, TransactionOptions, TransactionStrategy,
};
pub use types::{
    bind_parameter, from_driver_type, register_column_kind, register_param_type, to_driver_type,
    ColumnConverter, ParamConverter,
};
pub use value::{ColumnKind, DriverValue, Object, Value};

/// Boxed error used as the `#[source]` of wrapped failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error taxonomy shared by every sqlscope operation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection specification could not be resolved (unknown driver, malformed URI).
    #[error("configuration error: {message}")]
    Config { message: String },
    /// Opening or closing a connection failed, or the connection is already closed.
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    /// Begin, commit, rollback or savepoint handling failed at the driver level.
    #[error("transaction error: {message}")]
    Transaction {
        message: String,
        #[source]
        source: Option<BoxError>,
    },
    /// Malformed SQL descriptor, inconsistent parameter batches or invalid option combination.
    #[error("invalid argument: {message}")]
    Argument { message: String },
    /// Opaque pass-through of an execution failure reported by the driver.
    #[error("driver error: {source}")]
    Driver {
        #[source]
        source: DriverError,
    },
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap a driver failure that happened while opening or closing a connection.
    pub fn connection_failed<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Wrap a driver failure that happened during a transaction transition.
    pub fn transaction<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Transaction {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn argument(message: impl Into<String>) -> Self {
        Error::Argument {
            message: message.into(),
        }
    }

    /// Wrap an execution failure from the driver.
    pub fn driver(source: DriverError) -> Self {
        Error::Driver { source }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, Error::Config { .. })
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection { .. })
    }

    pub fn is_transaction(&self) -> bool {
        matches!(self, Error::Transaction { .. })
    }

    pub fn is_argument(&self) -> bool {
        matches!(self, Error::Argument { .. })
    }

    pub fn is_driver(&self) -> bool {
        matches!(self, Error::Driver { .. })
    }
}

impl From<DriverError> for Error {
    fn from(source: DriverError) -> Self {
        Error::driver(source)
    }
}

/// Convenience alias for results returned by sqlscope operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Build a `Vec<Value>` parameter group from heterogeneous expressions.
///
/// ```
/// use sqlscope_core::{params, Value};
/// let group = params![1, "two", None::<i64>];
/// assert_eq!(group, vec![Value::Int(1), Value::Text("two".into()), Value::Null]);
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($value)),+]
    };
}
