//! The driver boundary: the minimal capability set a SQL driver exposes to the core.
//!
//! Backends implement [`Driver`], [`RawConnection`], [`RawStatement`] and
//! [`ResultSet`] and register themselves by name with [`register_driver`].
//! All indexes across this boundary are 1-based.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, OnceLock, RwLock};

use crate::spec::{ConnectionSpec, IsolationLevel};
use crate::value::DriverValue;
use crate::BoxError;

/// The single error type drivers report. The core classifies it by the operation that failed.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct DriverError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Use the source's own message.
    pub fn from_source<E>(source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type DriverResult<T> = std::result::Result<T, DriverError>;

/// Factory for raw connections.
pub trait Driver: Send + Sync {
    fn connect(&self, spec: &ConnectionSpec) -> DriverResult<Box<dyn RawConnection>>;
}

/// Named marker within the current physical transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Which generated keys / returned rows a statement should produce.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum GeneratedKeys {
    #[default]
    None,
    All,
    Columns(Vec<String>),
}

impl GeneratedKeys {
    pub fn is_requested(&self) -> bool {
        !matches!(self, GeneratedKeys::None)
    }

    /// Append a `RETURNING` clause for engines that return generated rows through it.
    ///
    /// SQL that already carries a `RETURNING` clause is left untouched.
    pub fn rewrite_returning<'a>(&self, sql: &'a str) -> Cow<'a, str> {
        let columns = match self {
            GeneratedKeys::None => return Cow::Borrowed(sql),
            GeneratedKeys::All => "*".to_string(),
            GeneratedKeys::Columns(cols) if cols.is_empty() => "*".to_string(),
            GeneratedKeys::Columns(cols) => cols.join(", "),
        };
        if contains_keyword(sql, "returning") {
            return Cow::Borrowed(sql);
        }
        let trimmed = sql.trim_end().trim_end_matches(';');
        Cow::Owned(format!("{trimmed} RETURNING {columns}"))
    }
}

/// Whether `keyword` appears as a whole word outside quoted text and comments.
fn contains_keyword(sql: &str, keyword: &str) -> bool {
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80;
    let bytes = sql.as_bytes();
    let skip_to = |from: usize, close: &str| {
        sql[from..]
            .find(close)
            .map_or(sql.len(), |at| from + at + close.len())
    };
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_to(i + 1, "'"),
            b'"' => i = skip_to(i + 1, "\""),
            b'`' => i = skip_to(i + 1, "`"),
            b'-' if bytes.get(i + 1) == Some(&b'-') => i = skip_to(i + 2, "\n"),
            b'/' if bytes.get(i + 1) == Some(&b'*') => i = skip_to(i + 2, "*/"),
            b if is_word(b) => {
                let start = i;
                while i < bytes.len() && is_word(bytes[i]) {
                    i += 1;
                }
                if sql[start..i].eq_ignore_ascii_case(keyword) {
                    return true;
                }
            }
            _ => i += 1,
        }
    }
    false
}

/// One raw driver session.
///
/// Methods take `&self`; implementations synchronise internally so that a
/// connection can be shared between clones of the wrapper.
pub trait RawConnection: Send + Sync {
    fn prepare(&self, sql: &str, keys: &GeneratedKeys) -> DriverResult<Box<dyn RawStatement>>;

    /// Execute a statement without parameters, returning the affected row count.
    fn execute(&self, sql: &str) -> DriverResult<u64>;

    fn execute_batch(&self, statements: &[&str]) -> DriverResult<Vec<u64>> {
        statements.iter().map(|sql| self.execute(sql)).collect()
    }

    fn auto_commit(&self) -> DriverResult<bool>;
    fn set_auto_commit(&self, enabled: bool) -> DriverResult<()>;

    fn isolation(&self) -> DriverResult<IsolationLevel>;
    fn set_isolation(&self, level: IsolationLevel) -> DriverResult<()>;

    fn is_read_only(&self) -> DriverResult<bool>;
    fn set_read_only(&self, read_only: bool) -> DriverResult<()>;

    fn commit(&self) -> DriverResult<()>;
    fn rollback(&self) -> DriverResult<()>;

    fn set_savepoint(&self) -> DriverResult<Savepoint>;
    fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()>;
    fn release_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()>;

    /// Connection-scoped array factory used by array conversions.
    fn create_array(
        &self,
        _element_type: &str,
        elements: Vec<DriverValue>,
    ) -> DriverResult<DriverValue> {
        Ok(DriverValue::Array(elements))
    }

    fn close(&self) -> DriverResult<()>;
}

/// A prepared statement. Owned by the caller and independent of the connection borrow.
pub trait RawStatement: Send {
    fn parameter_count(&self) -> usize;
    fn set_object(&mut self, index: usize, value: DriverValue) -> DriverResult<()>;

    fn set_null(&mut self, index: usize, _type_name: &str) -> DriverResult<()> {
        self.set_object(index, DriverValue::Null)
    }

    fn clear_parameters(&mut self);

    /// Snapshot the currently bound parameters as one batch entry.
    fn add_batch(&mut self) -> DriverResult<()>;

    /// Run every queued batch entry, returning one count per entry.
    fn execute_batch(&mut self) -> DriverResult<Vec<u64>>;

    fn execute_update(&mut self) -> DriverResult<u64>;
    fn execute_query(&mut self) -> DriverResult<Box<dyn ResultSet>>;

    /// Rows produced by the last execution when generated keys were requested.
    fn generated_keys(&mut self) -> DriverResult<Box<dyn ResultSet>>;
}

/// Per-column metadata of a result set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnMeta {
    pub label: String,
    pub type_name: String,
}

impl ColumnMeta {
    pub fn new(label: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            type_name: type_name.into(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultMetadata {
    columns: Vec<ColumnMeta>,
}

impl ResultMetadata {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self { columns }
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Column at a 1-based index.
    pub fn column(&self, index: usize) -> Option<&ColumnMeta> {
        index.checked_sub(1).and_then(|i| self.columns.get(i))
    }

    pub fn column_label(&self, index: usize) -> Option<&str> {
        self.column(index).map(|c| c.label.as_str())
    }

    pub fn column_type_name(&self, index: usize) -> Option<&str> {
        self.column(index).map(|c| c.type_name.as_str())
    }

    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }
}

/// Forward-only iteration over driver rows.
pub trait ResultSet: Send {
    fn metadata(&self) -> &ResultMetadata;
    fn next_row(&mut self) -> DriverResult<Option<Vec<DriverValue>>>;
}

/// A fully buffered result set, for drivers that materialise rows eagerly.
#[derive(Debug, Default)]
pub struct RowBuffer {
    metadata: ResultMetadata,
    rows: VecDeque<Vec<DriverValue>>,
}

impl RowBuffer {
    pub fn new(metadata: ResultMetadata, rows: Vec<Vec<DriverValue>>) -> Self {
        Self {
            metadata,
            rows: rows.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl ResultSet for RowBuffer {
    fn metadata(&self) -> &ResultMetadata {
        &self.metadata
    }

    fn next_row(&mut self) -> DriverResult<Option<Vec<DriverValue>>> {
        Ok(self.rows.pop_front())
    }
}

type DriverTable = RwLock<HashMap<String, Arc<dyn Driver>>>;

fn drivers() -> &'static DriverTable {
    static DRIVERS: OnceLock<DriverTable> = OnceLock::new();
    DRIVERS.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register (or replace) a driver under a case-insensitive name.
pub fn register_driver(name: &str, driver: Arc<dyn Driver>) {
    let mut table = drivers()
        .write()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    if table.insert(name.to_ascii_lowercase(), driver).is_some() {
        tracing::debug!(driver = name, "replaced registered driver");
    }
}

pub fn lookup_driver(name: &str) -> Option<Arc<dyn Driver>> {
    drivers()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .get(&name.to_ascii_lowercase())
        .cloned()
}

/// Names of every registered driver, sorted.
pub fn registered_drivers() -> Vec<String> {
    let mut names: Vec<String> = drivers()
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}
