#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "libsql-backend"),
    doc = "Enable feature `libsql-backend` to use this driver."
)]
//! LibSQL/SQLite driver for sqlscope.
//!
//! Every raw connection owns a local `libsql` database handle and a
//! current-thread tokio runtime; the async client is driven with `block_on`,
//! so the driver must not be used from inside another tokio runtime.
//!
//! SQLite has no JDBC-style autocommit switch. Disabling autocommit only marks
//! the session as manual; `BEGIN` is issued lazily before the next statement or
//! savepoint, and `commit`/`rollback` end the physical transaction.

#[cfg(feature = "libsql-backend")]
mod backend {
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Instant;

    use sqlscope_core::{
        register_driver, ColumnMeta, ConnectionSpec, Driver, DriverError, DriverResult,
        DriverValue, GeneratedKeys, IsolationLevel, RawConnection, RawStatement, ResultMetadata,
        ResultSet, RowBuffer, Savepoint,
    };

    #[cfg(feature = "tracing")]
    use tracing::{debug, info};

    /// Names the driver registers under.
    pub const DRIVER_NAMES: [&str; 2] = ["libsql", "sqlite"];

    const DEFAULT_BUSY_TIMEOUT_MS: u64 = 1000;

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, rows: usize, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                backend = "libsql",
                op = op,
                rows = rows,
                elapsed_ms = elapsed,
                success = success,
                "sql op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("sqlscope_ops_total", 1, "backend" => "libsql", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("sqlscope_op_duration_ms", elapsed as f64, "backend" => "libsql", "op" => op.to_string());
            if !success {
                metrics::counter!("sqlscope_op_errors_total", 1, "backend" => "libsql", "op" => op.to_string());
            }
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens local libsql databases. The spec's `name` (or `subname`) is the
    /// database path; without one an in-memory database is used.
    ///
    /// Recognised `params`: `busy-timeout` in milliseconds (default 1000).
    #[derive(Clone, Copy, Debug, Default)]
    pub struct LibsqlDriver;

    impl LibsqlDriver {
        pub fn new() -> Self {
            Self
        }

        /// Register under every name in [`DRIVER_NAMES`].
        pub fn register() {
            for name in DRIVER_NAMES {
                register_driver(name, Arc::new(LibsqlDriver));
            }
        }
    }

    impl Driver for LibsqlDriver {
        fn connect(&self, spec: &ConnectionSpec) -> DriverResult<Box<dyn RawConnection>> {
            let path = spec
                .name
                .as_deref()
                .or(spec.subname.as_deref())
                .filter(|p| !p.is_empty())
                .unwrap_or(":memory:");
            let busy_ms = match spec.params.get("busy-timeout") {
                Some(raw) => raw.parse::<u64>().map_err(|e| {
                    DriverError::with_source(format!("invalid busy-timeout `{raw}`"), e)
                })?,
                None => DEFAULT_BUSY_TIMEOUT_MS,
            };

            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| DriverError::with_source("failed to start libsql runtime", e))?;
            let db = rt
                .block_on(libsql::Builder::new_local(path).build())
                .map_err(|e| DriverError::with_source(format!("failed to open `{path}`"), e))?;
            let conn = db.connect().map_err(DriverError::from_source)?;

            let session = Session {
                rt,
                _db: db,
                conn: Mutex::new(Some(conn)),
                state: Mutex::new(SessionState::default()),
            };
            session.pragma(&format!("PRAGMA busy_timeout = {busy_ms}"))?;
            #[cfg(feature = "tracing")]
            debug!(path, busy_ms, "opened libsql connection");
            Ok(Box::new(LibsqlConnection {
                session: Arc::new(session),
            }))
        }
    }

    struct SessionState {
        manual: bool,
        isolation: IsolationLevel,
        savepoints: usize,
    }

    impl Default for SessionState {
        fn default() -> Self {
            Self {
                manual: false,
                isolation: IsolationLevel::Serializable,
                savepoints: 0,
            }
        }
    }

    struct Session {
        rt: tokio::runtime::Runtime,
        _db: libsql::Database,
        conn: Mutex<Option<libsql::Connection>>,
        state: Mutex<SessionState>,
    }

    impl Session {
        fn handle(&self) -> DriverResult<libsql::Connection> {
            lock(&self.conn)
                .clone()
                .ok_or_else(|| DriverError::new("libsql connection is closed"))
        }

        /// Open the physical transaction if the session is manual and none is open yet.
        fn begin_if_manual(&self, conn: &libsql::Connection) -> DriverResult<()> {
            if lock(&self.state).manual && conn.is_autocommit() {
                self.rt
                    .block_on(conn.execute("BEGIN", ()))
                    .map_err(DriverError::from_source)?;
            }
            Ok(())
        }

        /// Run a control statement outside the lazy-begin path.
        fn control(&self, conn: &libsql::Connection, sql: &str) -> DriverResult<()> {
            self.rt
                .block_on(conn.execute(sql, ()))
                .map(|_| ())
                .map_err(DriverError::from_source)
        }

        /// Run a pragma and return the first column of its first row, if any.
        fn pragma(&self, sql: &str) -> DriverResult<Option<i64>> {
            let conn = self.handle()?;
            self.rt
                .block_on(async {
                    let mut rows = conn.query(sql, ()).await?;
                    match rows.next().await? {
                        Some(row) => row.get::<i64>(0).map(Some),
                        None => Ok(None),
                    }
                })
                .map_err(DriverError::from_source)
        }

        fn execute(&self, sql: &str, params: Vec<libsql::Value>) -> DriverResult<u64> {
            let start = Instant::now();
            let conn = self.handle()?;
            self.begin_if_manual(&conn)?;
            let result = self
                .rt
                .block_on(conn.execute(sql, params))
                .map_err(DriverError::from_source);
            obs_record(
                "execute",
                start,
                result.as_ref().map_or(0, |n| *n as usize),
                result.is_ok(),
            );
            result
        }

        fn open_rows(
            self: &Arc<Self>,
            sql: &str,
            params: Vec<libsql::Value>,
        ) -> DriverResult<LibsqlRows> {
            let conn = self.handle()?;
            self.begin_if_manual(&conn)?;
            let (columns, rows) = self
                .rt
                .block_on(async {
                    let mut stmt = conn.prepare(sql).await?;
                    let columns: Vec<ColumnMeta> = stmt
                        .columns()
                        .iter()
                        .map(|c| ColumnMeta::new(c.name(), c.decl_type().unwrap_or("")))
                        .collect();
                    let rows = stmt.query(params).await?;
                    Ok::<_, libsql::Error>((columns, rows))
                })
                .map_err(DriverError::from_source)?;
            Ok(LibsqlRows {
                session: Arc::clone(self),
                rows,
                metadata: ResultMetadata::new(columns),
            })
        }

        fn query_all(
            self: &Arc<Self>,
            sql: &str,
            params: Vec<libsql::Value>,
        ) -> DriverResult<(ResultMetadata, Vec<Vec<DriverValue>>)> {
            let start = Instant::now();
            let result = self.open_rows(sql, params).and_then(|mut rows| {
                let mut buffered = Vec::new();
                while let Some(row) = rows.next_row()? {
                    buffered.push(row);
                }
                Ok((rows.metadata, buffered))
            });
            obs_record(
                "query",
                start,
                result.as_ref().map_or(0, |(_, rows)| rows.len()),
                result.is_ok(),
            );
            result
        }

        fn end_transaction(&self, sql: &str) -> DriverResult<()> {
            let conn = self.handle()?;
            {
                let mut state = lock(&self.state);
                if !state.manual {
                    return Err(DriverError::new(format!(
                        "cannot {} while autocommit is enabled",
                        sql.to_ascii_lowercase()
                    )));
                }
                state.savepoints = 0;
            }
            if !conn.is_autocommit() {
                self.control(&conn, sql)?;
            }
            Ok(())
        }
    }

    struct LibsqlConnection {
        session: Arc<Session>,
    }

    impl RawConnection for LibsqlConnection {
        fn prepare(&self, sql: &str, keys: &GeneratedKeys) -> DriverResult<Box<dyn RawStatement>> {
            let conn = self.session.handle()?;
            let sql = keys.rewrite_returning(sql).into_owned();
            let count = self
                .session
                .rt
                .block_on(conn.prepare(&sql))
                .map_err(DriverError::from_source)?
                .parameter_count();
            Ok(Box::new(LibsqlStatement {
                session: Arc::clone(&self.session),
                sql,
                keys: keys.clone(),
                slots: vec![None; count],
                batch: Vec::new(),
                generated: None,
            }))
        }

        fn execute(&self, sql: &str) -> DriverResult<u64> {
            self.session.execute(sql, Vec::new())
        }

        fn auto_commit(&self) -> DriverResult<bool> {
            self.session.handle()?;
            Ok(!lock(&self.session.state).manual)
        }

        fn set_auto_commit(&self, enabled: bool) -> DriverResult<()> {
            let conn = self.session.handle()?;
            let was_manual = {
                let mut state = lock(&self.session.state);
                let was = state.manual;
                state.manual = !enabled;
                if enabled {
                    state.savepoints = 0;
                }
                was
            };
            // Re-enabling autocommit commits whatever is pending.
            if enabled && was_manual && !conn.is_autocommit() {
                self.session.control(&conn, "COMMIT")?;
            }
            Ok(())
        }

        fn isolation(&self) -> DriverResult<IsolationLevel> {
            self.session.handle()?;
            Ok(lock(&self.session.state).isolation)
        }

        /// SQLite runs every transaction serializably; only `read-uncommitted`
        /// changes behaviour (shared-cache reads). Other levels are recorded as requested.
        fn set_isolation(&self, level: IsolationLevel) -> DriverResult<()> {
            if level == IsolationLevel::None {
                return Err(DriverError::new(
                    "libsql cannot run without transactions (isolation `none`)",
                ));
            }
            let flag = u8::from(level == IsolationLevel::ReadUncommitted);
            self.session
                .pragma(&format!("PRAGMA read_uncommitted = {flag}"))?;
            lock(&self.session.state).isolation = level;
            Ok(())
        }

        fn is_read_only(&self) -> DriverResult<bool> {
            Ok(self.session.pragma("PRAGMA query_only")? == Some(1))
        }

        fn set_read_only(&self, read_only: bool) -> DriverResult<()> {
            let value = if read_only { "ON" } else { "OFF" };
            self.session
                .pragma(&format!("PRAGMA query_only = {value}"))
                .map(|_| ())
        }

        fn commit(&self) -> DriverResult<()> {
            self.session.end_transaction("COMMIT")
        }

        fn rollback(&self) -> DriverResult<()> {
            self.session.end_transaction("ROLLBACK")
        }

        fn set_savepoint(&self) -> DriverResult<Savepoint> {
            let conn = self.session.handle()?;
            let name = {
                let mut state = lock(&self.session.state);
                if !state.manual {
                    return Err(DriverError::new(
                        "savepoints require autocommit to be disabled",
                    ));
                }
                state.savepoints += 1;
                format!("sp{}", state.savepoints)
            };
            self.session.begin_if_manual(&conn)?;
            self.session
                .control(&conn, &format!("SAVEPOINT {name}"))?;
            Ok(Savepoint::new(name))
        }

        fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
            let conn = self.session.handle()?;
            self.session
                .control(&conn, &format!("ROLLBACK TO SAVEPOINT {}", savepoint.name()))
        }

        fn release_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
            let conn = self.session.handle()?;
            self.session
                .control(&conn, &format!("RELEASE SAVEPOINT {}", savepoint.name()))
        }

        fn close(&self) -> DriverResult<()> {
            let conn = lock(&self.session.conn)
                .take()
                .ok_or_else(|| DriverError::new("libsql connection already closed"))?;
            // Pending work is discarded, never committed.
            if !conn.is_autocommit() {
                self.session.control(&conn, "ROLLBACK")?;
            }
            #[cfg(feature = "tracing")]
            debug!("closed libsql connection");
            Ok(())
        }
    }

    struct LibsqlStatement {
        session: Arc<Session>,
        sql: String,
        keys: GeneratedKeys,
        slots: Vec<Option<libsql::Value>>,
        batch: Vec<Vec<libsql::Value>>,
        generated: Option<RowBuffer>,
    }

    impl LibsqlStatement {
        fn bound(&self) -> DriverResult<Vec<libsql::Value>> {
            self.slots
                .iter()
                .enumerate()
                .map(|(i, slot)| {
                    slot.clone()
                        .ok_or_else(|| DriverError::new(format!("parameter {} is not bound", i + 1)))
                })
                .collect()
        }

        fn run(&mut self, params: Vec<libsql::Value>) -> DriverResult<u64> {
            if self.keys.is_requested() {
                let (metadata, rows) = self.session.query_all(&self.sql, params)?;
                let count = rows.len() as u64;
                self.generated = Some(RowBuffer::new(metadata, rows));
                Ok(count)
            } else {
                self.session.execute(&self.sql, params)
            }
        }
    }

    impl RawStatement for LibsqlStatement {
        fn parameter_count(&self) -> usize {
            self.slots.len()
        }

        fn set_object(&mut self, index: usize, value: DriverValue) -> DriverResult<()> {
            let count = self.slots.len();
            let slot = index
                .checked_sub(1)
                .and_then(|i| self.slots.get_mut(i))
                .ok_or_else(|| {
                    DriverError::new(format!(
                        "parameter index {index} out of range (statement has {count})"
                    ))
                })?;
            *slot = Some(to_libsql(value)?);
            Ok(())
        }

        fn clear_parameters(&mut self) {
            self.slots.iter_mut().for_each(|slot| *slot = None);
        }

        fn add_batch(&mut self) -> DriverResult<()> {
            let params = self.bound()?;
            self.batch.push(params);
            Ok(())
        }

        fn execute_batch(&mut self) -> DriverResult<Vec<u64>> {
            let start = Instant::now();
            let groups = std::mem::take(&mut self.batch);
            let size = groups.len();
            let result = groups
                .into_iter()
                .map(|params| self.run(params))
                .collect::<DriverResult<Vec<u64>>>();
            obs_record("execute_batch", start, size, result.is_ok());
            result
        }

        fn execute_update(&mut self) -> DriverResult<u64> {
            let params = self.bound()?;
            self.run(params)
        }

        fn execute_query(&mut self) -> DriverResult<Box<dyn ResultSet>> {
            let params = self.bound()?;
            Ok(Box::new(self.session.open_rows(&self.sql, params)?))
        }

        fn generated_keys(&mut self) -> DriverResult<Box<dyn ResultSet>> {
            Ok(Box::new(self.generated.take().unwrap_or_default()))
        }
    }

    /// Streams rows from the open libsql cursor.
    struct LibsqlRows {
        session: Arc<Session>,
        rows: libsql::Rows,
        metadata: ResultMetadata,
    }

    impl ResultSet for LibsqlRows {
        fn metadata(&self) -> &ResultMetadata {
            &self.metadata
        }

        fn next_row(&mut self) -> DriverResult<Option<Vec<DriverValue>>> {
            let row = self
                .session
                .rt
                .block_on(self.rows.next())
                .map_err(DriverError::from_source)?;
            let Some(row) = row else {
                return Ok(None);
            };
            self.metadata
                .columns()
                .iter()
                .enumerate()
                .map(|(i, column)| {
                    row.get_value(i as i32)
                        .map(|value| from_libsql(value, &column.type_name))
                        .map_err(DriverError::from_source)
                })
                .collect::<DriverResult<Vec<_>>>()
                .map(Some)
        }
    }

    /// Driver value to libsql wire value. Booleans are stored as 0/1, arrays as
    /// JSON text; an opaque value binds only when it wraps a `libsql::Value`.
    pub(crate) fn to_libsql(value: DriverValue) -> DriverResult<libsql::Value> {
        Ok(match value {
            DriverValue::Null => libsql::Value::Null,
            DriverValue::Bool(b) => libsql::Value::Integer(i64::from(b)),
            DriverValue::Integer(i) => libsql::Value::Integer(i),
            DriverValue::Real(f) => libsql::Value::Real(f),
            DriverValue::Text(s) => libsql::Value::Text(s),
            DriverValue::Blob(b) => libsql::Value::Blob(b),
            DriverValue::Array(items) => {
                let json = serde_json::Value::Array(
                    items.iter().map(to_json).collect::<DriverResult<_>>()?,
                );
                libsql::Value::Text(json.to_string())
            }
            DriverValue::Opaque(object) => object
                .downcast_ref::<libsql::Value>()
                .cloned()
                .ok_or_else(|| {
                    DriverError::new(format!(
                        "cannot bind value of type `{}` to libsql",
                        object.type_name()
                    ))
                })?,
        })
    }

    /// libsql wire value to driver value, guided by the column's declared type.
    pub(crate) fn from_libsql(value: libsql::Value, decl_type: &str) -> DriverValue {
        let decl = decl_type.to_ascii_uppercase();
        match value {
            libsql::Value::Null => DriverValue::Null,
            libsql::Value::Integer(i) if decl.contains("BOOL") => DriverValue::Bool(i != 0),
            libsql::Value::Integer(i) => DriverValue::Integer(i),
            libsql::Value::Real(f) => DriverValue::Real(f),
            libsql::Value::Text(s) if decl.contains("JSON") && s.trim_start().starts_with('[') => {
                match serde_json::from_str::<serde_json::Value>(&s) {
                    Ok(json) => from_json(json),
                    Err(_) => DriverValue::Text(s),
                }
            }
            libsql::Value::Text(s) => DriverValue::Text(s),
            libsql::Value::Blob(b) => DriverValue::Blob(b),
        }
    }

    fn to_json(value: &DriverValue) -> DriverResult<serde_json::Value> {
        Ok(match value {
            DriverValue::Null => serde_json::Value::Null,
            DriverValue::Bool(b) => serde_json::Value::Bool(*b),
            DriverValue::Integer(i) => serde_json::Value::from(*i),
            DriverValue::Real(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .ok_or_else(|| DriverError::new(format!("cannot store {f} in a JSON array")))?,
            DriverValue::Text(s) => serde_json::Value::String(s.clone()),
            DriverValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(to_json).collect::<DriverResult<_>>()?)
            }
            DriverValue::Blob(_) | DriverValue::Opaque(_) => {
                return Err(DriverError::new(
                    "only scalar and nested array elements can be stored in a libsql array",
                ))
            }
        })
    }

    fn from_json(value: serde_json::Value) -> DriverValue {
        match value {
            serde_json::Value::Null => DriverValue::Null,
            serde_json::Value::Bool(b) => DriverValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => DriverValue::Integer(i),
                None => DriverValue::Real(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => DriverValue::Text(s),
            serde_json::Value::Array(items) => {
                DriverValue::Array(items.into_iter().map(from_json).collect())
            }
            object @ serde_json::Value::Object(_) => DriverValue::Text(object.to_string()),
        }
    }
}

#[cfg(feature = "libsql-backend")]
pub use backend::{LibsqlDriver, DRIVER_NAMES};
