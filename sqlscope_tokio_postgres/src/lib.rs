#![forbid(unsafe_code)]
#![cfg_attr(
    not(feature = "postgres-backend"),
    doc = "Enable feature `postgres-backend` to use this driver."
)]
//! PostgreSQL driver for sqlscope, built on `tokio-postgres`.
//!
//! Each raw connection owns a current-thread tokio runtime that drives the
//! client and its background connection task; calls block on that runtime.
//!
//! Statements use `?` placeholders like every other sqlscope driver and are
//! rewritten to `$1, $2, ...` before preparation (`??` yields a literal `?`).
//! Parameters are encoded for the types the server reports for the statement.
//! Results are fetched eagerly.

#[cfg(feature = "postgres-backend")]
mod backend {
    use std::borrow::Cow;
    use std::error::Error as StdError;
    use std::fmt;
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::{Duration, Instant};

    use bytes::BytesMut;
    use sqlscope_core::{
        register_driver, ColumnMeta, ConnectionSpec, Driver, DriverError, DriverResult,
        DriverValue, GeneratedKeys, IsolationLevel, Object, RawConnection, RawStatement,
        ResultMetadata, ResultSet, RowBuffer, Savepoint,
    };
    use tokio_postgres::types::{to_sql_checked, FromSql, IsNull, Kind, ToSql, Type};
    use tokio_postgres::{Client, NoTls, Row, Statement};

    #[cfg(feature = "tracing")]
    use tracing::{debug, info, warn};

    /// Names the driver registers under.
    pub const DRIVER_NAMES: [&str; 2] = ["postgres", "postgresql"];

    type Param = Box<dyn ToSql + Sync + Send>;
    type BoxError = Box<dyn StdError + Sync + Send>;

    #[inline]
    #[allow(unused_variables)]
    fn obs_record(op: &str, start: Instant, rows: usize, success: bool) {
        let elapsed = start.elapsed().as_millis() as u64;
        #[cfg(feature = "tracing")]
        {
            info!(
                backend = "postgres",
                op = op,
                rows = rows,
                elapsed_ms = elapsed,
                success = success,
                "sql op"
            );
        }
        #[cfg(feature = "metrics")]
        {
            metrics::counter!("sqlscope_ops_total", 1, "backend" => "postgres", "op" => op.to_string(), "success" => success.to_string());
            metrics::histogram!("sqlscope_op_duration_ms", elapsed as f64, "backend" => "postgres", "op" => op.to_string());
            if !success {
                metrics::counter!("sqlscope_op_errors_total", 1, "backend" => "postgres", "op" => op.to_string());
            }
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Rewrite `?` placeholders to numbered `$n` ones, leaving quoted text,
    /// quoted identifiers, comments and dollar-quoted bodies alone. `??`
    /// stands for a literal `?`.
    pub fn positional_placeholders(sql: &str) -> Cow<'_, str> {
        if !sql.contains('?') {
            return Cow::Borrowed(sql);
        }
        let mut out = String::with_capacity(sql.len() + 8);
        let mut n = 0;
        let mut i = 0;
        let mut prev: Option<char> = None;
        while let Some(c) = sql[i..].chars().next() {
            let rest = &sql[i..];
            // `a$b$` is an identifier, not the start of a dollar quote.
            let in_word = prev.map_or(false, |p| p.is_alphanumeric() || p == '_');
            if let Some(len) = opaque_span(rest).filter(|_| c != '$' || !in_word) {
                out.push_str(&rest[..len]);
                prev = rest[..len].chars().last();
                i += len;
                continue;
            }
            if rest.starts_with("??") {
                out.push('?');
                i += 2;
            } else if c == '?' {
                n += 1;
                out.push('$');
                out.push_str(&n.to_string());
                i += 1;
            } else {
                out.push(c);
                i += c.len_utf8();
            }
            prev = Some(c);
        }
        Cow::Owned(out)
    }

    /// Byte length of the quoted text, comment or dollar-quoted body that
    /// starts `s`, if any. Unterminated spans run to the end.
    fn opaque_span(s: &str) -> Option<usize> {
        let through = |open: usize, close: &str| {
            s[open..]
                .find(close)
                .map_or(s.len(), |at| open + at + close.len())
        };
        if s.starts_with('\'') {
            return Some(through(1, "'"));
        }
        if s.starts_with('"') {
            return Some(through(1, "\""));
        }
        if s.starts_with("--") {
            return Some(through(2, "\n"));
        }
        if s.starts_with("/*") {
            return Some(through(2, "*/"));
        }
        let tag = s.strip_prefix('$')?;
        let tag_len = tag.find(|c: char| !(c.is_alphanumeric() || c == '_'))?;
        if !tag[tag_len..].starts_with('$') || tag.starts_with(|c: char| c.is_ascii_digit()) {
            return None;
        }
        let delimiter = &s[..tag_len + 2];
        Some(through(delimiter.len(), delimiter))
    }

    /// A parameter value the driver hands to `tokio-postgres` untouched.
    ///
    /// Wrap it in `DriverValue::Opaque` from a parameter converter to bind
    /// types the core does not model (composites, ranges, enums, ...).
    #[derive(Clone)]
    pub struct PgParam(Arc<dyn ToSql + Send + Sync>);

    impl PgParam {
        pub fn new<T: ToSql + Send + Sync + 'static>(value: T) -> Self {
            Self(Arc::new(value))
        }
    }

    impl fmt::Debug for PgParam {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_tuple("PgParam").field(&self.0).finish()
        }
    }

    impl ToSql for PgParam {
        fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
            self.0.to_sql_checked(ty, out)
        }

        fn accepts(_ty: &Type) -> bool {
            true
        }

        fn to_sql_checked(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
            self.0.to_sql_checked(ty, out)
        }
    }

    /// NULL for a parameter of any type.
    #[derive(Debug)]
    struct SqlNull;

    impl ToSql for SqlNull {
        fn to_sql(&self, _ty: &Type, _out: &mut BytesMut) -> Result<IsNull, BoxError> {
            Ok(IsNull::Yes)
        }

        fn accepts(_ty: &Type) -> bool {
            true
        }

        to_sql_checked!();
    }

    /// A column value of a type the driver does not decode, in binary wire format.
    ///
    /// Such values reach the core as `DriverValue::Opaque(PgRaw)`; register a
    /// column converter for `ColumnKind::opaque::<PgRaw>()` to decode them.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct PgRaw {
        pub type_name: String,
        pub bytes: Vec<u8>,
    }

    impl<'a> FromSql<'a> for PgRaw {
        fn from_sql(ty: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
            Ok(PgRaw {
                type_name: ty.name().to_string(),
                bytes: raw.to_vec(),
            })
        }

        fn accepts(_ty: &Type) -> bool {
            true
        }
    }

    fn is_textual(ty: &Type) -> bool {
        matches!(ty.name(), "text" | "varchar" | "bpchar" | "name" | "unknown")
    }

    fn mismatch(value: &DriverValue, ty: &Type) -> DriverError {
        DriverError::new(format!(
            "cannot bind {value:?} to a parameter of type `{}`",
            ty.name()
        ))
    }

    fn narrow<T: TryFrom<i64>>(i: i64, ty: &Type) -> DriverResult<T> {
        T::try_from(i).map_err(|_| mismatch(&DriverValue::Integer(i), ty))
    }

    /// Encode one driver value for a parameter of type `ty`.
    pub(crate) fn to_param(value: DriverValue, ty: &Type) -> DriverResult<Param> {
        let param: Param = match value {
            DriverValue::Null => Box::new(SqlNull),
            DriverValue::Bool(b) => Box::new(b),
            DriverValue::Integer(i) => match ty.name() {
                "int2" => Box::new(narrow::<i16>(i, ty)?),
                "int4" => Box::new(narrow::<i32>(i, ty)?),
                "oid" => Box::new(narrow::<u32>(i, ty)?),
                "float4" => Box::new(i as f32),
                "float8" => Box::new(i as f64),
                _ if is_textual(ty) => Box::new(i.to_string()),
                _ => Box::new(i),
            },
            DriverValue::Real(f) => match ty.name() {
                "float4" => Box::new(f as f32),
                _ => Box::new(f),
            },
            DriverValue::Text(s) => Box::new(s),
            DriverValue::Blob(b) => Box::new(b),
            DriverValue::Array(items) => match ty.kind() {
                Kind::Array(element) => array_param(items, element)?,
                _ => return Err(mismatch(&DriverValue::Array(items), ty)),
            },
            DriverValue::Opaque(object) => match object.downcast_ref::<PgParam>() {
                Some(param) => Box::new(param.clone()),
                None => {
                    return Err(DriverError::new(format!(
                        "cannot bind value of type `{}` to postgres; wrap it in PgParam",
                        object.type_name()
                    )))
                }
            },
        };
        Ok(param)
    }

    fn elements<T>(
        items: Vec<DriverValue>,
        element: &Type,
        convert: impl Fn(&DriverValue) -> Option<T>,
    ) -> DriverResult<Vec<Option<T>>> {
        items
            .into_iter()
            .map(|item| match item {
                DriverValue::Null => Ok(None),
                other => convert(&other)
                    .map(Some)
                    .ok_or_else(|| mismatch(&other, element)),
            })
            .collect()
    }

    fn array_param(items: Vec<DriverValue>, element: &Type) -> DriverResult<Param> {
        use DriverValue as V;
        let param: Param = match element.name() {
            "bool" => Box::new(elements(items, element, |v| match v {
                V::Bool(b) => Some(*b),
                _ => None,
            })?),
            "int2" => Box::new(elements(items, element, |v| match v {
                V::Integer(i) => i16::try_from(*i).ok(),
                _ => None,
            })?),
            "int4" => Box::new(elements(items, element, |v| match v {
                V::Integer(i) => i32::try_from(*i).ok(),
                _ => None,
            })?),
            "int8" => Box::new(elements(items, element, |v| match v {
                V::Integer(i) => Some(*i),
                _ => None,
            })?),
            "float4" => Box::new(elements(items, element, |v| match v {
                V::Real(f) => Some(*f as f32),
                V::Integer(i) => Some(*i as f32),
                _ => None,
            })?),
            "float8" => Box::new(elements(items, element, |v| match v {
                V::Real(f) => Some(*f),
                V::Integer(i) => Some(*i as f64),
                _ => None,
            })?),
            "bytea" => Box::new(elements(items, element, |v| match v {
                V::Blob(b) => Some(b.clone()),
                _ => None,
            })?),
            _ if is_textual(element) => Box::new(elements(items, element, |v| match v {
                V::Text(s) => Some(s.clone()),
                _ => None,
            })?),
            other => {
                return Err(DriverError::new(format!(
                    "arrays of `{other}` are not supported; wrap the value in PgParam"
                )))
            }
        };
        Ok(param)
    }

    fn scalar<T>(
        row: &Row,
        i: usize,
        wrap: impl Fn(T) -> DriverValue,
    ) -> Result<DriverValue, tokio_postgres::Error>
    where
        T: for<'b> FromSql<'b>,
    {
        Ok(row
            .try_get::<_, Option<T>>(i)?
            .map_or(DriverValue::Null, wrap))
    }

    fn array<T>(
        row: &Row,
        i: usize,
        wrap: impl Fn(T) -> DriverValue,
    ) -> Result<DriverValue, tokio_postgres::Error>
    where
        T: for<'b> FromSql<'b>,
    {
        Ok(match row.try_get::<_, Option<Vec<Option<T>>>>(i)? {
            None => DriverValue::Null,
            Some(items) => DriverValue::Array(
                items
                    .into_iter()
                    .map(|item| item.map_or(DriverValue::Null, &wrap))
                    .collect(),
            ),
        })
    }

    fn opaque(row: &Row, i: usize) -> Result<DriverValue, tokio_postgres::Error> {
        scalar::<PgRaw>(row, i, |raw| DriverValue::Opaque(Object::new(raw)))
    }

    /// Decode column `i` (0-based) of `row`.
    fn read_column(row: &Row, i: usize) -> Result<DriverValue, tokio_postgres::Error> {
        use DriverValue as V;
        let ty = row.columns()[i].type_();
        if let Kind::Array(element) = ty.kind() {
            return match element.name() {
                "bool" => array::<bool>(row, i, V::Bool),
                "int2" => array::<i16>(row, i, |v| V::Integer(v.into())),
                "int4" => array::<i32>(row, i, |v| V::Integer(v.into())),
                "int8" => array::<i64>(row, i, V::Integer),
                "float4" => array::<f32>(row, i, |v| V::Real(v.into())),
                "float8" => array::<f64>(row, i, V::Real),
                "bytea" => array::<Vec<u8>>(row, i, V::Blob),
                _ if is_textual(element) => array::<String>(row, i, V::Text),
                _ => opaque(row, i),
            };
        }
        match ty.name() {
            "bool" => scalar::<bool>(row, i, V::Bool),
            "int2" => scalar::<i16>(row, i, |v| V::Integer(v.into())),
            "int4" => scalar::<i32>(row, i, |v| V::Integer(v.into())),
            "int8" => scalar::<i64>(row, i, V::Integer),
            "oid" => scalar::<u32>(row, i, |v| V::Integer(v.into())),
            "float4" => scalar::<f32>(row, i, |v| V::Real(v.into())),
            "float8" => scalar::<f64>(row, i, V::Real),
            "bytea" => scalar::<Vec<u8>>(row, i, V::Blob),
            _ if is_textual(ty) => scalar::<String>(row, i, V::Text),
            _ => opaque(row, i),
        }
    }

    fn metadata_of(statement: &Statement) -> ResultMetadata {
        ResultMetadata::new(
            statement
                .columns()
                .iter()
                .map(|c| ColumnMeta::new(c.name(), c.type_().name()))
                .collect(),
        )
    }

    /// Parse the output of `SHOW default_transaction_isolation`.
    pub(crate) fn parse_isolation(shown: &str) -> DriverResult<IsolationLevel> {
        shown
            .trim()
            .replace(' ', "-")
            .parse()
            .map_err(DriverError::from_source)
    }

    fn isolation_sql(level: IsolationLevel) -> DriverResult<&'static str> {
        Ok(match level {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::None => {
                return Err(DriverError::new(
                    "postgres cannot run without transactions (isolation `none`)",
                ))
            }
        })
    }

    /// Connects over TCP without TLS.
    ///
    /// Spec fields map onto `tokio_postgres::Config`: `host` (default
    /// `localhost`), `port`, `name` as database, `user` (default `postgres`),
    /// `password`. Recognised `params`: `connect-timeout` (seconds),
    /// `application-name`, `options`.
    #[derive(Clone, Copy, Debug, Default)]
    pub struct TokioPostgresDriver;

    impl TokioPostgresDriver {
        pub fn new() -> Self {
            Self
        }

        /// Register under every name in [`DRIVER_NAMES`].
        pub fn register() {
            for name in DRIVER_NAMES {
                register_driver(name, Arc::new(TokioPostgresDriver));
            }
        }

        pub(crate) fn config(spec: &ConnectionSpec) -> DriverResult<tokio_postgres::Config> {
            let mut config = tokio_postgres::Config::new();
            config
                .host(spec.host.as_deref().unwrap_or("localhost"))
                .port(spec.port.unwrap_or(5432))
                .user(spec.user.as_deref().unwrap_or("postgres"));
            if let Some(name) = spec.name.as_deref().filter(|n| !n.is_empty()) {
                config.dbname(name);
            }
            if let Some(password) = &spec.password {
                config.password(password);
            }
            if let Some(secs) = spec.params.get("connect-timeout") {
                let secs = secs.parse::<u64>().map_err(|e| {
                    DriverError::with_source(format!("invalid connect-timeout `{secs}`"), e)
                })?;
                config.connect_timeout(Duration::from_secs(secs));
            }
            if let Some(app) = spec.params.get("application-name") {
                config.application_name(app);
            }
            if let Some(options) = spec.params.get("options") {
                config.options(options);
            }
            Ok(config)
        }
    }

    impl Driver for TokioPostgresDriver {
        fn connect(&self, spec: &ConnectionSpec) -> DriverResult<Box<dyn RawConnection>> {
            let config = Self::config(spec)?;
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| DriverError::with_source("failed to start postgres runtime", e))?;
            let (client, connection) = rt
                .block_on(config.connect(NoTls))
                .map_err(|e| DriverError::with_source("failed to connect to postgres", e))?;
            // The connection object must be spawned to process network events.
            rt.spawn(async move {
                let outcome = connection.await;
                #[cfg(feature = "tracing")]
                {
                    if let Err(e) = &outcome {
                        warn!(error = %e, "postgres connection error");
                    }
                }
                drop(outcome);
            });
            #[cfg(feature = "tracing")]
            debug!(host = ?spec.host, name = ?spec.name, "opened postgres connection");
            Ok(Box::new(PgConnection {
                session: Arc::new(Session {
                    rt,
                    client: Mutex::new(Some(Arc::new(client))),
                    state: Mutex::new(SessionState::default()),
                }),
            }))
        }
    }

    #[derive(Default)]
    struct SessionState {
        manual: bool,
        open: bool,
        /// A statement failed inside the open transaction. The server now
        /// refuses further work and turns COMMIT into ROLLBACK.
        aborted: bool,
        savepoints: usize,
    }

    struct Session {
        rt: tokio::runtime::Runtime,
        client: Mutex<Option<Arc<Client>>>,
        state: Mutex<SessionState>,
    }

    impl Session {
        fn client(&self) -> DriverResult<Arc<Client>> {
            lock(&self.client)
                .clone()
                .ok_or_else(|| DriverError::new("postgres connection is closed"))
        }

        fn control(&self, client: &Client, sql: &str) -> DriverResult<()> {
            let result = self
                .rt
                .block_on(client.batch_execute(sql))
                .map_err(DriverError::from_source);
            self.track(result)
        }

        /// Note a failure inside an open transaction.
        fn track<T>(&self, result: DriverResult<T>) -> DriverResult<T> {
            if result.is_err() {
                let mut state = lock(&self.state);
                if state.open {
                    state.aborted = true;
                }
            }
            result
        }

        /// Commit the open transaction, or roll it back and fail if the
        /// server already aborted it.
        fn commit_open(&self, client: &Client, aborted: bool) -> DriverResult<()> {
            if aborted {
                self.control(client, "ROLLBACK")?;
                return Err(DriverError::new(
                    "transaction was aborted by a failed statement and has been rolled back",
                ));
            }
            self.control(client, "COMMIT")
        }

        fn show(&self, setting: &str) -> DriverResult<String> {
            let client = self.client()?;
            let sql = format!("SHOW {setting}");
            self.rt
                .block_on(client.query_one(sql.as_str(), &[]))
                .and_then(|row| row.try_get::<_, String>(0))
                .map_err(DriverError::from_source)
        }

        fn begin_if_manual(&self, client: &Client) -> DriverResult<()> {
            let needs_begin = {
                let state = lock(&self.state);
                state.manual && !state.open
            };
            if needs_begin {
                self.control(client, "BEGIN")?;
                lock(&self.state).open = true;
            }
            Ok(())
        }

        fn prepare(&self, sql: &str) -> DriverResult<Statement> {
            let client = self.client()?;
            let result = self
                .rt
                .block_on(client.prepare(&positional_placeholders(sql)))
                .map_err(DriverError::from_source);
            self.track(result)
        }

        fn execute(&self, statement: &Statement, params: &[Param]) -> DriverResult<u64> {
            let start = Instant::now();
            let client = self.client()?;
            self.begin_if_manual(&client)?;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let result = self.track(
                self.rt
                    .block_on(client.execute(statement, &refs))
                    .map_err(DriverError::from_source),
            );
            obs_record(
                "execute",
                start,
                result.as_ref().map_or(0, |n| *n as usize),
                result.is_ok(),
            );
            result
        }

        fn query(&self, statement: &Statement, params: &[Param]) -> DriverResult<RowBuffer> {
            let start = Instant::now();
            let client = self.client()?;
            self.begin_if_manual(&client)?;
            let refs: Vec<&(dyn ToSql + Sync)> = params
                .iter()
                .map(|p| p.as_ref() as &(dyn ToSql + Sync))
                .collect();
            let fetched = self.track(
                self.rt
                    .block_on(client.query(statement, &refs))
                    .map_err(DriverError::from_source),
            );
            // Decoding failures are local and leave the transaction usable.
            let result = fetched.and_then(|rows| {
                rows.iter()
                    .map(|row| {
                        (0..row.len())
                            .map(|i| read_column(row, i))
                            .collect::<Result<Vec<_>, _>>()
                    })
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(DriverError::from_source)
            });
            obs_record(
                "query",
                start,
                result.as_ref().map_or(0, Vec::len),
                result.is_ok(),
            );
            Ok(RowBuffer::new(metadata_of(statement), result?))
        }

        fn end_transaction(&self, commit: bool) -> DriverResult<()> {
            let client = self.client()?;
            let (open, aborted) = {
                let mut state = lock(&self.state);
                if !state.manual {
                    return Err(DriverError::new(format!(
                        "cannot {} while autocommit is enabled",
                        if commit { "commit" } else { "rollback" }
                    )));
                }
                state.savepoints = 0;
                (
                    std::mem::take(&mut state.open),
                    std::mem::take(&mut state.aborted),
                )
            };
            match (open, commit) {
                (false, _) => Ok(()),
                (true, true) => self.commit_open(&client, aborted),
                (true, false) => self.control(&client, "ROLLBACK"),
            }
        }
    }

    struct PgConnection {
        session: Arc<Session>,
    }

    impl RawConnection for PgConnection {
        fn prepare(&self, sql: &str, keys: &GeneratedKeys) -> DriverResult<Box<dyn RawStatement>> {
            let statement = self.session.prepare(&keys.rewrite_returning(sql))?;
            Ok(Box::new(PgStatement {
                session: Arc::clone(&self.session),
                slots: vec![None; statement.params().len()],
                statement,
                keys: keys.clone(),
                batch: Vec::new(),
                generated: None,
            }))
        }

        fn execute(&self, sql: &str) -> DriverResult<u64> {
            let start = Instant::now();
            let client = self.session.client()?;
            self.session.begin_if_manual(&client)?;
            let result = self.session.track(
                self.session
                    .rt
                    .block_on(client.execute(sql, &[]))
                    .map_err(DriverError::from_source),
            );
            obs_record(
                "execute",
                start,
                result.as_ref().map_or(0, |n| *n as usize),
                result.is_ok(),
            );
            result
        }

        fn auto_commit(&self) -> DriverResult<bool> {
            self.session.client()?;
            Ok(!lock(&self.session.state).manual)
        }

        fn set_auto_commit(&self, enabled: bool) -> DriverResult<()> {
            let client = self.session.client()?;
            let (commit, aborted) = {
                let mut state = lock(&self.session.state);
                let commit = enabled && state.manual && state.open;
                let aborted = commit && state.aborted;
                state.manual = !enabled;
                if enabled {
                    state.open = false;
                    state.aborted = false;
                    state.savepoints = 0;
                }
                (commit, aborted)
            };
            // Re-enabling autocommit commits whatever is pending.
            if commit {
                self.session.commit_open(&client, aborted)?;
            }
            Ok(())
        }

        fn isolation(&self) -> DriverResult<IsolationLevel> {
            parse_isolation(&self.session.show("default_transaction_isolation")?)
        }

        fn set_isolation(&self, level: IsolationLevel) -> DriverResult<()> {
            let client = self.session.client()?;
            self.session.control(
                &client,
                &format!(
                    "SET SESSION CHARACTERISTICS AS TRANSACTION ISOLATION LEVEL {}",
                    isolation_sql(level)?
                ),
            )
        }

        fn is_read_only(&self) -> DriverResult<bool> {
            Ok(self.session.show("default_transaction_read_only")? == "on")
        }

        fn set_read_only(&self, read_only: bool) -> DriverResult<()> {
            let client = self.session.client()?;
            let mode = if read_only { "READ ONLY" } else { "READ WRITE" };
            self.session.control(
                &client,
                &format!("SET SESSION CHARACTERISTICS AS TRANSACTION {mode}"),
            )
        }

        fn commit(&self) -> DriverResult<()> {
            self.session.end_transaction(true)
        }

        fn rollback(&self) -> DriverResult<()> {
            self.session.end_transaction(false)
        }

        fn set_savepoint(&self) -> DriverResult<Savepoint> {
            let client = self.session.client()?;
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
            self.session.begin_if_manual(&client)?;
            self.session
                .control(&client, &format!("SAVEPOINT {name}"))?;
            Ok(Savepoint::new(name))
        }

        fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
            let client = self.session.client()?;
            self.session.control(
                &client,
                &format!("ROLLBACK TO SAVEPOINT {}", savepoint.name()),
            )?;
            // The server resumes the transaction from the savepoint.
            lock(&self.session.state).aborted = false;
            Ok(())
        }

        fn release_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
            let client = self.session.client()?;
            self.session
                .control(&client, &format!("RELEASE SAVEPOINT {}", savepoint.name()))
        }

        fn close(&self) -> DriverResult<()> {
            let client = lock(&self.session.client)
                .take()
                .ok_or_else(|| DriverError::new("postgres connection already closed"))?;
            let open = {
                let mut state = lock(&self.session.state);
                state.aborted = false;
                std::mem::take(&mut state.open)
            };
            // Pending work is discarded, never committed.
            if open {
                self.session.control(&client, "ROLLBACK")?;
            }
            #[cfg(feature = "tracing")]
            debug!("closed postgres connection");
            Ok(())
        }
    }

    struct PgStatement {
        session: Arc<Session>,
        statement: Statement,
        keys: GeneratedKeys,
        slots: Vec<Option<DriverValue>>,
        batch: Vec<Vec<DriverValue>>,
        generated: Option<RowBuffer>,
    }

    impl PgStatement {
        fn bound(&self) -> DriverResult<Vec<DriverValue>> {
            self.slots
                .iter()
                .enumerate()
                .map(|(i, slot)| {
                    slot.clone()
                        .ok_or_else(|| DriverError::new(format!("parameter {} is not bound", i + 1)))
                })
                .collect()
        }

        fn encode(&self, values: Vec<DriverValue>) -> DriverResult<Vec<Param>> {
            values
                .into_iter()
                .zip(self.statement.params())
                .map(|(value, ty)| to_param(value, ty))
                .collect()
        }

        fn run(&mut self, values: Vec<DriverValue>) -> DriverResult<u64> {
            let params = self.encode(values)?;
            if self.keys.is_requested() {
                let mut rows = self.session.query(&self.statement, &params)?;
                let mut count = 0;
                let mut buffered = Vec::new();
                while let Some(row) = rows.next_row()? {
                    count += 1;
                    buffered.push(row);
                }
                self.generated = Some(RowBuffer::new(metadata_of(&self.statement), buffered));
                Ok(count)
            } else {
                self.session.execute(&self.statement, &params)
            }
        }
    }

    impl RawStatement for PgStatement {
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
            *slot = Some(value);
            Ok(())
        }

        fn clear_parameters(&mut self) {
            self.slots.iter_mut().for_each(|slot| *slot = None);
        }

        fn add_batch(&mut self) -> DriverResult<()> {
            let values = self.bound()?;
            self.batch.push(values);
            Ok(())
        }

        fn execute_batch(&mut self) -> DriverResult<Vec<u64>> {
            let start = Instant::now();
            let groups = std::mem::take(&mut self.batch);
            let size = groups.len();
            let result = groups
                .into_iter()
                .map(|values| self.run(values))
                .collect::<DriverResult<Vec<u64>>>();
            obs_record("execute_batch", start, size, result.is_ok());
            result
        }

        fn execute_update(&mut self) -> DriverResult<u64> {
            let values = self.bound()?;
            self.run(values)
        }

        fn execute_query(&mut self) -> DriverResult<Box<dyn ResultSet>> {
            let params = self.encode(self.bound()?)?;
            Ok(Box::new(self.session.query(&self.statement, &params)?))
        }

        fn generated_keys(&mut self) -> DriverResult<Box<dyn ResultSet>> {
            Ok(Box::new(self.generated.take().unwrap_or_default()))
        }
    }
}

#[cfg(feature = "postgres-backend")]
pub use backend::{positional_placeholders, PgParam, PgRaw, TokioPostgresDriver, DRIVER_NAMES};
