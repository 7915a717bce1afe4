//! Statement execution.
//!
//! Every entry point accepts any [`SqlDescriptor`], normalizes it once, binds
//! parameters through [`bind_parameter`] and maps every column through
//! [`from_driver_type`].

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use tracing::trace;

use crate::connection::Connection;
use crate::driver::{GeneratedKeys, RawStatement, ResultMetadata, ResultSet};
use crate::types::{bind_parameter, from_driver_type};
use crate::value::{DriverValue, Value};
use crate::{Error, Result};

/// Column label to value, in result column order.
pub type Record = IndexMap<String, Value>;

/// A normalized SQL descriptor.
pub enum Sql<'a> {
    /// Plain statement without parameters.
    Text(Cow<'a, str>),
    /// Several plain statements executed as one batch.
    Batch(Vec<Cow<'a, str>>),
    /// Statement with its positional parameters.
    Params(Cow<'a, str>, Vec<Value>),
    /// A statement prepared earlier with [`prepare`].
    Prepared(&'a mut PreparedStatement),
}

impl fmt::Debug for Sql<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sql::Text(sql) => f.debug_tuple("Text").field(sql).finish(),
            Sql::Batch(list) => f.debug_tuple("Batch").field(list).finish(),
            Sql::Params(sql, params) => f.debug_tuple("Params").field(sql).field(params).finish(),
            Sql::Prepared(stmt) => f.debug_tuple("Prepared").field(&stmt.sql).finish(),
        }
    }
}

/// Anything that can describe a statement. Implement it for your own types
/// to hand them straight to [`execute`] or [`query`].
pub trait SqlDescriptor<'a> {
    fn normalize(self) -> Result<Sql<'a>>;
}

fn checked_text<'a>(sql: Cow<'a, str>) -> Result<Cow<'a, str>> {
    if sql.trim().is_empty() {
        return Err(Error::argument("SQL descriptor has no statement text"));
    }
    Ok(sql)
}

impl<'a> SqlDescriptor<'a> for Sql<'a> {
    fn normalize(self) -> Result<Sql<'a>> {
        Ok(match self {
            Sql::Text(sql) => Sql::Text(checked_text(sql)?),
            Sql::Params(sql, params) => Sql::Params(checked_text(sql)?, params),
            Sql::Batch(list) => {
                if list.is_empty() {
                    return Err(Error::argument("batch descriptor has no statements"));
                }
                Sql::Batch(list.into_iter().map(checked_text).collect::<Result<_>>()?)
            }
            prepared @ Sql::Prepared(_) => prepared,
        })
    }
}

impl<'a> SqlDescriptor<'a> for &'a str {
    fn normalize(self) -> Result<Sql<'a>> {
        Sql::Text(Cow::Borrowed(self)).normalize()
    }
}

impl<'a> SqlDescriptor<'a> for &'a String {
    fn normalize(self) -> Result<Sql<'a>> {
        Sql::Text(Cow::Borrowed(self.as_str())).normalize()
    }
}

impl<'a> SqlDescriptor<'a> for String {
    fn normalize(self) -> Result<Sql<'a>> {
        Sql::Text(Cow::Owned(self)).normalize()
    }
}

impl<'a> SqlDescriptor<'a> for (&'a str, Vec<Value>) {
    fn normalize(self) -> Result<Sql<'a>> {
        Sql::Params(Cow::Borrowed(self.0), self.1).normalize()
    }
}

impl<'a> SqlDescriptor<'a> for (String, Vec<Value>) {
    fn normalize(self) -> Result<Sql<'a>> {
        Sql::Params(Cow::Owned(self.0), self.1).normalize()
    }
}

/// `[sql, param, ...]`: the first element must be the statement text.
impl<'a> SqlDescriptor<'a> for Vec<Value> {
    fn normalize(self) -> Result<Sql<'a>> {
        let mut items = self.into_iter();
        match items.next() {
            Some(Value::Text(sql)) => Sql::Params(Cow::Owned(sql), items.collect()).normalize(),
            Some(other) => Err(Error::argument(format!(
                "SQL descriptor must start with statement text, found {other:?}"
            ))),
            None => Err(Error::argument("empty SQL descriptor")),
        }
    }
}

impl<'a> SqlDescriptor<'a> for Vec<&'a str> {
    fn normalize(self) -> Result<Sql<'a>> {
        Sql::Batch(self.into_iter().map(Cow::Borrowed).collect()).normalize()
    }
}

impl<'a> SqlDescriptor<'a> for &'a [&'a str] {
    fn normalize(self) -> Result<Sql<'a>> {
        Sql::Batch(self.iter().map(|s| Cow::Borrowed(*s)).collect()).normalize()
    }
}

impl<'a> SqlDescriptor<'a> for &'a mut PreparedStatement {
    fn normalize(self) -> Result<Sql<'a>> {
        Ok(Sql::Prepared(self))
    }
}

/// Which generated rows `execute_prepared` should return instead of counts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Returning {
    All,
    Columns(Vec<String>),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub returning: Option<Returning>,
}

impl ExecuteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn returning_all(mut self) -> Self {
        self.returning = Some(Returning::All);
        self
    }

    pub fn returning<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.returning = Some(Returning::Columns(columns.into_iter().map(Into::into).collect()));
        self
    }

    fn generated_keys(&self) -> GeneratedKeys {
        match &self.returning {
            None => GeneratedKeys::None,
            Some(Returning::All) => GeneratedKeys::All,
            Some(Returning::Columns(cols)) => GeneratedKeys::Columns(cols.clone()),
        }
    }
}

/// Outcome of [`execute_prepared`].
#[derive(Clone, Debug, PartialEq)]
pub enum Executed {
    /// One affected-row count per parameter group.
    Counts(Vec<u64>),
    /// Generated/returned rows of every group, in group order.
    Rows(Vec<Record>),
}

impl Executed {
    pub fn counts(&self) -> Option<&[u64]> {
        match self {
            Executed::Counts(c) => Some(c),
            Executed::Rows(_) => None,
        }
    }

    pub fn rows(&self) -> Option<&[Record]> {
        match self {
            Executed::Rows(r) => Some(r),
            Executed::Counts(_) => None,
        }
    }
}

type Identifiers = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// How query results are shaped.
#[derive(Clone)]
pub struct QueryOptions {
    /// Maps a driver column label to the record key. Lower-cases by default.
    ///
    /// When two columns map to the same key, later ones get `_2`, `_3`, ...
    /// appended so no value is dropped.
    pub identifiers: Identifiers,
    /// Return positional rows instead of keyed records.
    pub as_rows: bool,
    /// Stop reading after this many rows.
    pub max_rows: Option<usize>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            identifiers: Arc::new(|label: &str| label.to_lowercase()),
            as_rows: false,
            max_rows: None,
        }
    }
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("as_rows", &self.as_rows)
            .field("max_rows", &self.max_rows)
            .finish_non_exhaustive()
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep column labels exactly as the driver reports them.
    pub fn preserve_case() -> Self {
        Self::default().identifiers(str::to_string)
    }

    pub fn identifiers<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.identifiers = Arc::new(f);
        self
    }

    pub fn as_rows(mut self, as_rows: bool) -> Self {
        self.as_rows = as_rows;
        self
    }

    pub fn max_rows(mut self, max_rows: usize) -> Self {
        self.max_rows = Some(max_rows);
        self
    }
}

/// One mapped result row.
#[derive(Clone, Debug, PartialEq)]
pub enum Row {
    Record(Record),
    Values(Vec<Value>),
}

impl Row {
    /// Column value by record key, or by 0-based position for positional rows.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Row::Record(record) => record.get(key),
            Row::Values(values) => key.parse::<usize>().ok().and_then(|i| values.get(i)),
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Row::Record(record) => Some(record),
            Row::Values(_) => None,
        }
    }

    pub fn as_values(&self) -> Option<&[Value]> {
        match self {
            Row::Values(values) => Some(values),
            Row::Record(_) => None,
        }
    }

    pub fn into_record(self) -> Option<Record> {
        match self {
            Row::Record(record) => Some(record),
            Row::Values(_) => None,
        }
    }
}

/// A statement prepared once and reusable across executions on its connection.
pub struct PreparedStatement {
    sql: String,
    stmt: Box<dyn RawStatement>,
    params: Vec<Value>,
    keys: GeneratedKeys,
    session: usize,
}

impl fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("sql", &self.sql)
            .field("params", &self.params)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl PreparedStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn parameter_count(&self) -> usize {
        self.stmt.parameter_count()
    }

    /// Parameters bound at preparation time.
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn generated_keys(&self) -> &GeneratedKeys {
        &self.keys
    }

    fn check_session(&self, conn: &Connection) -> Result<()> {
        if self.session != conn.session_id() {
            return Err(Error::argument(
                "prepared statement belongs to a different connection",
            ));
        }
        // Fails once the connection is closed.
        conn.raw()?;
        Ok(())
    }

    /// Rebind the preparation-time parameters, if any.
    fn rebind(&mut self, conn: &Connection) -> Result<()> {
        if self.params.is_empty() {
            return Ok(());
        }
        self.stmt.clear_parameters();
        bind_all(conn, self.stmt.as_mut(), &self.params)
    }
}

fn bind_all(conn: &Connection, stmt: &mut dyn RawStatement, params: &[Value]) -> Result<()> {
    let expected = stmt.parameter_count();
    if params.len() != expected {
        return Err(Error::argument(format!(
            "statement takes {expected} parameter(s), {} given",
            params.len()
        )));
    }
    for (i, value) in params.iter().enumerate() {
        bind_parameter(value, conn, stmt, i + 1)?;
    }
    Ok(())
}

fn prepare_raw(conn: &Connection, sql: &str, keys: &GeneratedKeys) -> Result<Box<dyn RawStatement>> {
    conn.raw()?.prepare(sql, keys).map_err(Error::driver)
}

/// Execute a descriptor as plain or batch statement(s); one count per statement.
pub fn execute<'a>(conn: &Connection, sql: impl SqlDescriptor<'a>) -> Result<Vec<u64>> {
    match sql.normalize()? {
        Sql::Text(text) => {
            trace!(sql = %text, "execute");
            Ok(vec![conn.raw()?.execute(&text).map_err(Error::driver)?])
        }
        Sql::Batch(list) => {
            trace!(statements = list.len(), "execute batch");
            let refs: Vec<&str> = list.iter().map(|s| s.as_ref()).collect();
            conn.raw()?.execute_batch(&refs).map_err(Error::driver)
        }
        Sql::Params(text, params) => {
            trace!(sql = %text, params = params.len(), "execute");
            let mut stmt = prepare_raw(conn, &text, &GeneratedKeys::None)?;
            bind_all(conn, stmt.as_mut(), &params)?;
            Ok(vec![stmt.execute_update().map_err(Error::driver)?])
        }
        Sql::Prepared(prepared) => {
            prepared.check_session(conn)?;
            prepared.rebind(conn)?;
            Ok(vec![prepared.stmt.execute_update().map_err(Error::driver)?])
        }
    }
}

/// Execute one prepared statement once per parameter group.
///
/// With `opts.returning` set, the generated/returned rows of every group are
/// collected instead of counts. No groups means a single execution with the
/// descriptor's own parameters (or none). A [`PreparedStatement`] keeps the
/// generated keys it was prepared with; asking it for other columns is an
/// argument error.
pub fn execute_prepared<'a>(
    conn: &Connection,
    sql: impl SqlDescriptor<'a>,
    groups: &[Vec<Value>],
    opts: &ExecuteOptions,
) -> Result<Executed> {
    check_group_shapes(groups)?;
    let keys = opts.generated_keys();
    match sql.normalize()? {
        Sql::Batch(_) => Err(Error::argument(
            "a batch descriptor cannot be executed as a prepared statement",
        )),
        Sql::Params(_, _) if !groups.is_empty() => Err(Error::argument(
            "parameter groups cannot be combined with a descriptor that carries its own parameters",
        )),
        Sql::Params(text, params) => {
            let mut stmt = prepare_raw(conn, &text, &keys)?;
            run_groups(conn, stmt.as_mut(), std::slice::from_ref(&params), &keys)
        }
        Sql::Text(text) => {
            let mut stmt = prepare_raw(conn, &text, &keys)?;
            if groups.is_empty() {
                run_groups(conn, stmt.as_mut(), &[Vec::new()], &keys)
            } else {
                run_groups(conn, stmt.as_mut(), groups, &keys)
            }
        }
        Sql::Prepared(prepared) => {
            prepared.check_session(conn)?;
            let keys = returning_for_prepared(&prepared.keys, opts.returning.as_ref())?;
            let own = [prepared.params.clone()];
            let groups = if groups.is_empty() { &own[..] } else { groups };
            run_groups(conn, prepared.stmt.as_mut(), groups, &keys)
        }
    }
}

/// Generated keys are fixed when a statement is prepared; `returning` may only
/// ask for them, or name the same columns again.
fn returning_for_prepared(
    prepared: &GeneratedKeys,
    returning: Option<&Returning>,
) -> Result<GeneratedKeys> {
    match (returning, prepared) {
        (None, _) => Ok(GeneratedKeys::None),
        (Some(_), GeneratedKeys::None) => Err(Error::argument(
            "`returning` needs a statement prepared with generated keys",
        )),
        (Some(Returning::All), keys) => Ok(keys.clone()),
        (Some(Returning::Columns(wanted)), GeneratedKeys::Columns(cols))
            if wanted.len() == cols.len()
                && wanted
                    .iter()
                    .zip(cols)
                    .all(|(w, c)| w.eq_ignore_ascii_case(c)) =>
        {
            Ok(prepared.clone())
        }
        (Some(Returning::Columns(wanted)), keys) => Err(Error::argument(format!(
            "`returning` columns {wanted:?} differ from the statement's generated keys {keys:?}"
        ))),
    }
}

fn check_group_shapes(groups: &[Vec<Value>]) -> Result<()> {
    if let Some(first) = groups.first() {
        if let Some((i, odd)) = groups
            .iter()
            .enumerate()
            .find(|(_, g)| g.len() != first.len())
        {
            return Err(Error::argument(format!(
                "parameter group {i} has {} value(s), expected {}",
                odd.len(),
                first.len()
            )));
        }
    }
    Ok(())
}

fn run_groups(
    conn: &Connection,
    stmt: &mut dyn RawStatement,
    groups: &[Vec<Value>],
    keys: &GeneratedKeys,
) -> Result<Executed> {
    trace!(groups = groups.len(), returning = keys.is_requested(), "execute prepared");
    if keys.is_requested() {
        let opts = QueryOptions::default();
        let mut records = Vec::new();
        for group in groups {
            stmt.clear_parameters();
            bind_all(conn, stmt, group)?;
            stmt.execute_update().map_err(Error::driver)?;
            let mut rs = stmt.generated_keys().map_err(Error::driver)?;
            while let Some(row) = next_row(conn, rs.as_mut(), &opts)? {
                if let Row::Record(record) = row {
                    records.push(record);
                }
            }
        }
        return Ok(Executed::Rows(records));
    }

    for group in groups {
        stmt.clear_parameters();
        bind_all(conn, stmt, group)?;
        stmt.add_batch().map_err(Error::driver)?;
    }
    Ok(Executed::Counts(stmt.execute_batch().map_err(Error::driver)?))
}

fn open_result_set<'a>(conn: &Connection, sql: impl SqlDescriptor<'a>) -> Result<Box<dyn ResultSet>> {
    match sql.normalize()? {
        Sql::Text(text) => {
            trace!(sql = %text, "query");
            prepare_raw(conn, &text, &GeneratedKeys::None)?
                .execute_query()
                .map_err(Error::driver)
        }
        Sql::Params(text, params) => {
            trace!(sql = %text, params = params.len(), "query");
            let mut stmt = prepare_raw(conn, &text, &GeneratedKeys::None)?;
            bind_all(conn, stmt.as_mut(), &params)?;
            stmt.execute_query().map_err(Error::driver)
        }
        Sql::Batch(_) => Err(Error::argument("a batch descriptor cannot be queried")),
        Sql::Prepared(prepared) => {
            prepared.check_session(conn)?;
            prepared.rebind(conn)?;
            prepared.stmt.execute_query().map_err(Error::driver)
        }
    }
}

fn map_row(
    conn: &Connection,
    meta: &ResultMetadata,
    values: Vec<DriverValue>,
    opts: &QueryOptions,
) -> Result<Row> {
    if opts.as_rows {
        let values = values
            .into_iter()
            .enumerate()
            .map(|(i, v)| from_driver_type(v, conn, meta, i + 1))
            .collect::<Result<Vec<_>>>()?;
        return Ok(Row::Values(values));
    }
    let mut record = Record::with_capacity(values.len());
    for (i, v) in values.into_iter().enumerate() {
        let index = i + 1;
        let label = meta.column_label(index).unwrap_or_default();
        let key = unique_key(&record, (opts.identifiers)(label));
        record.insert(key, from_driver_type(v, conn, meta, index)?);
    }
    Ok(Row::Record(record))
}

fn unique_key(record: &Record, key: String) -> String {
    if !record.contains_key(&key) {
        return key;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{key}_{n}");
        if !record.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn next_row(conn: &Connection, rs: &mut dyn ResultSet, opts: &QueryOptions) -> Result<Option<Row>> {
    match rs.next_row().map_err(Error::driver)? {
        Some(values) => Ok(Some(map_row(conn, rs.metadata(), values, opts)?)),
        None => Ok(None),
    }
}

/// Run a query and map every row eagerly.
pub fn query<'a>(
    conn: &Connection,
    sql: impl SqlDescriptor<'a>,
    opts: &QueryOptions,
) -> Result<Vec<Row>> {
    let mut rs = open_result_set(conn, sql)?;
    let mut rows = Vec::new();
    while opts.max_rows.map_or(true, |max| rows.len() < max) {
        match next_row(conn, rs.as_mut(), opts)? {
            Some(row) => rows.push(row),
            None => break,
        }
    }
    Ok(rows)
}

/// First row of a query, if any.
pub fn fetch_one<'a>(
    conn: &Connection,
    sql: impl SqlDescriptor<'a>,
    opts: &QueryOptions,
) -> Result<Option<Row>> {
    let mut rs = open_result_set(conn, sql)?;
    next_row(conn, rs.as_mut(), opts)
}

/// Lazily mapped rows backed by an open result set.
///
/// Only available inside a transaction; the borrow of the scope's connection
/// keeps the cursor from outliving it.
pub struct Cursor<'c> {
    conn: &'c Connection,
    rs: Box<dyn ResultSet>,
    opts: QueryOptions,
    yielded: usize,
    done: bool,
}

impl fmt::Debug for Cursor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("columns", self.rs.metadata())
            .field("yielded", &self.yielded)
            .field("done", &self.done)
            .finish()
    }
}

impl Cursor<'_> {
    pub fn metadata(&self) -> &ResultMetadata {
        self.rs.metadata()
    }
}

impl Iterator for Cursor<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.opts.max_rows.map_or(false, |max| self.yielded >= max) {
            return None;
        }
        match next_row(self.conn, self.rs.as_mut(), &self.opts) {
            Ok(Some(row)) => {
                self.yielded += 1;
                Some(Ok(row))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Open a lazy cursor over a query. Requires an active transaction.
pub fn cursor<'c, 'a>(
    conn: &'c Connection,
    sql: impl SqlDescriptor<'a>,
    opts: &QueryOptions,
) -> Result<Cursor<'c>> {
    if !conn.in_transaction() {
        return Err(Error::argument("lazy cursors are only available inside a transaction"));
    }
    let rs = open_result_set(conn, sql)?;
    Ok(Cursor {
        conn,
        rs,
        opts: opts.clone(),
        yielded: 0,
        done: false,
    })
}

/// Prepare a descriptor for reuse. Inline parameters are bound once here.
pub fn prepare<'a>(conn: &Connection, sql: impl SqlDescriptor<'a>) -> Result<PreparedStatement> {
    prepare_with(conn, sql, &ExecuteOptions::default())
}

/// Prepare a descriptor; `opts.returning` prepares it for generated keys.
pub fn prepare_with<'a>(
    conn: &Connection,
    sql: impl SqlDescriptor<'a>,
    opts: &ExecuteOptions,
) -> Result<PreparedStatement> {
    let (text, params) = match sql.normalize()? {
        Sql::Text(text) => (text, Vec::new()),
        Sql::Params(text, params) => (text, params),
        Sql::Batch(_) => return Err(Error::argument("a batch descriptor cannot be prepared")),
        Sql::Prepared(_) => return Err(Error::argument("statement is already prepared")),
    };
    let keys = opts.generated_keys();
    let mut stmt = prepare_raw(conn, &text, &keys)?;
    if !params.is_empty() {
        bind_all(conn, stmt.as_mut(), &params)?;
    }
    Ok(PreparedStatement {
        sql: text.into_owned(),
        stmt,
        params,
        keys,
        session: conn.session_id(),
    })
}

impl Connection {
    /// See [`execute`].
    pub fn execute<'a>(&self, sql: impl SqlDescriptor<'a>) -> Result<Vec<u64>> {
        execute(self, sql)
    }

    /// See [`execute_prepared`].
    pub fn execute_prepared<'a>(
        &self,
        sql: impl SqlDescriptor<'a>,
        groups: &[Vec<Value>],
        opts: &ExecuteOptions,
    ) -> Result<Executed> {
        execute_prepared(self, sql, groups, opts)
    }

    /// See [`query`].
    pub fn query<'a>(&self, sql: impl SqlDescriptor<'a>, opts: &QueryOptions) -> Result<Vec<Row>> {
        query(self, sql, opts)
    }

    /// See [`fetch_one`].
    pub fn fetch_one<'a>(
        &self,
        sql: impl SqlDescriptor<'a>,
        opts: &QueryOptions,
    ) -> Result<Option<Row>> {
        fetch_one(self, sql, opts)
    }

    /// See [`cursor`].
    pub fn cursor<'a>(&self, sql: impl SqlDescriptor<'a>, opts: &QueryOptions) -> Result<Cursor<'_>> {
        cursor(self, sql, opts)
    }

    /// See [`prepare`].
    pub fn prepare<'a>(&self, sql: impl SqlDescriptor<'a>) -> Result<PreparedStatement> {
        prepare(self, sql)
    }

    /// See [`prepare_with`].
    pub fn prepare_with<'a>(
        &self,
        sql: impl SqlDescriptor<'a>,
        opts: &ExecuteOptions,
    ) -> Result<PreparedStatement> {
        prepare_with(self, sql, opts)
    }
}
