//! A recording in-memory driver.
//!
//! It models a single database session holding one table. Every connection
//! opened through one [`MemoryDriver`] shares that session, which keeps the
//! observable driver state (autocommit, isolation, savepoints, rows) in one
//! place for assertions through a [`MemoryProbe`].
//!
//! Only a small SQL subset is understood:
//! `CREATE`/`DROP` (ignored), `INSERT INTO t(cols) VALUES (...)`,
//! `SELECT cols|*|COUNT(*) [AS alias] FROM t [WHERE col = x] [ORDER BY ...]`
//! and `DELETE FROM t [WHERE col = x]`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sqlscope_core::{
    register_driver, ColumnMeta, ConnectionSpec, Driver, DriverError, DriverResult, DriverValue,
    GeneratedKeys, IsolationLevel, RawConnection, RawStatement, ResultMetadata, ResultSet,
    RowBuffer, Savepoint,
};

/// One driver-level call, recorded after it succeeded.
#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    Connect,
    Prepare(String),
    Execute(String),
    ExecuteUpdate,
    ExecuteBatch(usize),
    ExecuteQuery,
    SetAutoCommit(bool),
    SetIsolation(IsolationLevel),
    SetReadOnly(bool),
    Commit,
    Rollback,
    Savepoint(String),
    RollbackToSavepoint(String),
    ReleaseSavepoint(String),
    CreateArray(String),
    Close,
}

/// Operations that can be made to fail once with [`MemoryProbe::fail_next`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailPoint {
    Connect,
    Execute,
    SetAutoCommit,
    SetIsolation,
    SetReadOnly,
    Commit,
    Rollback,
    Savepoint,
    RollbackToSavepoint,
    ReleaseSavepoint,
    Close,
}

/// A stored row: generated id plus named values (lower-cased keys).
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub values: BTreeMap<String, DriverValue>,
}

#[derive(Debug)]
struct State {
    auto_commit: bool,
    isolation: IsolationLevel,
    read_only: bool,
    committed: Vec<StoredRow>,
    pending: Option<Vec<StoredRow>>,
    savepoints: Vec<(String, Vec<StoredRow>)>,
    savepoint_seq: usize,
    next_id: i64,
    columns: Vec<String>,
    calls: Vec<Call>,
    failures: Vec<FailPoint>,
    open_handles: usize,
}

impl Default for State {
    fn default() -> Self {
        Self {
            auto_commit: true,
            isolation: IsolationLevel::ReadCommitted,
            read_only: false,
            committed: Vec::new(),
            pending: None,
            savepoints: Vec::new(),
            savepoint_seq: 0,
            next_id: 1,
            columns: Vec::new(),
            calls: Vec::new(),
            failures: Vec::new(),
            open_handles: 0,
        }
    }
}

impl State {
    fn check(&mut self, point: FailPoint) -> DriverResult<()> {
        if let Some(pos) = self.failures.iter().position(|f| *f == point) {
            self.failures.remove(pos);
            return Err(DriverError::new(format!("injected {point:?} failure")));
        }
        Ok(())
    }

    fn ensure_begun(&mut self) {
        if !self.auto_commit && self.pending.is_none() {
            self.pending = Some(self.committed.clone());
        }
    }

    fn visible(&self) -> &[StoredRow] {
        self.pending.as_deref().unwrap_or(&self.committed)
    }

    fn rows_mut(&mut self) -> DriverResult<&mut Vec<StoredRow>> {
        if self.read_only {
            return Err(DriverError::new("attempt to write a readonly database"));
        }
        self.ensure_begun();
        Ok(match self.pending.as_mut() {
            Some(rows) => rows,
            None => &mut self.committed,
        })
    }

    fn end_transaction(&mut self, commit: bool) {
        if let Some(rows) = self.pending.take() {
            if commit {
                self.committed = rows;
            }
        }
        self.savepoints.clear();
    }

    fn require_transaction(&self, what: &str) -> DriverResult<()> {
        if self.auto_commit {
            return Err(DriverError::new(format!(
                "cannot {what} while autocommit is enabled"
            )));
        }
        Ok(())
    }

    fn savepoint_position(&self, savepoint: &Savepoint) -> DriverResult<usize> {
        self.savepoints
            .iter()
            .position(|(name, _)| name == savepoint.name())
            .ok_or_else(|| DriverError::new(format!("no such savepoint: {}", savepoint.name())))
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lock the session for a handle whose connection may have been closed.
fn lock_open<'a>(
    state: &'a Mutex<State>,
    closed: &AtomicBool,
) -> DriverResult<MutexGuard<'a, State>> {
    if closed.load(Ordering::SeqCst) {
        return Err(DriverError::new("connection is closed"));
    }
    Ok(lock(state))
}

/// Driver whose connections all share one in-memory session.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<State>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn probe(&self) -> MemoryProbe {
        MemoryProbe {
            state: Arc::clone(&self.state),
        }
    }

    /// Register a fresh driver under `name` and return its probe.
    pub fn register(name: &str) -> MemoryProbe {
        let driver = MemoryDriver::new();
        let probe = driver.probe();
        register_driver(name, Arc::new(driver));
        probe
    }

    /// A raw connection without going through the registry.
    pub fn raw_connection(&self) -> Box<dyn RawConnection> {
        let mut state = lock(&self.state);
        state.open_handles += 1;
        state.calls.push(Call::Connect);
        Box::new(MemoryConnection {
            state: Arc::clone(&self.state),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

impl Driver for MemoryDriver {
    fn connect(&self, _spec: &ConnectionSpec) -> DriverResult<Box<dyn RawConnection>> {
        lock(&self.state).check(FailPoint::Connect)?;
        Ok(self.raw_connection())
    }
}

/// Read access to the driver state, plus failure injection.
#[derive(Clone)]
pub struct MemoryProbe {
    state: Arc<Mutex<State>>,
}

impl MemoryProbe {
    pub fn calls(&self) -> Vec<Call> {
        lock(&self.state).calls.clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        lock(&self.state).calls.iter().filter(|c| *c == call).count()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    /// Make the next `point` operation fail once.
    pub fn fail_next(&self, point: FailPoint) {
        lock(&self.state).failures.push(point);
    }

    pub fn committed(&self) -> Vec<StoredRow> {
        lock(&self.state).committed.clone()
    }

    /// `name` column of every committed row.
    pub fn committed_names(&self) -> Vec<String> {
        lock(&self.state)
            .committed
            .iter()
            .filter_map(|row| match row.values.get("name") {
                Some(DriverValue::Text(name)) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn in_physical_transaction(&self) -> bool {
        lock(&self.state).pending.is_some()
    }

    pub fn savepoint_names(&self) -> Vec<String> {
        lock(&self.state)
            .savepoints
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn auto_commit(&self) -> bool {
        lock(&self.state).auto_commit
    }

    pub fn isolation(&self) -> IsolationLevel {
        lock(&self.state).isolation
    }

    pub fn read_only(&self) -> bool {
        lock(&self.state).read_only
    }

    pub fn open_handles(&self) -> usize {
        lock(&self.state).open_handles
    }
}

struct MemoryConnection {
    state: Arc<Mutex<State>>,
    /// Shared with prepared statements, which stop working once it is set.
    closed: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn with_state<T>(
        &self,
        point: Option<FailPoint>,
        f: impl FnOnce(&mut State) -> DriverResult<T>,
    ) -> DriverResult<T> {
        let mut state = lock_open(&self.state, &self.closed)?;
        if let Some(point) = point {
            state.check(point)?;
        }
        f(&mut state)
    }
}

impl RawConnection for MemoryConnection {
    fn prepare(&self, sql: &str, keys: &GeneratedKeys) -> DriverResult<Box<dyn RawStatement>> {
        let command = Command::parse(sql)?;
        self.with_state(None, |state| {
            state.calls.push(Call::Prepare(sql.to_string()));
            Ok(())
        })?;
        Ok(Box::new(MemoryStatement {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            params: vec![DriverValue::Null; command.param_count],
            command,
            batches: Vec::new(),
            keys: keys.clone(),
            generated: None,
        }))
    }

    fn execute(&self, sql: &str) -> DriverResult<u64> {
        let command = Command::parse(sql)?;
        if command.param_count > 0 {
            return Err(DriverError::new("statement has unbound parameters"));
        }
        self.with_state(Some(FailPoint::Execute), |state| {
            let (count, _) = command.run_update(state, &[])?;
            state.calls.push(Call::Execute(sql.to_string()));
            Ok(count)
        })
    }

    fn auto_commit(&self) -> DriverResult<bool> {
        self.with_state(None, |state| Ok(state.auto_commit))
    }

    fn set_auto_commit(&self, enabled: bool) -> DriverResult<()> {
        self.with_state(Some(FailPoint::SetAutoCommit), |state| {
            if enabled && !state.auto_commit {
                state.end_transaction(true);
            }
            state.auto_commit = enabled;
            state.calls.push(Call::SetAutoCommit(enabled));
            Ok(())
        })
    }

    fn isolation(&self) -> DriverResult<IsolationLevel> {
        self.with_state(None, |state| Ok(state.isolation))
    }

    fn set_isolation(&self, level: IsolationLevel) -> DriverResult<()> {
        self.with_state(Some(FailPoint::SetIsolation), |state| {
            state.isolation = level;
            state.calls.push(Call::SetIsolation(level));
            Ok(())
        })
    }

    fn is_read_only(&self) -> DriverResult<bool> {
        self.with_state(None, |state| Ok(state.read_only))
    }

    fn set_read_only(&self, read_only: bool) -> DriverResult<()> {
        self.with_state(Some(FailPoint::SetReadOnly), |state| {
            state.read_only = read_only;
            state.calls.push(Call::SetReadOnly(read_only));
            Ok(())
        })
    }

    fn commit(&self) -> DriverResult<()> {
        self.with_state(Some(FailPoint::Commit), |state| {
            state.require_transaction("commit")?;
            state.end_transaction(true);
            state.calls.push(Call::Commit);
            Ok(())
        })
    }

    fn rollback(&self) -> DriverResult<()> {
        self.with_state(Some(FailPoint::Rollback), |state| {
            state.require_transaction("roll back")?;
            state.end_transaction(false);
            state.calls.push(Call::Rollback);
            Ok(())
        })
    }

    fn set_savepoint(&self) -> DriverResult<Savepoint> {
        self.with_state(Some(FailPoint::Savepoint), |state| {
            state.require_transaction("set a savepoint")?;
            state.ensure_begun();
            state.savepoint_seq += 1;
            let name = format!("sp{}", state.savepoint_seq);
            let snapshot = state.visible().to_vec();
            state.savepoints.push((name.clone(), snapshot));
            state.calls.push(Call::Savepoint(name.clone()));
            Ok(Savepoint::new(name))
        })
    }

    fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
        self.with_state(Some(FailPoint::RollbackToSavepoint), |state| {
            let pos = state.savepoint_position(savepoint)?;
            state.savepoints.truncate(pos + 1);
            state.pending = Some(state.savepoints[pos].1.clone());
            state
                .calls
                .push(Call::RollbackToSavepoint(savepoint.name().to_string()));
            Ok(())
        })
    }

    fn release_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
        self.with_state(Some(FailPoint::ReleaseSavepoint), |state| {
            let pos = state.savepoint_position(savepoint)?;
            state.savepoints.truncate(pos);
            state
                .calls
                .push(Call::ReleaseSavepoint(savepoint.name().to_string()));
            Ok(())
        })
    }

    fn create_array(
        &self,
        element_type: &str,
        elements: Vec<DriverValue>,
    ) -> DriverResult<DriverValue> {
        self.with_state(None, |state| {
            state.calls.push(Call::CreateArray(element_type.to_string()));
            Ok(DriverValue::Array(elements))
        })
    }

    fn close(&self) -> DriverResult<()> {
        let mut state = lock(&self.state);
        state.check(FailPoint::Close)?;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(DriverError::new("connection already closed"));
        }
        state.open_handles = state.open_handles.saturating_sub(1);
        state.end_transaction(false);
        state.calls.push(Call::Close);
        Ok(())
    }
}

struct MemoryStatement {
    state: Arc<Mutex<State>>,
    closed: Arc<AtomicBool>,
    command: Command,
    params: Vec<DriverValue>,
    batches: Vec<Vec<DriverValue>>,
    keys: GeneratedKeys,
    generated: Option<RowBuffer>,
}

impl MemoryStatement {
    fn generated_rows(&self, state: &State, rows: &[StoredRow]) -> RowBuffer {
        let columns: Vec<String> = match &self.keys {
            GeneratedKeys::Columns(cols) if !cols.is_empty() => cols.clone(),
            _ => {
                let mut cols = vec!["id".to_string()];
                cols.extend(state.columns.iter().cloned());
                cols
            }
        };
        let meta = ResultMetadata::new(columns.iter().map(|c| column_meta(c, c)).collect());
        let data = rows
            .iter()
            .map(|row| columns.iter().map(|c| row_value(row, c)).collect())
            .collect();
        RowBuffer::new(meta, data)
    }
}

impl RawStatement for MemoryStatement {
    fn parameter_count(&self) -> usize {
        self.command.param_count
    }

    fn set_object(&mut self, index: usize, value: DriverValue) -> DriverResult<()> {
        let slot = index
            .checked_sub(1)
            .and_then(|i| self.params.get_mut(i))
            .ok_or_else(|| DriverError::new(format!("parameter index {index} out of range")))?;
        *slot = value;
        Ok(())
    }

    fn clear_parameters(&mut self) {
        self.params.iter_mut().for_each(|p| *p = DriverValue::Null);
    }

    fn add_batch(&mut self) -> DriverResult<()> {
        self.batches.push(self.params.clone());
        Ok(())
    }

    fn execute_batch(&mut self) -> DriverResult<Vec<u64>> {
        let batches = std::mem::take(&mut self.batches);
        let mut state = lock_open(&self.state, &self.closed)?;
        state.check(FailPoint::Execute)?;
        let mut counts = Vec::with_capacity(batches.len());
        for params in &batches {
            counts.push(self.command.run_update(&mut state, params)?.0);
        }
        state.calls.push(Call::ExecuteBatch(batches.len()));
        Ok(counts)
    }

    fn execute_update(&mut self) -> DriverResult<u64> {
        let mut state = lock_open(&self.state, &self.closed)?;
        state.check(FailPoint::Execute)?;
        let (count, inserted) = self.command.run_update(&mut state, &self.params)?;
        if self.keys.is_requested() {
            self.generated = Some(self.generated_rows(&state, &inserted));
        }
        state.calls.push(Call::ExecuteUpdate);
        Ok(count)
    }

    fn execute_query(&mut self) -> DriverResult<Box<dyn ResultSet>> {
        let mut state = lock_open(&self.state, &self.closed)?;
        state.check(FailPoint::Execute)?;
        let rows = self.command.run_query(&state, &self.params)?;
        state.calls.push(Call::ExecuteQuery);
        Ok(Box::new(rows))
    }

    fn generated_keys(&mut self) -> DriverResult<Box<dyn ResultSet>> {
        Ok(Box::new(self.generated.take().unwrap_or_default()))
    }
}

fn column_meta(label: &str, column: &str) -> ColumnMeta {
    let type_name = if column.eq_ignore_ascii_case("id") {
        "INTEGER"
    } else {
        "ANY"
    };
    ColumnMeta::new(label, type_name)
}

fn row_value(row: &StoredRow, column: &str) -> DriverValue {
    if column.eq_ignore_ascii_case("id") {
        return DriverValue::Integer(row.id);
    }
    row.values
        .get(&column.to_ascii_lowercase())
        .cloned()
        .unwrap_or(DriverValue::Null)
}

#[derive(Clone, Debug)]
enum Operand {
    Param(usize),
    Literal(DriverValue),
}

impl Operand {
    fn parse(token: &str, next_param: &mut usize) -> DriverResult<Self> {
        let token = token.trim();
        if token == "?" {
            *next_param += 1;
            return Ok(Operand::Param(*next_param - 1));
        }
        if token.eq_ignore_ascii_case("null") {
            return Ok(Operand::Literal(DriverValue::Null));
        }
        if token.eq_ignore_ascii_case("true") || token.eq_ignore_ascii_case("false") {
            return Ok(Operand::Literal(DriverValue::Bool(
                token.eq_ignore_ascii_case("true"),
            )));
        }
        if let Some(text) = token.strip_prefix('\'').and_then(|t| t.strip_suffix('\'')) {
            return Ok(Operand::Literal(DriverValue::Text(text.replace("''", "'"))));
        }
        if let Ok(i) = token.parse::<i64>() {
            return Ok(Operand::Literal(DriverValue::Integer(i)));
        }
        if let Ok(f) = token.parse::<f64>() {
            return Ok(Operand::Literal(DriverValue::Real(f)));
        }
        Err(DriverError::new(format!("unsupported operand `{token}`")))
    }

    fn resolve(&self, params: &[DriverValue]) -> DriverResult<DriverValue> {
        match self {
            Operand::Literal(v) => Ok(v.clone()),
            Operand::Param(i) => params
                .get(*i)
                .cloned()
                .ok_or_else(|| DriverError::new(format!("parameter {} not bound", i + 1))),
        }
    }
}

#[derive(Clone, Debug)]
enum Projection {
    Star,
    Count { label: String },
    Column { name: String, label: String },
}

#[derive(Clone, Debug)]
enum Kind {
    Ddl,
    Insert {
        columns: Vec<String>,
        values: Vec<Operand>,
    },
    Select {
        projections: Vec<Projection>,
        filter: Option<(String, Operand)>,
    },
    Delete {
        filter: Option<(String, Operand)>,
    },
}

#[derive(Clone, Debug)]
struct Command {
    kind: Kind,
    param_count: usize,
}

fn between(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)? + open.len_utf8();
    let end = s[start..].rfind(close)? + start;
    Some(&s[start..end])
}

fn split_list(s: &str) -> Vec<&str> {
    s.split(',').map(str::trim).filter(|t| !t.is_empty()).collect()
}

fn unquote(s: &str) -> &str {
    s.trim()
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or_else(|| s.trim())
}

/// `WHERE col = operand` tail, if any.
fn parse_filter(
    sql: &str,
    upper: &str,
    next_param: &mut usize,
) -> DriverResult<Option<(String, Operand)>> {
    let Some(at) = upper.find(" WHERE ") else {
        return Ok(None);
    };
    let clause = &sql[at + " WHERE ".len()..];
    let (column, operand) = clause
        .split_once('=')
        .ok_or_else(|| DriverError::new(format!("unsupported WHERE clause `{clause}`")))?;
    Ok(Some((
        column.trim().to_ascii_lowercase(),
        Operand::parse(operand, next_param)?,
    )))
}

impl Command {
    fn parse(sql: &str) -> DriverResult<Self> {
        let sql = sql.trim().trim_end_matches(';').trim();
        let mut upper = sql.to_ascii_uppercase();
        let mut next_param = 0;
        let unsupported = || DriverError::new(format!("unsupported statement `{sql}`"));

        let kind = if upper.starts_with("CREATE ") || upper.starts_with("DROP ") {
            Kind::Ddl
        } else if upper.starts_with("INSERT ") {
            let values_at = upper.find("VALUES").ok_or_else(unsupported)?;
            let columns = between(&sql[..values_at], '(', ')')
                .map(split_list)
                .ok_or_else(unsupported)?
                .into_iter()
                .map(|c| unquote(c).to_string())
                .collect::<Vec<_>>();
            let values = between(&sql[values_at..], '(', ')')
                .map(split_list)
                .ok_or_else(unsupported)?
                .into_iter()
                .map(|v| Operand::parse(v, &mut next_param))
                .collect::<DriverResult<Vec<_>>>()?;
            if columns.len() != values.len() {
                return Err(DriverError::new(format!(
                    "{} columns but {} values",
                    columns.len(),
                    values.len()
                )));
            }
            Kind::Insert { columns, values }
        } else if upper.starts_with("SELECT ") {
            let sql = match upper.find(" ORDER BY ") {
                Some(at) => {
                    upper.truncate(at);
                    &sql[..at]
                }
                None => sql,
            };
            let from_at = upper.find(" FROM ").ok_or_else(unsupported)?;
            let projections = split_list(&sql["SELECT ".len()..from_at])
                .into_iter()
                .map(parse_projection)
                .collect::<Vec<_>>();
            let filter = parse_filter(sql, &upper, &mut next_param)?;
            Kind::Select {
                projections,
                filter,
            }
        } else if upper.starts_with("DELETE ") {
            Kind::Delete {
                filter: parse_filter(sql, &upper, &mut next_param)?,
            }
        } else {
            return Err(unsupported());
        };
        Ok(Self {
            kind,
            param_count: next_param,
        })
    }

    /// Apply a write. Returns the affected count and any inserted rows.
    fn run_update(
        &self,
        state: &mut State,
        params: &[DriverValue],
    ) -> DriverResult<(u64, Vec<StoredRow>)> {
        match &self.kind {
            Kind::Ddl => Ok((0, Vec::new())),
            Kind::Insert { columns, values } => {
                let mut row = StoredRow {
                    id: state.next_id,
                    values: BTreeMap::new(),
                };
                for (column, operand) in columns.iter().zip(values) {
                    row.values
                        .insert(column.to_ascii_lowercase(), operand.resolve(params)?);
                }
                for column in columns {
                    if !state
                        .columns
                        .iter()
                        .any(|c| c.eq_ignore_ascii_case(column))
                    {
                        state.columns.push(column.clone());
                    }
                }
                state.rows_mut()?.push(row.clone());
                state.next_id += 1;
                Ok((1, vec![row]))
            }
            Kind::Delete { filter } => {
                let filter = resolve_filter(filter, params)?;
                let rows = state.rows_mut()?;
                let before = rows.len();
                rows.retain(|row| !matches_filter(row, &filter));
                Ok(((before - rows.len()) as u64, Vec::new()))
            }
            Kind::Select { .. } => Err(DriverError::new("a query cannot be executed as an update")),
        }
    }

    fn run_query(&self, state: &State, params: &[DriverValue]) -> DriverResult<RowBuffer> {
        let Kind::Select {
            projections,
            filter,
        } = &self.kind
        else {
            return Err(DriverError::new("statement does not produce a result set"));
        };
        let filter = resolve_filter(filter, params)?;
        let rows: Vec<&StoredRow> = state
            .visible()
            .iter()
            .filter(|row| matches_filter(row, &filter))
            .collect();

        if let [Projection::Count { label }] = projections.as_slice() {
            return Ok(RowBuffer::new(
                ResultMetadata::new(vec![ColumnMeta::new(label.clone(), "INTEGER")]),
                vec![vec![DriverValue::Integer(rows.len() as i64)]],
            ));
        }

        let mut columns: Vec<(String, String)> = Vec::new();
        for projection in projections {
            match projection {
                Projection::Star => {
                    columns.push(("id".into(), "id".into()));
                    columns.extend(state.columns.iter().map(|c| (c.clone(), c.clone())));
                }
                Projection::Column { name, label } => columns.push((name.clone(), label.clone())),
                Projection::Count { .. } => {
                    return Err(DriverError::new("COUNT(*) cannot be mixed with columns"))
                }
            }
        }
        let meta = ResultMetadata::new(
            columns
                .iter()
                .map(|(name, label)| column_meta(label, name))
                .collect(),
        );
        let data = rows
            .iter()
            .map(|row| columns.iter().map(|(name, _)| row_value(row, name)).collect())
            .collect();
        Ok(RowBuffer::new(meta, data))
    }
}

fn parse_projection(item: &str) -> Projection {
    let upper = item.to_ascii_uppercase();
    let (expr, label) = match upper.find(" AS ") {
        Some(at) => (item[..at].trim(), Some(unquote(&item[at + 4..]).to_string())),
        None => (item.trim(), None),
    };
    if expr == "*" {
        return Projection::Star;
    }
    if expr.eq_ignore_ascii_case("count(*)") {
        return Projection::Count {
            label: label.unwrap_or_else(|| expr.to_string()),
        };
    }
    let name = unquote(expr).to_string();
    Projection::Column {
        label: label.unwrap_or_else(|| name.clone()),
        name,
    }
}

fn resolve_filter(
    filter: &Option<(String, Operand)>,
    params: &[DriverValue],
) -> DriverResult<Option<(String, DriverValue)>> {
    filter
        .as_ref()
        .map(|(column, operand)| Ok((column.clone(), operand.resolve(params)?)))
        .transpose()
}

fn matches_filter(row: &StoredRow, filter: &Option<(String, DriverValue)>) -> bool {
    match filter {
        None => true,
        Some((column, expected)) => {
            let actual = row_value(row, column);
            !actual.is_null() && actual == *expected
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (MemoryProbe, Box<dyn RawConnection>) {
        let driver = MemoryDriver::new();
        (driver.probe(), driver.raw_connection())
    }

    fn insert(conn: &dyn RawConnection, name: &str) {
        conn.execute(&format!("INSERT INTO items(name) VALUES ('{name}')"))
            .unwrap();
    }

    #[test]
    fn autocommit_writes_are_committed_immediately() {
        let (probe, conn) = connection();
        insert(conn.as_ref(), "a");
        assert_eq!(probe.committed_names(), vec!["a"]);
        assert!(!probe.in_physical_transaction());
    }

    #[test]
    fn manual_mode_buffers_until_commit() {
        let (probe, conn) = connection();
        conn.set_auto_commit(false).unwrap();
        insert(conn.as_ref(), "a");
        assert!(probe.committed_names().is_empty());
        conn.commit().unwrap();
        assert_eq!(probe.committed_names(), vec!["a"]);

        insert(conn.as_ref(), "b");
        conn.rollback().unwrap();
        assert_eq!(probe.committed_names(), vec!["a"]);

        insert(conn.as_ref(), "c");
        conn.set_auto_commit(true).unwrap();
        assert_eq!(probe.committed_names(), vec!["a", "c"]);
    }

    #[test]
    fn savepoints_roll_back_partially() {
        let (probe, conn) = connection();
        conn.set_auto_commit(false).unwrap();
        insert(conn.as_ref(), "a");
        let sp = conn.set_savepoint().unwrap();
        insert(conn.as_ref(), "b");
        conn.rollback_to_savepoint(&sp).unwrap();
        assert_eq!(probe.savepoint_names(), vec!["sp1"]);
        conn.release_savepoint(&sp).unwrap();
        assert!(probe.savepoint_names().is_empty());
        conn.commit().unwrap();
        assert_eq!(probe.committed_names(), vec!["a"]);
    }

    #[test]
    fn savepoint_requires_manual_mode() {
        let (_probe, conn) = connection();
        assert!(conn.set_savepoint().is_err());
        assert!(conn.commit().is_err());
    }

    #[test]
    fn select_projects_filters_and_counts() {
        let (_probe, conn) = connection();
        insert(conn.as_ref(), "a");
        insert(conn.as_ref(), "b");

        let mut stmt = conn
            .prepare("SELECT id, name AS \"Name\" FROM items WHERE name = ?", &GeneratedKeys::None)
            .unwrap();
        assert_eq!(stmt.parameter_count(), 1);
        stmt.set_object(1, DriverValue::Text("b".into())).unwrap();
        let mut rs = stmt.execute_query().unwrap();
        assert_eq!(rs.metadata().column_label(2), Some("Name"));
        assert_eq!(
            rs.next_row().unwrap(),
            Some(vec![DriverValue::Integer(2), DriverValue::Text("b".into())])
        );
        assert_eq!(rs.next_row().unwrap(), None);

        let mut count = conn
            .prepare("SELECT COUNT(*) AS n FROM items", &GeneratedKeys::None)
            .unwrap();
        let mut rs = count.execute_query().unwrap();
        assert_eq!(rs.metadata().column_label(1), Some("n"));
        assert_eq!(rs.next_row().unwrap(), Some(vec![DriverValue::Integer(2)]));
    }

    #[test]
    fn generated_keys_follow_requested_columns() {
        let (_probe, conn) = connection();
        let mut stmt = conn
            .prepare(
                "INSERT INTO items(name) VALUES (?)",
                &GeneratedKeys::Columns(vec!["id".into()]),
            )
            .unwrap();
        stmt.set_object(1, DriverValue::Text("x".into())).unwrap();
        assert_eq!(stmt.execute_update().unwrap(), 1);
        let mut keys = stmt.generated_keys().unwrap();
        assert_eq!(keys.next_row().unwrap(), Some(vec![DriverValue::Integer(1)]));
    }

    #[test]
    fn read_only_rejects_writes() {
        let (_probe, conn) = connection();
        conn.set_read_only(true).unwrap();
        assert!(conn
            .execute("INSERT INTO items(name) VALUES ('a')")
            .is_err());
    }

    #[test]
    fn injected_failures_fire_once() {
        let (probe, conn) = connection();
        conn.set_auto_commit(false).unwrap();
        probe.fail_next(FailPoint::Commit);
        assert!(conn.commit().is_err());
        conn.commit().unwrap();
        assert_eq!(probe.count(&Call::Commit), 1);
    }

    #[test]
    fn close_tracks_open_handles() {
        let (probe, conn) = connection();
        assert_eq!(probe.open_handles(), 1);
        conn.close().unwrap();
        assert_eq!(probe.open_handles(), 0);
        assert!(conn.close().is_err());
        assert!(conn.execute("DELETE FROM items").is_err());
    }

    #[test]
    fn statements_stop_working_after_close() {
        let (probe, conn) = connection();
        let mut insert = conn
            .prepare("INSERT INTO items(name) VALUES (?)", &GeneratedKeys::None)
            .unwrap();
        let mut select = conn
            .prepare("SELECT id, name FROM items", &GeneratedKeys::None)
            .unwrap();
        conn.close().unwrap();

        insert.set_object(1, DriverValue::Text("late".into())).unwrap();
        assert!(insert.execute_update().is_err());
        insert.add_batch().unwrap();
        assert!(insert.execute_batch().is_err());
        assert!(select.execute_query().is_err());
        assert!(probe.committed_names().is_empty());
    }
}
