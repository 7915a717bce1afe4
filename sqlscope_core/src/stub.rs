//! Journal-only stub driver for unit tests inside this crate.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::connection::Connection;
use crate::driver::{
    ColumnMeta, DriverError, DriverResult, GeneratedKeys, RawConnection, RawStatement,
    ResultMetadata, ResultSet, RowBuffer, Savepoint,
};
use crate::spec::IsolationLevel;
use crate::value::DriverValue;

pub(crate) struct StubState {
    pub auto_commit: bool,
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub savepoints: usize,
    pub journal: Vec<String>,
    /// Journal prefix whose next occurrence fails.
    pub fail_on: Option<&'static str>,
}

#[derive(Clone)]
pub(crate) struct StubHandle(Arc<Mutex<StubState>>);

impl StubHandle {
    fn lock(&self) -> MutexGuard<'_, StubState> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn fail_on(&self, prefix: &'static str) {
        self.lock().fail_on = Some(prefix);
    }

    pub fn auto_commit(&self) -> bool {
        self.lock().auto_commit
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.lock().isolation
    }

    pub fn read_only(&self) -> bool {
        self.lock().read_only
    }

    fn record(&self, entry: String) -> DriverResult<()> {
        let mut state = self.lock();
        if let Some(prefix) = state.fail_on {
            if entry.starts_with(prefix) {
                state.fail_on = None;
                return Err(DriverError::new(format!("injected failure: {entry}")));
            }
        }
        state.journal.push(entry);
        Ok(())
    }
}

pub(crate) struct StubConnection(StubHandle);

pub(crate) fn connection() -> (Connection, StubHandle) {
    let handle = StubHandle(Arc::new(Mutex::new(StubState {
        auto_commit: true,
        isolation: IsolationLevel::ReadCommitted,
        read_only: false,
        savepoints: 0,
        journal: Vec::new(),
        fail_on: None,
    })));
    let conn = Connection::from_raw(Box::new(StubConnection(handle.clone())));
    (conn, handle)
}

impl RawConnection for StubConnection {
    fn prepare(&self, sql: &str, keys: &GeneratedKeys) -> DriverResult<Box<dyn RawStatement>> {
        self.0.record(format!("prepare {sql}"))?;
        let mut stmt = StubStatement::new(sql, Some(self.0.clone()));
        stmt.keys = keys.clone();
        Ok(Box::new(stmt))
    }

    fn execute(&self, sql: &str) -> DriverResult<u64> {
        self.0.record(format!("execute {sql}"))?;
        Ok(1)
    }

    fn auto_commit(&self) -> DriverResult<bool> {
        Ok(self.0.lock().auto_commit)
    }

    fn set_auto_commit(&self, enabled: bool) -> DriverResult<()> {
        self.0.record(format!("set_auto_commit({enabled})"))?;
        self.0.lock().auto_commit = enabled;
        Ok(())
    }

    fn isolation(&self) -> DriverResult<IsolationLevel> {
        Ok(self.0.lock().isolation)
    }

    fn set_isolation(&self, level: IsolationLevel) -> DriverResult<()> {
        self.0.record(format!("set_isolation({level})"))?;
        self.0.lock().isolation = level;
        Ok(())
    }

    fn is_read_only(&self) -> DriverResult<bool> {
        Ok(self.0.lock().read_only)
    }

    fn set_read_only(&self, read_only: bool) -> DriverResult<()> {
        self.0.record(format!("set_read_only({read_only})"))?;
        self.0.lock().read_only = read_only;
        Ok(())
    }

    fn commit(&self) -> DriverResult<()> {
        self.0.record("commit".into())
    }

    fn rollback(&self) -> DriverResult<()> {
        self.0.record("rollback".into())
    }

    fn set_savepoint(&self) -> DriverResult<Savepoint> {
        let name = {
            let mut state = self.0.lock();
            state.savepoints += 1;
            format!("sp{}", state.savepoints)
        };
        self.0.record(format!("savepoint {name}"))?;
        Ok(Savepoint::new(name))
    }

    fn rollback_to_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
        self.0.record(format!("rollback_to {}", savepoint.name()))
    }

    fn release_savepoint(&self, savepoint: &Savepoint) -> DriverResult<()> {
        self.0.record(format!("release {}", savepoint.name()))
    }

    fn create_array(
        &self,
        element_type: &str,
        elements: Vec<DriverValue>,
    ) -> DriverResult<DriverValue> {
        self.0.record(format!("create_array({element_type})"))?;
        Ok(DriverValue::Array(elements))
    }

    fn close(&self) -> DriverResult<()> {
        self.0.record("close".into())
    }
}

/// Statement that echoes its bound parameters back as a single row.
pub(crate) struct StubStatement {
    handle: Option<StubHandle>,
    params: Vec<DriverValue>,
    batches: Vec<Vec<DriverValue>>,
    keys: GeneratedKeys,
    executions: i64,
}

impl StubStatement {
    pub fn new(sql: &str, handle: Option<StubHandle>) -> Self {
        let count = sql.matches('?').count();
        Self {
            handle,
            params: vec![DriverValue::Null; count],
            batches: Vec::new(),
            keys: GeneratedKeys::None,
            executions: 0,
        }
    }

    pub fn bound(&self) -> &[DriverValue] {
        &self.params
    }

    fn record(&self, entry: String) -> DriverResult<()> {
        match &self.handle {
            Some(handle) => handle.record(entry),
            None => Ok(()),
        }
    }
}

impl RawStatement for StubStatement {
    fn parameter_count(&self) -> usize {
        self.params.len()
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
        self.record(format!("execute_batch x{}", batches.len()))?;
        self.executions += batches.len() as i64;
        Ok(vec![1; batches.len()])
    }

    fn execute_update(&mut self) -> DriverResult<u64> {
        self.record(format!("execute_update {:?}", self.params))?;
        self.executions += 1;
        Ok(1)
    }

    fn execute_query(&mut self) -> DriverResult<Box<dyn ResultSet>> {
        self.record("execute_query".into())?;
        let columns = (1..=self.params.len())
            .map(|i| ColumnMeta::new(format!("Param{i}"), "ANY"))
            .collect();
        Ok(Box::new(RowBuffer::new(
            ResultMetadata::new(columns),
            vec![self.params.clone()],
        )))
    }

    fn generated_keys(&mut self) -> DriverResult<Box<dyn ResultSet>> {
        if !self.keys.is_requested() {
            return Ok(Box::new(RowBuffer::empty()));
        }
        Ok(Box::new(RowBuffer::new(
            ResultMetadata::new(vec![ColumnMeta::new("ID", "INTEGER")]),
            vec![vec![DriverValue::Integer(self.executions)]],
        )))
    }
}
