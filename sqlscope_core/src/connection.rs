//! The connection wrapper.
//!
//! A [`Connection`] is a cheap, cloneable value: clones share the raw driver
//! handle, while each transactional transition produces a new value carrying
//! its own [`TransactionState`]. The only state shared between the values of
//! one top-level transaction is the rollback flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::driver::{lookup_driver, RawConnection, Savepoint};
use crate::spec::{ConnectionSpec, IsolationLevel};
use crate::transactions::{DefaultStrategy, TransactionStrategy};
use crate::value::DriverValue;
use crate::{Error, Result};

/// Shared "roll back the whole top-level transaction" cell.
#[derive(Clone, Debug, Default)]
pub struct RollbackFlag(Arc<AtomicBool>);

impl RollbackFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// True when both flags are the same cell.
    pub fn same_cell(&self, other: &RollbackFlag) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Raw connection settings captured at depth-0 Enter and restored at depth-0 Exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PriorSettings {
    pub auto_commit: bool,
    pub isolation: IsolationLevel,
    pub read_only: bool,
}

/// Transactional position of a connection value.
///
/// `depth` is `None` while idle. Depth 0 never carries a savepoint; every
/// deeper level does.
#[derive(Clone, Debug, Default)]
pub struct TransactionState {
    depth: Option<usize>,
    rollback: Option<RollbackFlag>,
    savepoint: Option<Savepoint>,
    prior: Option<PriorSettings>,
}

impl TransactionState {
    pub fn idle() -> Self {
        Self::default()
    }

    /// Outermost scope with a fresh rollback flag.
    pub fn root(prior: PriorSettings) -> Self {
        Self {
            depth: Some(0),
            rollback: Some(RollbackFlag::new()),
            savepoint: None,
            prior: Some(prior),
        }
    }

    /// Child scope one level deeper, sharing this scope's rollback flag.
    ///
    /// Returns `None` when `self` is idle.
    pub fn nested(&self, savepoint: Savepoint) -> Option<Self> {
        let depth = self.depth?;
        Some(Self {
            depth: Some(depth + 1),
            rollback: self.rollback.clone(),
            savepoint: Some(savepoint),
            prior: self.prior,
        })
    }

    pub fn in_transaction(&self) -> bool {
        self.depth.is_some()
    }

    pub fn depth(&self) -> Option<usize> {
        self.depth
    }

    pub fn rollback_flag(&self) -> Option<&RollbackFlag> {
        self.rollback.as_ref()
    }

    pub fn savepoint(&self) -> Option<&Savepoint> {
        self.savepoint.as_ref()
    }

    pub fn prior(&self) -> Option<&PriorSettings> {
        self.prior.as_ref()
    }
}

struct Handle {
    raw: Box<dyn RawConnection>,
    closed: AtomicBool,
    driver: Option<String>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.raw.close() {
                debug!(error = %e, "closing dropped connection failed");
            }
        }
    }
}

/// One logical database session.
#[derive(Clone)]
pub struct Connection {
    handle: Arc<Handle>,
    isolation: Option<IsolationLevel>,
    read_only: bool,
    strategy: Arc<dyn TransactionStrategy>,
    state: TransactionState,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("driver", &self.handle.driver)
            .field("closed", &self.is_closed())
            .field("isolation", &self.isolation)
            .field("read_only", &self.read_only)
            .field("strategy", &self.strategy)
            .field("state", &self.state)
            .finish()
    }
}

impl Connection {
    /// Resolve `spec` to a registered driver and open a raw connection.
    ///
    /// The spec's isolation level and read-only flag are applied before returning.
    pub fn open(spec: &ConnectionSpec) -> Result<Self> {
        let name = spec.driver_name().ok_or_else(|| {
            Error::config("connection spec names no driver (set `subprotocol` or `classname`)")
        })?;
        let driver = lookup_driver(name)
            .ok_or_else(|| Error::config(format!("no driver registered for `{name}`")))?;
        let raw = driver
            .connect(spec)
            .map_err(|e| Error::connection_failed(format!("failed to open `{name}` connection"), e))?;

        let mut conn = Self::wrap(raw, Some(name.to_ascii_lowercase()));
        if let Some(level) = spec.isolation_level {
            conn.raw()?
                .set_isolation(level)
                .map_err(|e| Error::connection_failed("failed to apply isolation level", e))?;
            conn.isolation = Some(level);
        }
        if spec.read_only {
            conn.raw()?
                .set_read_only(true)
                .map_err(|e| Error::connection_failed("failed to apply read-only mode", e))?;
            conn.read_only = true;
        }
        debug!(driver = name, "opened connection");
        Ok(conn)
    }

    /// Wrap an already opened raw connection, e.g. one handed out by a pool.
    pub fn from_raw(raw: Box<dyn RawConnection>) -> Self {
        Self::wrap(raw, None)
    }

    fn wrap(raw: Box<dyn RawConnection>, driver: Option<String>) -> Self {
        Self {
            handle: Arc::new(Handle {
                raw,
                closed: AtomicBool::new(false),
                driver,
            }),
            isolation: None,
            read_only: false,
            strategy: Arc::new(DefaultStrategy),
            state: TransactionState::idle(),
        }
    }

    /// Release the raw connection. A second call is a connection error.
    pub fn close(&self) -> Result<()> {
        if self.handle.closed.swap(true, Ordering::SeqCst) {
            return Err(Error::connection("connection is already closed"));
        }
        self.handle
            .raw
            .close()
            .map_err(|e| Error::connection_failed("failed to close connection", e))?;
        debug!(driver = ?self.handle.driver, "closed connection");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.handle.closed.load(Ordering::SeqCst)
    }

    /// The raw driver handle, or a connection error once closed.
    pub fn raw(&self) -> Result<&dyn RawConnection> {
        if self.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(self.handle.raw.as_ref())
    }

    /// New value using `strategy` for begin/commit/rollback; transactional state is untouched.
    pub fn with_strategy(&self, strategy: Arc<dyn TransactionStrategy>) -> Self {
        Self {
            strategy,
            ..self.clone()
        }
    }

    /// New value at a different transactional position. Intended for strategies.
    pub fn with_transaction_state(&self, state: TransactionState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }

    /// New value recording the session's isolation level and read-only flag.
    pub fn with_session(&self, isolation: Option<IsolationLevel>, read_only: bool) -> Self {
        Self {
            isolation,
            read_only,
            ..self.clone()
        }
    }

    pub fn strategy(&self) -> &Arc<dyn TransactionStrategy> {
        &self.strategy
    }

    pub fn transaction_state(&self) -> &TransactionState {
        &self.state
    }

    pub fn in_transaction(&self) -> bool {
        self.state.in_transaction()
    }

    pub fn depth(&self) -> Option<usize> {
        self.state.depth()
    }

    pub fn isolation_level(&self) -> Option<IsolationLevel> {
        self.isolation
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Registered name of the driver that opened this connection, if any.
    pub fn driver_name(&self) -> Option<&str> {
        self.handle.driver.as_deref()
    }

    /// True when both values wrap the same raw connection.
    pub fn same_session(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }

    pub(crate) fn session_id(&self) -> usize {
        Arc::as_ptr(&self.handle) as usize
    }

    /// Request rollback of the enclosing top-level transaction at its exit.
    ///
    /// Outside a transaction this does nothing.
    pub fn set_rollback(&self) {
        match self.state.rollback_flag() {
            Some(flag) => {
                flag.set();
                debug!(depth = ?self.state.depth(), "rollback requested");
            }
            None => debug!("set_rollback outside a transaction ignored"),
        }
    }

    pub fn is_rollback_set(&self) -> bool {
        self.state.rollback_flag().map_or(false, RollbackFlag::is_set)
    }

    /// Build a driver-native array through the raw connection.
    pub fn create_array(&self, element_type: &str, elements: Vec<DriverValue>) -> Result<DriverValue> {
        self.raw()?
            .create_array(element_type, elements)
            .map_err(Error::driver)
    }
}

/// Open a connection, run `f`, and always close it.
///
/// An error from `f` takes precedence over a failure while closing.
pub fn with_connection<R, E, F>(spec: &ConnectionSpec, f: F) -> std::result::Result<R, E>
where
    E: From<Error>,
    F: FnOnce(&Connection) -> std::result::Result<R, E>,
{
    let conn = Connection::open(spec)?;
    let outcome = f(&conn);
    let closed = if conn.is_closed() { Ok(()) } else { conn.close() };
    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), _) => Err(e),
    }
}
