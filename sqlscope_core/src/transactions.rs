//! Nested transactions on a single physical transaction.
//!
//! [`atomic`] / [`atomic_with`] run a closure inside a transaction scope. The
//! outermost scope owns the physical transaction; inner scopes are savepoints.
//! Every scope of one top-level transaction shares a rollback flag: once any
//! scope sets it, or any scope fails, the top-level exit rolls everything back.
//!
//! The physical begin/commit/rollback actions are delegated to the
//! connection's [`TransactionStrategy`].

use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::{Connection, PriorSettings, TransactionState};
use crate::driver::RawConnection;
use crate::spec::IsolationLevel;
use crate::{Error, Result};

/// Options accepted at transaction entry. Only honoured by the outermost scope.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionOptions {
    pub isolation: Option<IsolationLevel>,
    pub read_only: Option<bool>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    fn is_empty(&self) -> bool {
        self.isolation.is_none() && self.read_only.is_none()
    }
}

/// Pluggable physical transaction policy.
///
/// `begin` returns the connection value the scope's body observes; `commit`
/// and `rollback` receive that same value when the scope exits.
pub trait TransactionStrategy: Send + Sync + fmt::Debug {
    fn begin(&self, conn: &Connection, opts: &TransactionOptions) -> Result<Connection>;
    fn commit(&self, conn: &Connection, opts: &TransactionOptions) -> Result<()>;
    fn rollback(&self, conn: &Connection, opts: &TransactionOptions) -> Result<()>;
}

/// Savepoint-nesting strategy: one physical transaction at depth 0, a savepoint per inner scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultStrategy;

/// Strategy for connections whose transactions are managed elsewhere: touches nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopStrategy;

fn tx_error(message: &'static str) -> impl FnOnce(crate::DriverError) -> Error {
    move |e| Error::transaction(message, e)
}

fn invalid_state(message: impl Into<String>) -> Error {
    Error::Transaction {
        message: message.into(),
        source: None,
    }
}

impl DefaultStrategy {
    fn apply(raw: &dyn RawConnection, opts: &TransactionOptions) -> Result<()> {
        if let Some(level) = opts.isolation {
            raw.set_isolation(level)
                .map_err(tx_error("failed to set transaction isolation"))?;
        }
        if let Some(read_only) = opts.read_only {
            raw.set_read_only(read_only)
                .map_err(tx_error("failed to set transaction read-only mode"))?;
        }
        raw.set_auto_commit(false)
            .map_err(tx_error("failed to disable autocommit"))
    }

    /// Put back what depth-0 Enter changed. Autocommit is always restored;
    /// isolation and read-only only when the scope's options changed them.
    fn restore(raw: &dyn RawConnection, prior: &PriorSettings, opts: &TransactionOptions) -> Result<()> {
        raw.set_auto_commit(prior.auto_commit)
            .map_err(tx_error("failed to restore autocommit"))?;
        if opts.isolation.is_some() {
            raw.set_isolation(prior.isolation)
                .map_err(tx_error("failed to restore isolation"))?;
        }
        if opts.read_only.is_some() {
            raw.set_read_only(prior.read_only)
                .map_err(tx_error("failed to restore read-only mode"))?;
        }
        Ok(())
    }

    fn prior_settings(conn: &Connection) -> Result<&PriorSettings> {
        conn.transaction_state()
            .prior()
            .ok_or_else(|| invalid_state("transaction scope lost its prior connection settings"))
    }
}

impl TransactionStrategy for DefaultStrategy {
    fn begin(&self, conn: &Connection, opts: &TransactionOptions) -> Result<Connection> {
        let raw = conn.raw()?;
        let state = conn.transaction_state();

        if let Some(depth) = state.depth() {
            if !opts.is_empty() {
                debug!(
                    depth = depth + 1,
                    ?opts,
                    "isolation/read-only ignored inside a nested transaction"
                );
            }
            let savepoint = raw
                .set_savepoint()
                .map_err(tx_error("failed to set savepoint"))?;
            debug!(depth = depth + 1, savepoint = savepoint.name(), "begin nested transaction");
            let nested = state
                .nested(savepoint)
                .ok_or_else(|| invalid_state("nested begin outside a transaction"))?;
            return Ok(conn.with_transaction_state(nested));
        }

        let prior = PriorSettings {
            auto_commit: raw
                .auto_commit()
                .map_err(tx_error("failed to read autocommit"))?,
            isolation: raw
                .isolation()
                .map_err(tx_error("failed to read isolation level"))?,
            read_only: raw
                .is_read_only()
                .map_err(tx_error("failed to read read-only mode"))?,
        };
        if let Err(e) = Self::apply(raw, opts) {
            if let Err(restore) = Self::restore(raw, &prior, opts) {
                warn!(error = %restore, "failed to restore connection after aborted begin");
            }
            return Err(e);
        }
        debug!(depth = 0, ?opts, "begin transaction");
        let isolation = opts.isolation.or(conn.isolation_level());
        let read_only = opts.read_only.unwrap_or(conn.is_read_only());
        Ok(conn
            .with_session(isolation, read_only)
            .with_transaction_state(TransactionState::root(prior)))
    }

    fn commit(&self, conn: &Connection, opts: &TransactionOptions) -> Result<()> {
        let raw = conn.raw()?;
        let state = conn.transaction_state();
        match (state.depth(), state.savepoint()) {
            (Some(0), _) => {
                let prior = Self::prior_settings(conn)?;
                raw.commit().map_err(tx_error("failed to commit"))?;
                debug!(depth = 0, "committed transaction");
                Self::restore(raw, prior, opts)
            }
            (Some(depth), Some(savepoint)) => {
                raw.release_savepoint(savepoint)
                    .map_err(tx_error("failed to release savepoint"))?;
                debug!(depth, savepoint = savepoint.name(), "released savepoint");
                Ok(())
            }
            (Some(depth), None) => Err(invalid_state(format!(
                "nested transaction at depth {depth} has no savepoint"
            ))),
            (None, _) => Err(invalid_state("commit outside a transaction")),
        }
    }

    fn rollback(&self, conn: &Connection, opts: &TransactionOptions) -> Result<()> {
        let raw = conn.raw()?;
        let state = conn.transaction_state();
        match (state.depth(), state.savepoint()) {
            (Some(0), _) => {
                let prior = Self::prior_settings(conn)?;
                raw.rollback().map_err(tx_error("failed to roll back"))?;
                debug!(depth = 0, "rolled back transaction");
                Self::restore(raw, prior, opts)
            }
            (Some(depth), Some(savepoint)) => {
                raw.rollback_to_savepoint(savepoint)
                    .map_err(tx_error("failed to roll back to savepoint"))?;
                debug!(depth, savepoint = savepoint.name(), "rolled back to savepoint");
                Ok(())
            }
            (Some(depth), None) => Err(invalid_state(format!(
                "nested transaction at depth {depth} has no savepoint"
            ))),
            (None, _) => Err(invalid_state("rollback outside a transaction")),
        }
    }
}

impl TransactionStrategy for NoopStrategy {
    fn begin(&self, conn: &Connection, _opts: &TransactionOptions) -> Result<Connection> {
        Ok(conn.clone())
    }

    fn commit(&self, _conn: &Connection, _opts: &TransactionOptions) -> Result<()> {
        Ok(())
    }

    fn rollback(&self, _conn: &Connection, _opts: &TransactionOptions) -> Result<()> {
        Ok(())
    }
}

/// Runs the rollback transition if the scope body unwinds.
struct UnwindGuard<'a> {
    tx: &'a Connection,
    strategy: &'a dyn TransactionStrategy,
    opts: &'a TransactionOptions,
    armed: bool,
}

impl Drop for UnwindGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.tx.set_rollback();
        if let Err(e) = self.strategy.rollback(self.tx, self.opts) {
            warn!(error = %e, depth = ?self.tx.depth(), "rollback while unwinding failed");
        }
    }
}

/// Run `f` in a transaction scope with default options.
pub fn atomic<R, E, F>(conn: &Connection, f: F) -> std::result::Result<R, E>
where
    E: From<Error>,
    F: FnOnce(&Connection) -> std::result::Result<R, E>,
{
    atomic_with(conn, &TransactionOptions::default(), f)
}

/// Run `f` in a transaction scope.
///
/// `f` receives the scope's connection value. An `Err` from `f` forces the
/// rollback flag before the exit transition and is returned once cleanup is
/// done; an error raised by cleanup itself replaces it.
pub fn atomic_with<R, E, F>(
    conn: &Connection,
    opts: &TransactionOptions,
    f: F,
) -> std::result::Result<R, E>
where
    E: From<Error>,
    F: FnOnce(&Connection) -> std::result::Result<R, E>,
{
    let strategy = Arc::clone(conn.strategy());
    let tx = strategy.begin(conn, opts)?;

    let mut guard = UnwindGuard {
        tx: &tx,
        strategy: strategy.as_ref(),
        opts,
        armed: true,
    };
    let outcome = f(&tx);
    guard.armed = false;
    drop(guard);

    match outcome {
        Ok(value) => {
            if tx.is_rollback_set() {
                strategy.rollback(&tx, opts)?;
            } else {
                strategy.commit(&tx, opts)?;
            }
            Ok(value)
        }
        Err(err) => {
            tx.set_rollback();
            strategy.rollback(&tx, opts)?;
            Err(err)
        }
    }
}

impl Connection {
    /// See [`atomic`].
    pub fn atomic<R, E, F>(&self, f: F) -> std::result::Result<R, E>
    where
        E: From<Error>,
        F: FnOnce(&Connection) -> std::result::Result<R, E>,
    {
        atomic(self, f)
    }

    /// See [`atomic_with`].
    pub fn atomic_with<R, E, F>(&self, opts: &TransactionOptions, f: F) -> std::result::Result<R, E>
    where
        E: From<Error>,
        F: FnOnce(&Connection) -> std::result::Result<R, E>,
    {
        atomic_with(self, opts, f)
    }
}
