use proptest::prelude::*;
use sqlscope_core::{
    params, Connection, Error, IsolationLevel, QueryOptions, Result, TransactionOptions, Value,
};
use tests_common::{Call, FailPoint, MemoryDriver, MemoryProbe};

fn fresh() -> (Connection, MemoryProbe) {
    let driver = MemoryDriver::new();
    let probe = driver.probe();
    (Connection::from_raw(driver.raw_connection()), probe)
}

fn insert(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(("INSERT INTO items(name) VALUES (?)", params![name]))?;
    Ok(())
}

fn visible(conn: &Connection) -> Result<usize> {
    Ok(conn
        .query("SELECT id, name FROM items", &QueryOptions::default())?
        .len())
}

/// Enter `levels` nested scopes, inserting one row in each.
fn nest(conn: &Connection, levels: usize) -> Result<()> {
    if levels == 0 {
        return Ok(());
    }
    conn.atomic(|tx| {
        insert(tx, &format!("row at depth {:?}", tx.depth()))?;
        nest(tx, levels - 1)
    })
}

/// Like [`nest`], but sets the rollback flag at `flag_depth` and inserts one
/// more row in every scope after its child returned.
fn nest_with_flag(conn: &Connection, levels: usize, flag_depth: usize) -> Result<()> {
    if levels == 0 {
        return Ok(());
    }
    conn.atomic(|tx| {
        insert(tx, "before")?;
        if tx.depth() == Some(flag_depth) {
            tx.set_rollback();
        }
        nest_with_flag(tx, levels - 1, flag_depth)?;
        insert(tx, "after")
    })
}

/// Like [`nest`], failing in the scope at `fail_depth`.
fn nest_with_failure(conn: &Connection, levels: usize, fail_depth: usize) -> Result<()> {
    if levels == 0 {
        return Ok(());
    }
    conn.atomic(|tx| {
        insert(tx, "row")?;
        if tx.depth() == Some(fail_depth) {
            return Err(Error::argument("scope failed"));
        }
        nest_with_failure(tx, levels - 1, fail_depth)
    })
}

#[test]
fn nested_commit_keeps_both_rows() {
    let (conn, probe) = fresh();
    conn.atomic(|tx| {
        insert(tx, "A")?;
        tx.atomic(|inner| insert(inner, "B"))
    })
    .unwrap();
    assert_eq!(visible(&conn).unwrap(), 2);
    assert_eq!(probe.committed_names(), vec!["A", "B"]);
    assert_eq!(probe.count(&Call::Commit), 1);
    assert_eq!(probe.count(&Call::ReleaseSavepoint("sp1".into())), 1);
}

#[test]
fn nested_failure_discards_both_rows() {
    let (conn, probe) = fresh();
    let err = conn
        .atomic(|tx| {
            insert(tx, "A")?;
            tx.atomic(|inner| {
                insert(inner, "B")?;
                Err::<(), _>(Error::argument("thrown at depth 1"))
            })
        })
        .unwrap_err();
    assert!(err.is_argument());
    assert_eq!(visible(&conn).unwrap(), 0);
    assert_eq!(probe.count(&Call::Commit), 0);
    assert_eq!(probe.count(&Call::Rollback), 1);
    assert_eq!(probe.count(&Call::RollbackToSavepoint("sp1".into())), 1);
}

#[test]
fn scope_values_do_not_leak_outward() {
    let (conn, _probe) = fresh();
    conn.atomic(|tx| {
        assert!(tx.in_transaction());
        assert!(!conn.in_transaction());
        tx.atomic(|inner| {
            assert_eq!(inner.depth(), Some(1));
            assert_eq!(tx.depth(), Some(0));
            Ok::<_, Error>(())
        })
    })
    .unwrap();
    assert_eq!(conn.depth(), None);
}

#[test]
fn prior_autocommit_restored_after_failure() {
    let (conn, probe) = fresh();
    let _ = conn.atomic(|tx| {
        insert(tx, "x")?;
        Err::<(), _>(Error::argument("fail"))
    });
    assert!(probe.auto_commit());
    assert!(!probe.in_physical_transaction());
}

#[test]
fn savepoint_failure_is_transaction_error() {
    let (conn, probe) = fresh();
    probe.fail_next(FailPoint::Savepoint);
    let err = conn
        .atomic(|tx| tx.atomic(|inner| insert(inner, "never")))
        .unwrap_err();
    assert!(err.is_transaction());
    assert_eq!(probe.count(&Call::Rollback), 1);
    assert!(probe.committed().is_empty());
}

#[test]
fn commit_failure_leaves_raw_transaction_to_the_caller() {
    let (conn, probe) = fresh();
    probe.fail_next(FailPoint::Commit);
    let err = conn.atomic(|tx| insert(tx, "pending")).unwrap_err();
    assert!(err.is_transaction());
    assert!(!probe.auto_commit());
    assert!(probe.in_physical_transaction());
    conn.close().unwrap();
    assert!(probe.committed().is_empty());
}

#[test]
fn rollback_failure_masks_the_original_error() {
    let (conn, probe) = fresh();
    probe.fail_next(FailPoint::Rollback);
    let err = conn
        .atomic(|_tx| Err::<(), _>(Error::argument("original")))
        .unwrap_err();
    assert!(err.is_transaction());
}

#[test]
fn depth_zero_options_are_applied_and_restored() {
    let (conn, probe) = fresh();
    let opts = TransactionOptions::new()
        .isolation(IsolationLevel::Serializable)
        .read_only(true);
    conn.atomic_with(&opts, |tx| {
        assert_eq!(tx.raw()?.isolation()?, IsolationLevel::Serializable);
        assert!(tx.raw()?.is_read_only()?);
        Ok::<_, Error>(())
    })
    .unwrap();
    assert_eq!(probe.isolation(), IsolationLevel::ReadCommitted);
    assert!(!probe.read_only());
    assert_eq!(
        probe.calls()[1..],
        [
            Call::SetIsolation(IsolationLevel::Serializable),
            Call::SetReadOnly(true),
            Call::SetAutoCommit(false),
            Call::Commit,
            Call::SetAutoCommit(true),
            Call::SetIsolation(IsolationLevel::ReadCommitted),
            Call::SetReadOnly(false),
        ]
    );
}

#[test]
fn panic_rolls_back_before_unwinding() {
    let (conn, probe) = fresh();
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        conn.atomic(|tx| -> Result<()> {
            insert(tx, "lost")?;
            panic!("scope body panicked");
        })
    }));
    assert!(caught.is_err());
    assert_eq!(probe.count(&Call::Rollback), 1);
    assert!(probe.committed().is_empty());
    assert!(probe.auto_commit());
}

proptest! {
    #[test]
    fn n_nested_scopes_commit_exactly_once(levels in 1usize..10) {
        let (conn, probe) = fresh();
        nest(&conn, levels).unwrap();
        prop_assert_eq!(probe.count(&Call::Commit), 1);
        prop_assert_eq!(probe.count(&Call::Rollback), 0);
        let savepoints = probe
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::Savepoint(_)))
            .count();
        prop_assert_eq!(savepoints, levels - 1);
        prop_assert_eq!(probe.committed().len(), levels);
        prop_assert!(probe.savepoint_names().is_empty());
    }

    #[test]
    fn rollback_flag_at_any_depth_discards_everything(levels in 1usize..8, pick in 0usize..8) {
        let flag_depth = pick % levels;
        let (conn, probe) = fresh();
        nest_with_flag(&conn, levels, flag_depth).unwrap();
        prop_assert_eq!(probe.count(&Call::Commit), 0);
        prop_assert_eq!(probe.count(&Call::Rollback), 1);
        prop_assert!(probe.committed().is_empty());
        prop_assert_eq!(visible(&conn).unwrap(), 0);
    }

    #[test]
    fn failure_at_any_depth_discards_everything(levels in 1usize..8, pick in 0usize..8) {
        let fail_depth = pick % levels;
        let (conn, probe) = fresh();
        let err = nest_with_failure(&conn, levels, fail_depth).unwrap_err();
        prop_assert!(err.is_argument());
        prop_assert_eq!(probe.count(&Call::Commit), 0);
        prop_assert_eq!(probe.count(&Call::Rollback), 1);
        prop_assert!(probe.committed().is_empty());
        prop_assert!(probe.auto_commit());
    }

    #[test]
    fn nested_options_never_change_physical_settings(
        levels in 2usize..6,
        inner in prop::sample::select(vec![
            IsolationLevel::ReadUncommitted,
            IsolationLevel::RepeatableRead,
            IsolationLevel::None,
        ]),
        inner_read_only in any::<bool>(),
    ) {
        let (conn, probe) = fresh();
        let outer = TransactionOptions::new().isolation(IsolationLevel::Serializable);
        let inner_opts = TransactionOptions::new().isolation(inner).read_only(inner_read_only);

        fn descend(conn: &Connection, remaining: usize, opts: &TransactionOptions) -> Result<()> {
            if remaining == 0 {
                assert_eq!(conn.raw()?.isolation()?, IsolationLevel::Serializable);
                assert!(!conn.raw()?.is_read_only()?);
                return Ok(());
            }
            conn.atomic_with(opts, |tx| descend(tx, remaining - 1, opts))
        }

        conn.atomic_with(&outer, |tx| descend(tx, levels - 1, &inner_opts)).unwrap();
        let inner_sets = probe
            .calls()
            .iter()
            .filter(|c| matches!(c, Call::SetIsolation(level) if *level == inner))
            .count();
        prop_assert_eq!(inner_sets, 0);
        prop_assert_eq!(probe.count(&Call::SetReadOnly(true)), 0);
    }
}

#[test]
fn returned_value_survives_commit() {
    let (conn, _probe) = fresh();
    let value: Value = conn
        .atomic(|tx| {
            insert(tx, "kept")?;
            Ok::<_, Error>(Value::from(visible(tx)? as i64))
        })
        .unwrap();
    assert_eq!(value, Value::Int(1));
}
