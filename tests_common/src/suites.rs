//! Backend-agnostic behavioural suites.
//!
//! Each suite takes a [`ConnectionFactory`] and asserts the observable
//! contract of connections, nested transactions and statement execution
//! against whatever driver the factory opens.

use sqlscope_core::{
    params, Connection, Error, ExecuteOptions, Executed, IsolationLevel, QueryOptions, Result,
    Row, TransactionOptions, Value,
};

pub trait ConnectionFactory {
    /// Open a fresh connection to a database with an empty `items(id, name)` table.
    fn connect(&self) -> Result<Connection>;
}

const INSERT: &str = "INSERT INTO items(name) VALUES (?)";

fn insert(conn: &Connection, name: &str) -> Result<()> {
    conn.execute((INSERT, params![name]))?;
    Ok(())
}

/// Number of rows visible to `conn`.
pub fn count_items(conn: &Connection) -> Result<i64> {
    let row = conn
        .fetch_one("SELECT COUNT(*) AS n FROM items", &QueryOptions::default())?
        .ok_or_else(|| Error::argument("COUNT(*) returned no row"))?;
    row.get("n")
        .and_then(Value::as_i64)
        .ok_or_else(|| Error::argument(format!("unexpected COUNT(*) row {row:?}")))
}

pub fn test_open_close<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    assert!(!conn.is_closed());
    conn.close()?;
    assert!(conn.is_closed());
    assert!(conn.close().unwrap_err().is_connection());
    assert!(conn.execute("DELETE FROM items").unwrap_err().is_connection());
    Ok(())
}

pub fn test_nested_commit_persists_all<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    conn.atomic(|tx| {
        insert(tx, "a")?;
        tx.atomic(|inner| {
            assert_eq!(inner.depth(), Some(1));
            insert(inner, "b")
        })
    })?;
    assert_eq!(count_items(&conn)?, 2);
    conn.close()
}

pub fn test_inner_failure_rolls_back_all<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    let outcome = conn.atomic(|tx| {
        insert(tx, "a")?;
        tx.atomic(|inner| {
            insert(inner, "b")?;
            Err::<(), _>(Error::argument("inner scope failed"))
        })
    });
    assert!(outcome.unwrap_err().is_argument());
    assert!(!conn.in_transaction());
    assert_eq!(count_items(&conn)?, 0);
    conn.close()
}

pub fn test_caught_inner_failure_still_rolls_back<F: ConnectionFactory + ?Sized>(
    f: &F,
) -> Result<()> {
    let conn = f.connect()?;
    conn.atomic(|tx| {
        insert(tx, "a")?;
        let inner = tx.atomic(|inner| {
            insert(inner, "b")?;
            Err::<(), _>(Error::argument("swallowed by the caller"))
        });
        assert!(inner.is_err());
        assert!(tx.is_rollback_set());
        Ok::<_, Error>(())
    })?;
    assert_eq!(count_items(&conn)?, 0);
    conn.close()
}

pub fn test_set_rollback_at_depth<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    conn.atomic(|tx| {
        insert(tx, "a")?;
        tx.atomic(|d1| {
            d1.atomic(|d2| {
                assert_eq!(d2.depth(), Some(2));
                d2.set_rollback();
                Ok::<_, Error>(())
            })?;
            insert(d1, "b")
        })?;
        assert!(tx.is_rollback_set());
        insert(tx, "c")?;
        assert_eq!(count_items(tx)?, 2);
        Ok::<_, Error>(())
    })?;
    assert_eq!(count_items(&conn)?, 0);
    conn.close()
}

pub fn test_inner_isolation_ignored<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    let before = conn.raw()?.isolation()?;
    let outer = TransactionOptions::new().isolation(IsolationLevel::Serializable);
    conn.atomic_with(&outer, |tx| {
        assert_eq!(tx.raw()?.isolation()?, IsolationLevel::Serializable);
        let inner = TransactionOptions::new()
            .isolation(IsolationLevel::ReadUncommitted)
            .read_only(true);
        tx.atomic_with(&inner, |nested| {
            assert_eq!(nested.raw()?.isolation()?, IsolationLevel::Serializable);
            assert_eq!(nested.isolation_level(), Some(IsolationLevel::Serializable));
            insert(nested, "written despite read-only request")
        })
    })?;
    assert_eq!(conn.raw()?.isolation()?, before);
    assert_eq!(count_items(&conn)?, 1);
    conn.close()
}

pub fn test_autocommit_restored<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    assert!(conn.raw()?.auto_commit()?);
    conn.atomic(|tx| {
        assert!(!tx.raw()?.auto_commit()?);
        insert(tx, "a")
    })?;
    assert!(conn.raw()?.auto_commit()?);
    let _ = conn.atomic(|tx| {
        insert(tx, "b")?;
        Err::<(), _>(Error::argument("abort"))
    });
    assert!(conn.raw()?.auto_commit()?);
    assert_eq!(count_items(&conn)?, 1);
    conn.close()
}

pub fn test_read_only_transaction<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    let opts = TransactionOptions::new().read_only(true);
    let err = conn.atomic_with(&opts, |tx| insert(tx, "refused")).unwrap_err();
    assert!(err.is_driver(), "expected driver error, got {err:?}");
    assert!(!conn.raw()?.is_read_only()?);
    insert(&conn, "accepted")?;
    assert_eq!(count_items(&conn)?, 1);
    conn.close()
}

pub fn test_execute_prepared_batch_and_returning<F: ConnectionFactory + ?Sized>(
    f: &F,
) -> Result<()> {
    let conn = f.connect()?;
    let counts = conn.execute_prepared(
        INSERT,
        &[params!["a"], params!["b"], params!["c"]],
        &ExecuteOptions::default(),
    )?;
    assert_eq!(counts, Executed::Counts(vec![1, 1, 1]));

    let returned = conn.execute_prepared(
        INSERT,
        &[params!["d"], params!["e"]],
        &ExecuteOptions::new().returning(["id"]),
    )?;
    let rows = returned.rows().expect("returning yields rows");
    assert_eq!(rows.len(), 2);
    let ids: Vec<i64> = rows
        .iter()
        .filter_map(|r| r.get("id").and_then(Value::as_i64))
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);

    let mismatched = conn.execute_prepared(
        INSERT,
        &[params!["f"], params!["g", "h"]],
        &ExecuteOptions::default(),
    );
    assert!(mismatched.unwrap_err().is_argument());
    assert_eq!(count_items(&conn)?, 5);
    conn.close()
}

pub fn test_query_identifiers_and_rows<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    insert(&conn, "widget")?;
    let sql = "SELECT name AS \"Name\" FROM items";

    let lowered = conn.query(sql, &QueryOptions::default())?;
    assert_eq!(lowered[0].get("name"), Some(&Value::from("widget")));
    assert!(lowered[0].get("Name").is_none());

    let exact = conn.query(sql, &QueryOptions::preserve_case())?;
    assert_eq!(exact[0].get("Name"), Some(&Value::from("widget")));

    let positional = conn.query(sql, &QueryOptions::new().as_rows(true))?;
    assert_eq!(positional, vec![Row::Values(vec![Value::from("widget")])]);

    let filtered = conn.query(
        ("SELECT id, name FROM items WHERE name = ?", params!["nothing"]),
        &QueryOptions::default(),
    )?;
    assert!(filtered.is_empty());
    conn.close()
}

pub fn test_cursor_requires_transaction<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    for name in ["a", "b", "c"] {
        insert(&conn, name)?;
    }
    let outside = conn.cursor("SELECT id, name FROM items", &QueryOptions::default());
    assert!(outside.unwrap_err().is_argument());

    let names = conn.atomic(|tx| {
        tx.cursor(
            "SELECT id, name FROM items ORDER BY id",
            &QueryOptions::new().max_rows(2),
        )?
        .map(|row| row.map(|r| r.get("name").cloned()))
        .collect::<Result<Vec<_>>>()
    })?;
    assert_eq!(names, vec![Some(Value::from("a")), Some(Value::from("b"))]);
    conn.close()
}

pub fn test_prepared_statement_reuse<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    let mut stmt = conn.prepare(INSERT)?;
    assert_eq!(stmt.parameter_count(), 1);
    conn.execute_prepared(&mut stmt, &[params!["a"]], &ExecuteOptions::default())?;
    conn.execute_prepared(
        &mut stmt,
        &[params!["b"], params!["c"]],
        &ExecuteOptions::default(),
    )?;
    drop(stmt);

    let mut bound = conn.prepare((INSERT, params!["d"]))?;
    conn.execute(&mut bound)?;
    drop(bound);
    assert_eq!(count_items(&conn)?, 4);
    conn.close()
}

pub fn test_batch_descriptor<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    let conn = f.connect()?;
    let counts = conn.execute(vec![
        "INSERT INTO items(name) VALUES ('x')",
        "INSERT INTO items(name) VALUES ('y')",
        "DELETE FROM items WHERE name = 'x'",
    ])?;
    assert_eq!(counts, vec![1, 1, 1]);
    assert_eq!(count_items(&conn)?, 1);
    conn.close()
}

/// Run every suite in this module.
pub fn run_all<F: ConnectionFactory + ?Sized>(f: &F) -> Result<()> {
    test_open_close(f)?;
    test_nested_commit_persists_all(f)?;
    test_inner_failure_rolls_back_all(f)?;
    test_caught_inner_failure_still_rolls_back(f)?;
    test_set_rollback_at_depth(f)?;
    test_inner_isolation_ignored(f)?;
    test_autocommit_restored(f)?;
    test_read_only_transaction(f)?;
    test_execute_prepared_batch_and_returning(f)?;
    test_query_identifiers_and_rows(f)?;
    test_cursor_requires_transaction(f)?;
    test_prepared_statement_reuse(f)?;
    test_batch_descriptor(f)?;
    Ok(())
}
