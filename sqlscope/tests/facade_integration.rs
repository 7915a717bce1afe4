#![allow(unexpected_cfgs)]
#![cfg(feature = "libsql-backend")]

use sqlscope::{params, ConnectionSpec, Error, QueryOptions, Result};

fn count(conn: &sqlscope::Connection) -> Result<i64> {
    let row = conn
        .fetch_one("SELECT COUNT(*) AS n FROM notes", &QueryOptions::default())?
        .ok_or_else(|| Error::argument("count returned no row"))?;
    Ok(row.get("n").and_then(|v| v.as_i64()).unwrap_or_default())
}

#[test]
fn in_memory_round_trip_through_the_facade() -> Result<()> {
    let conn = sqlscope::open_uri("sqlite::memory:")?;
    assert_eq!(conn.driver_name(), Some("sqlite"));
    conn.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT)")?;

    conn.atomic(|tx| {
        tx.execute(("INSERT INTO notes(body) VALUES (?)", params!["kept"]))?;
        let nested: Result<()> = tx.atomic(|inner| {
            inner.execute(("INSERT INTO notes(body) VALUES (?)", params!["discarded"]))?;
            Err(Error::argument("undo the inner scope"))
        });
        assert!(nested.is_err());
        Ok::<_, Error>(())
    })?;

    let rows = conn.query("SELECT body FROM notes", &QueryOptions::default())?;
    let bodies: Vec<_> = rows
        .iter()
        .filter_map(|r| r.get("body").and_then(|v| v.as_str()))
        .collect();
    assert_eq!(bodies, vec!["kept"]);
    conn.close()
}

#[test]
fn with_connection_closes_on_error() -> Result<()> {
    let dir = tempfile::tempdir().expect("temp dir");
    let spec = ConnectionSpec::new("libsql").with_name(dir.path().join("notes.db").display().to_string());

    sqlscope::with_connection(&spec, |conn| {
        conn.execute("CREATE TABLE notes (id INTEGER PRIMARY KEY AUTOINCREMENT, body TEXT)")
    })?;

    let err = sqlscope::with_connection(&spec, |conn| -> Result<()> {
        conn.atomic(|tx| {
            tx.execute(("INSERT INTO notes(body) VALUES (?)", params!["lost"]))?;
            Err(Error::argument("caller gave up"))
        })
    })
    .unwrap_err();
    assert!(err.is_argument());

    let remaining = sqlscope::with_connection(&spec, count)?;
    assert_eq!(remaining, 0);
    Ok(())
}
