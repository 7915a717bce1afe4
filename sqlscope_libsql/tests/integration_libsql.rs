#![allow(unexpected_cfgs)]
#![cfg(feature = "libsql-backend")]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlscope_core::{params, Connection, ConnectionSpec, Error, QueryOptions, Result};
use sqlscope_libsql::LibsqlDriver;
use tests_common::{migrations, suites, ConnectionFactory};

/// Opens a fresh database file per connection through the driver registry.
struct FileFactory {
    dir: tempfile::TempDir,
    next: AtomicUsize,
}

impl FileFactory {
    fn new() -> Self {
        LibsqlDriver::register();
        Self {
            dir: tempfile::tempdir().expect("temp dir"),
            next: AtomicUsize::new(0),
        }
    }

    fn path(&self, n: usize) -> PathBuf {
        self.dir.path().join(format!("sqlscope_{n}.db"))
    }
}

impl ConnectionFactory for FileFactory {
    fn connect(&self) -> Result<Connection> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        let uri = format!("sqlite://{}", self.path(n).display());
        let conn = Connection::open(&uri.parse()?)?;
        conn.execute(migrations::LIBSQL_ITEMS_SQL)?;
        Ok(conn)
    }
}

#[test]
fn libsql_runs_the_common_suites() -> Result<()> {
    suites::run_all(&FileFactory::new())
}

fn open_shared(path: &std::path::Path) -> Result<Connection> {
    let spec = ConnectionSpec::new("libsql").with_name(path.display().to_string());
    let conn = Connection::open(&spec)?;
    conn.execute(migrations::LIBSQL_ITEMS_SQL)?;
    Ok(conn)
}

fn names(conn: &Connection) -> Result<Vec<String>> {
    Ok(conn
        .query("SELECT name FROM items ORDER BY id", &QueryOptions::default())?
        .into_iter()
        .filter_map(|row| row.get("name").and_then(|v| v.as_str()).map(str::to_string))
        .collect())
}

#[test]
fn uncommitted_work_is_invisible_to_other_connections() -> Result<()> {
    LibsqlDriver::register();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("shared.db");
    let writer = open_shared(&path)?;
    let reader = open_shared(&path)?;

    writer.atomic(|tx| {
        tx.execute(("INSERT INTO items(name) VALUES (?)", params!["pending"]))?;
        tx.atomic(|nested| {
            nested.execute(("INSERT INTO items(name) VALUES (?)", params!["nested"]))
        })?;
        assert!(names(&reader)?.is_empty());
        Ok::<_, Error>(())
    })?;
    assert_eq!(names(&reader)?, vec!["pending", "nested"]);

    writer.close()?;
    reader.close()
}

#[test]
fn failed_scope_leaves_the_file_untouched() -> Result<()> {
    LibsqlDriver::register();
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("rollback.db");
    let conn = open_shared(&path)?;

    let err = conn
        .atomic(|tx| {
            tx.execute(("INSERT INTO items(name) VALUES (?)", params!["kept?"]))?;
            tx.atomic(|nested| nested.execute("INSERT INTO no_such_table VALUES (1)"))
        })
        .unwrap_err();
    assert!(err.is_driver());
    conn.close()?;

    let reopened = open_shared(&path)?;
    assert!(names(&reopened)?.is_empty());
    reopened.close()
}

#[test]
fn cursor_streams_inside_a_transaction() -> Result<()> {
    let factory = FileFactory::new();
    let conn = factory.connect()?;
    conn.execute_prepared(
        "INSERT INTO items(name) VALUES (?)",
        &(0..50).map(|i| params![format!("row {i}")]).collect::<Vec<_>>(),
        &Default::default(),
    )?;
    let total = conn.atomic(|tx| {
        let mut seen = 0;
        for row in tx.cursor("SELECT id, name FROM items", &QueryOptions::default())? {
            row?;
            seen += 1;
        }
        Ok::<_, Error>(seen)
    })?;
    assert_eq!(total, 50);
    conn.close()
}
