use std::sync::Arc;

use sqlscope_core::{
    with_connection, Connection, ConnectionSpec, Error, IsolationLevel, NoopStrategy,
    QueryOptions,
};
use tests_common::{suites, Call, ConnectionFactory, FailPoint, MemoryDriver, MemoryProbe};

struct Registered {
    name: &'static str,
}

impl ConnectionFactory for Registered {
    fn connect(&self) -> sqlscope_core::Result<Connection> {
        // A fresh database per connection keeps the suites independent.
        MemoryDriver::register(self.name);
        let conn = Connection::open(&ConnectionSpec::new(self.name))?;
        conn.execute(tests_common::migrations::MEMORY_ITEMS_SQL)?;
        Ok(conn)
    }
}

#[test]
fn suites_pass_through_the_registry() -> sqlscope_core::Result<()> {
    suites::run_all(&Registered {
        name: "memory-suites",
    })
}

#[test]
fn open_then_close_leaves_no_handle() {
    let probe = MemoryDriver::register("memory-open-close");
    let conn = Connection::open(&"memory-open-close://localhost/db".parse().unwrap()).unwrap();
    assert_eq!(probe.open_handles(), 1);
    assert_eq!(conn.driver_name(), Some("memory-open-close"));
    conn.close().unwrap();
    assert_eq!(probe.open_handles(), 0);
    assert!(conn.close().unwrap_err().is_connection());
    assert_eq!(probe.count(&Call::Close), 1);
}

#[test]
fn dropping_an_unclosed_connection_releases_it() {
    let probe = MemoryDriver::register("memory-drop");
    {
        let conn = Connection::open(&ConnectionSpec::new("memory-drop")).unwrap();
        let _clone = conn.clone();
    }
    assert_eq!(probe.open_handles(), 0);
}

#[test]
fn spec_settings_are_applied_on_open() {
    let probe = MemoryDriver::register("memory-settings");
    let spec: ConnectionSpec = "memory-settings://h/db?isolation-level=repeatable-read&read-only=true"
        .parse()
        .unwrap();
    let conn = Connection::open(&spec).unwrap();
    assert_eq!(probe.isolation(), IsolationLevel::RepeatableRead);
    assert!(probe.read_only());
    assert_eq!(conn.isolation_level(), Some(IsolationLevel::RepeatableRead));
    assert!(conn.is_read_only());
}

#[test]
fn classname_resolves_before_subprotocol() {
    let probe = MemoryDriver::register("memory-classname");
    let spec = ConnectionSpec::new("unregistered-vendor").with_classname("memory-classname");
    let conn = Connection::open(&spec).unwrap();
    assert_eq!(probe.open_handles(), 1);
    conn.close().unwrap();
}

#[test]
fn driver_failures_on_open_are_connection_errors() {
    let probe = MemoryDriver::register("memory-connect-fails");
    probe.fail_next(FailPoint::Connect);
    let err = Connection::open(&ConnectionSpec::new("memory-connect-fails")).unwrap_err();
    assert!(err.is_connection());

    probe.fail_next(FailPoint::SetIsolation);
    let spec = ConnectionSpec::new("memory-connect-fails")
        .with_isolation_level(IsolationLevel::Serializable);
    let err = Connection::open(&spec).unwrap_err();
    assert!(err.is_connection());
    assert_eq!(probe.open_handles(), 0);
}

#[test]
fn unknown_driver_is_a_config_error() {
    let err = Connection::open(&ConnectionSpec::new("memory-never-registered")).unwrap_err();
    assert!(err.is_config());
}

#[test]
fn with_connection_always_closes() {
    let probe: MemoryProbe = MemoryDriver::register("memory-scoped");
    let spec = ConnectionSpec::new("memory-scoped");

    let rows = with_connection(&spec, |conn| {
        conn.execute("INSERT INTO items(name) VALUES ('a')")?;
        conn.query("SELECT id, name FROM items", &QueryOptions::default())
    })
    .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(probe.open_handles(), 0);

    let err = with_connection(&spec, |_conn| Err::<(), _>(Error::argument("body failed")))
        .unwrap_err();
    assert!(err.is_argument());
    assert_eq!(probe.open_handles(), 0);

    probe.fail_next(FailPoint::Close);
    let err = with_connection(&spec, |_conn| Ok::<_, Error>(())).unwrap_err();
    assert!(err.is_connection());
}

#[test]
fn noop_strategy_leaves_the_driver_alone() {
    let probe = MemoryDriver::register("memory-noop");
    let conn = Connection::open(&ConnectionSpec::new("memory-noop"))
        .unwrap()
        .with_strategy(Arc::new(NoopStrategy));
    probe.clear_calls();
    conn.atomic(|tx| {
        tx.execute("INSERT INTO items(name) VALUES ('external')")?;
        tx.set_rollback();
        Ok::<_, Error>(())
    })
    .unwrap();
    assert_eq!(
        probe.calls(),
        vec![Call::Execute("INSERT INTO items(name) VALUES ('external')".into())]
    );
    assert_eq!(probe.committed_names(), vec!["external"]);
}

#[test]
fn labels_differing_only_in_case_keep_both_values() {
    MemoryDriver::register("memory-case-labels");
    let conn = Connection::open(&ConnectionSpec::new("memory-case-labels")).unwrap();
    conn.execute("INSERT INTO items(name) VALUES ('a')").unwrap();
    let row = conn
        .fetch_one(
            "SELECT name, name AS \"NAME\" FROM items",
            &QueryOptions::default(),
        )
        .unwrap()
        .unwrap();
    assert_eq!(row.get("name"), Some(&sqlscope_core::Value::from("a")));
    assert_eq!(row.get("name_2"), Some(&sqlscope_core::Value::from("a")));

    let exact = conn
        .fetch_one(
            "SELECT name, name AS \"NAME\" FROM items",
            &QueryOptions::preserve_case(),
        )
        .unwrap()
        .unwrap();
    assert!(exact.get("NAME").is_some());
    assert!(exact.get("name_2").is_none());
}

#[test]
fn prepared_statements_fail_after_close() {
    let probe = MemoryDriver::register("memory-closed-statements");
    let conn = Connection::open(&ConnectionSpec::new("memory-closed-statements")).unwrap();
    let mut stmt = conn
        .prepare(("INSERT INTO items(name) VALUES (?)", sqlscope_core::params!["late"]))
        .unwrap();
    conn.close().unwrap();
    assert!(conn.execute(&mut stmt).unwrap_err().is_connection());
    assert!(probe.committed_names().is_empty());
}
