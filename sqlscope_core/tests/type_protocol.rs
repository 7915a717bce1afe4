use std::sync::Once;

use proptest::prelude::*;
use sqlscope_core::{
    params, register_column_kind, register_param_type, ColumnKind, Connection, DriverValue,
    ExecuteOptions, Object, ParamConverter, QueryOptions, ResultMetadata, Result, Value,
};
use tests_common::{Call, MemoryDriver, MemoryProbe};

/// Application-side composite type.
#[derive(Clone, Debug, PartialEq)]
struct Point {
    x: i32,
    y: i32,
}

/// Driver-native representation, standing in for a database composite type.
#[derive(Debug)]
struct NativePoint(String);

struct PointParam;

impl ParamConverter<Point> for PointParam {
    fn to_driver(&self, value: &Point, _conn: &Connection) -> Result<DriverValue> {
        Ok(DriverValue::Opaque(Object::new(NativePoint(format!(
            "({},{})",
            value.x, value.y
        )))))
    }
}

fn decode_point(
    value: DriverValue,
    _conn: &Connection,
    _meta: &ResultMetadata,
    _index: usize,
) -> Result<Value> {
    let parsed = match &value {
        DriverValue::Opaque(object) => object.downcast_ref::<NativePoint>().and_then(|native| {
            let (x, y) = native.0.trim_matches(&['(', ')'][..]).split_once(',')?;
            Some(Point {
                x: x.parse().ok()?,
                y: y.parse().ok()?,
            })
        }),
        _ => None,
    };
    parsed
        .map(Value::object)
        .ok_or_else(|| sqlscope_core::Error::argument(format!("not a point: {value:?}")))
}

fn register_point() {
    static REGISTER: Once = Once::new();
    REGISTER.call_once(|| {
        register_param_type::<Point, _>(PointParam).expect("register point parameter");
        register_column_kind(ColumnKind::opaque::<NativePoint>(), decode_point)
            .expect("register point column");
    });
}

fn fresh() -> (Connection, MemoryProbe) {
    register_point();
    let driver = MemoryDriver::new();
    let probe = driver.probe();
    (Connection::from_raw(driver.raw_connection()), probe)
}

fn round_trip(conn: &Connection, value: Value) -> Result<Value> {
    conn.execute("DELETE FROM items")?;
    conn.execute(("INSERT INTO items(name) VALUES (?)", vec![value]))?;
    let rows = conn.query("SELECT name FROM items", &QueryOptions::default())?;
    Ok(rows[0].get("name").cloned().unwrap_or(Value::Null))
}

#[test]
fn registered_composite_round_trips() {
    let (conn, probe) = fresh();
    let back = round_trip(&conn, Value::object(Point { x: 3, y: -4 })).unwrap();
    assert_eq!(back.downcast_ref::<Point>(), Some(&Point { x: 3, y: -4 }));

    let stored = probe.committed();
    match stored[0].values.get("name") {
        Some(DriverValue::Opaque(o)) => assert!(o.is::<NativePoint>()),
        other => panic!("expected native point, stored {other:?}"),
    }
}

#[test]
fn null_round_trips_for_composite_columns() {
    let (conn, _probe) = fresh();
    let back = round_trip(&conn, Value::from(None::<i64>)).unwrap();
    assert_eq!(back, Value::Null);
}

#[test]
fn duplicate_registration_is_rejected() {
    register_point();
    assert!(register_param_type::<Point, _>(PointParam)
        .unwrap_err()
        .is_argument());
    assert!(
        register_column_kind(ColumnKind::opaque::<NativePoint>(), decode_point)
            .unwrap_err()
            .is_argument()
    );
}

#[test]
fn arrays_go_through_the_connection_factory() {
    let (conn, probe) = fresh();
    let value = Value::Array(vec![Value::from("a"), Value::Null, Value::from("b")]);
    let back = round_trip(&conn, value.clone()).unwrap();
    assert_eq!(back, value);
    assert_eq!(probe.count(&Call::CreateArray("text".into())), 1);
}

#[test]
fn composite_values_in_batches_and_returning() {
    let (conn, _probe) = fresh();
    let out = conn
        .execute_prepared(
            "INSERT INTO items(name) VALUES (?)",
            &[
                vec![Value::object(Point { x: 1, y: 1 })],
                vec![Value::object(Point { x: 2, y: 2 })],
            ],
            &ExecuteOptions::new().returning_all(),
        )
        .unwrap();
    let rows = out.rows().unwrap();
    let xs: Vec<i32> = rows
        .iter()
        .filter_map(|r| r.get("name").and_then(|v| v.downcast_ref::<Point>()).map(|p| p.x))
        .collect();
    assert_eq!(xs, vec![1, 2]);
}

#[test]
fn scalars_keep_their_types() {
    let (conn, _probe) = fresh();
    for value in params![true, 7_i64, 2.5_f64, "text", vec![0_u8, 1, 2]] {
        assert_eq!(round_trip(&conn, value.clone()).unwrap(), value);
    }
}

proptest! {
    #[test]
    fn any_point_round_trips(x in any::<i32>(), y in any::<i32>()) {
        let (conn, _probe) = fresh();
        let back = round_trip(&conn, Value::object(Point { x, y })).unwrap();
        prop_assert_eq!(back.downcast_ref::<Point>(), Some(&Point { x, y }));
    }
}
