//! The type protocol: host values to driver values and back.
//!
//! Conversions are dispatched on the runtime type of the value being
//! converted. Parameter conversions are keyed by the `TypeId` of a user type
//! wrapped in [`Value::Object`]; column conversions are keyed by the
//! [`ColumnKind`] of the driver value. Both registries are process-wide and
//! append-only. Anything unregistered falls back to the built-in behaviour:
//! scalars pass through, unknown user objects reach the driver as
//! [`DriverValue::Opaque`], and opaque driver objects come back as
//! [`Value::Object`].

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use crate::connection::Connection;
use crate::driver::{RawStatement, ResultMetadata};
use crate::value::{ColumnKind, DriverValue, Object, Value};
use crate::{Error, Result};

/// Conversion of a user type `T` into a driver parameter.
pub trait ParamConverter<T>: Send + Sync {
    /// Build the driver representation. The connection is only consulted for
    /// connection-scoped factories such as [`Connection::create_array`].
    fn to_driver(&self, value: &T, conn: &Connection) -> Result<DriverValue>;

    /// Bind `value` at the 1-based `index`. Override to call a type-specific setter.
    fn bind(
        &self,
        value: &T,
        conn: &Connection,
        stmt: &mut dyn RawStatement,
        index: usize,
    ) -> Result<()> {
        let driver_value = self.to_driver(value, conn)?;
        stmt.set_object(index, driver_value).map_err(Error::driver)
    }
}

/// Conversion of one column's driver value into a host value.
pub trait ColumnConverter: Send + Sync {
    fn from_driver(
        &self,
        value: DriverValue,
        conn: &Connection,
        meta: &ResultMetadata,
        index: usize,
    ) -> Result<Value>;
}

impl<F> ColumnConverter for F
where
    F: Fn(DriverValue, &Connection, &ResultMetadata, usize) -> Result<Value> + Send + Sync,
{
    fn from_driver(
        &self,
        value: DriverValue,
        conn: &Connection,
        meta: &ResultMetadata,
        index: usize,
    ) -> Result<Value> {
        self(value, conn, meta, index)
    }
}

trait ErasedParam: Send + Sync {
    fn to_driver(&self, object: &Object, conn: &Connection) -> Result<DriverValue>;
    fn bind(
        &self,
        object: &Object,
        conn: &Connection,
        stmt: &mut dyn RawStatement,
        index: usize,
    ) -> Result<()>;
}

struct Typed<T, C> {
    converter: C,
    _type: PhantomData<fn(&T)>,
}

impl<T, C> Typed<T, C>
where
    T: Any,
{
    fn unwrap<'o>(&self, object: &'o Object) -> Result<&'o T> {
        object.downcast_ref::<T>().ok_or_else(|| {
            Error::argument(format!(
                "converter for {} received a {}",
                std::any::type_name::<T>(),
                object.type_name()
            ))
        })
    }
}

impl<T, C> ErasedParam for Typed<T, C>
where
    T: Any + Send + Sync,
    C: ParamConverter<T>,
{
    fn to_driver(&self, object: &Object, conn: &Connection) -> Result<DriverValue> {
        self.converter.to_driver(self.unwrap(object)?, conn)
    }

    fn bind(
        &self,
        object: &Object,
        conn: &Connection,
        stmt: &mut dyn RawStatement,
        index: usize,
    ) -> Result<()> {
        self.converter.bind(self.unwrap(object)?, conn, stmt, index)
    }
}

type ParamTable = RwLock<HashMap<TypeId, Arc<dyn ErasedParam>>>;
type ColumnTable = RwLock<HashMap<ColumnKind, Arc<dyn ColumnConverter>>>;

fn param_table() -> &'static ParamTable {
    static TABLE: OnceLock<ParamTable> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

fn column_table() -> &'static ColumnTable {
    static TABLE: OnceLock<ColumnTable> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register the parameter conversion for values of type `T`.
///
/// Registration is append-only: a second converter for the same type is rejected.
pub fn register_param_type<T, C>(converter: C) -> Result<()>
where
    T: Any + Send + Sync,
    C: ParamConverter<T> + 'static,
{
    let mut table = param_table().write().unwrap_or_else(PoisonError::into_inner);
    let key = TypeId::of::<T>();
    if table.contains_key(&key) {
        return Err(Error::argument(format!(
            "a parameter converter for {} is already registered",
            std::any::type_name::<T>()
        )));
    }
    table.insert(
        key,
        Arc::new(Typed {
            converter,
            _type: PhantomData::<fn(&T)>,
        }),
    );
    tracing::debug!(
        type_name = std::any::type_name::<T>(),
        "registered parameter converter"
    );
    Ok(())
}

/// Register the column conversion for driver values of `kind`.
///
/// `ColumnKind::Null` is never dispatched; SQL NULL always reads back as [`Value::Null`].
pub fn register_column_kind<C>(kind: ColumnKind, converter: C) -> Result<()>
where
    C: ColumnConverter + 'static,
{
    if kind == ColumnKind::Null {
        return Err(Error::argument("NULL columns cannot carry a converter"));
    }
    let mut table = column_table().write().unwrap_or_else(PoisonError::into_inner);
    if table.contains_key(&kind) {
        return Err(Error::argument(format!(
            "a column converter for {kind:?} is already registered"
        )));
    }
    table.insert(kind, Arc::new(converter));
    tracing::debug!(?kind, "registered column converter");
    Ok(())
}

fn param_converter(key: TypeId) -> Option<Arc<dyn ErasedParam>> {
    param_table()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&key)
        .cloned()
}

fn column_converter(kind: ColumnKind) -> Option<Arc<dyn ColumnConverter>> {
    column_table()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(&kind)
        .cloned()
}

/// Convert a host value into its driver representation.
pub fn to_driver_type(value: &Value, conn: &Connection) -> Result<DriverValue> {
    Ok(match value {
        Value::Null => DriverValue::Null,
        Value::Bool(b) => DriverValue::Bool(*b),
        Value::Int(i) => DriverValue::Integer(*i),
        Value::Float(f) => DriverValue::Real(*f),
        Value::Text(s) => DriverValue::Text(s.clone()),
        Value::Bytes(b) => DriverValue::Blob(b.clone()),
        Value::Array(items) => {
            let elements = items
                .iter()
                .map(|item| to_driver_type(item, conn))
                .collect::<Result<Vec<_>>>()?;
            conn.create_array(element_type_name(items), elements)?
        }
        Value::Object(object) => match param_converter(object.type_id()) {
            Some(converter) => converter.to_driver(object, conn)?,
            None => DriverValue::Opaque(object.clone()),
        },
    })
}

/// Bind a host value at a 1-based position of a prepared statement.
pub fn bind_parameter(
    value: &Value,
    conn: &Connection,
    stmt: &mut dyn RawStatement,
    index: usize,
) -> Result<()> {
    match value {
        Value::Null => stmt.set_null(index, "").map_err(Error::driver),
        Value::Object(object) => match param_converter(object.type_id()) {
            Some(converter) => converter.bind(object, conn, stmt, index),
            None => stmt
                .set_object(index, DriverValue::Opaque(object.clone()))
                .map_err(Error::driver),
        },
        other => {
            let driver_value = to_driver_type(other, conn)?;
            stmt.set_object(index, driver_value).map_err(Error::driver)
        }
    }
}

/// Convert the driver value of the 1-based column `index` into a host value.
pub fn from_driver_type(
    value: DriverValue,
    conn: &Connection,
    meta: &ResultMetadata,
    index: usize,
) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    if let Some(converter) = column_converter(value.kind()) {
        return converter.from_driver(value, conn, meta, index);
    }
    Ok(match value {
        DriverValue::Null => Value::Null,
        DriverValue::Bool(b) => Value::Bool(b),
        DriverValue::Integer(i) => Value::Int(i),
        DriverValue::Real(f) => Value::Float(f),
        DriverValue::Text(s) => Value::Text(s),
        DriverValue::Blob(b) => Value::Bytes(b),
        DriverValue::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| from_driver_type(item, conn, meta, index))
                .collect::<Result<Vec<_>>>()?,
        ),
        DriverValue::Opaque(object) => Value::Object(object),
    })
}

/// SQL element type name for an array, from its first non-null element.
fn element_type_name(items: &[Value]) -> &'static str {
    items
        .iter()
        .find_map(|item| match item {
            Value::Null => None,
            Value::Bool(_) => Some("boolean"),
            Value::Int(_) => Some("bigint"),
            Value::Float(_) => Some("double precision"),
            Value::Text(_) => Some("text"),
            Value::Bytes(_) => Some("bytea"),
            Value::Array(_) | Value::Object(_) => Some(""),
        })
        .unwrap_or("")
}
