//! Host and driver value models.
//!
//! [`Value`] is what application code binds and reads back. [`DriverValue`] is
//! what crosses the driver boundary. The type protocol in [`crate::types`]
//! converts between them.

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// A type-erased user value.
///
/// Cloning is cheap (reference counted). Equality is identity: two objects
/// are equal when they point at the same allocation.
#[derive(Clone)]
pub struct Object {
    inner: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Object {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            inner: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Runtime type of the wrapped value; the registry dispatch key.
    pub fn type_id(&self) -> TypeId {
        Any::type_id(&*self.inner)
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn is<T: Any>(&self) -> bool {
        self.inner.is::<T>()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("type", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Object {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.inner) as *const (),
            Arc::as_ptr(&other.inner) as *const (),
        )
    }
}

/// A host-side value bound as a parameter or read from a column.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(Object),
}

impl Value {
    /// Wrap an arbitrary user type. Its conversion is looked up by `TypeId`.
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Value::Object(Object::new(value))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Borrow a wrapped user value of type `T`.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            Value::Object(o) => o.downcast_ref::<T>(),
            _ => None,
        }
    }
}

macro_rules! value_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(i64::from(v))
            }
        })*
    };
}

value_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<Object> for Value {
    fn from(v: Object) -> Self {
        Value::Object(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A value in the representation a driver accepts and produces.
#[derive(Clone, Debug, PartialEq)]
pub enum DriverValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Array(Vec<DriverValue>),
    /// A driver-native object the core does not interpret.
    Opaque(Object),
}

impl DriverValue {
    pub fn kind(&self) -> ColumnKind {
        match self {
            DriverValue::Null => ColumnKind::Null,
            DriverValue::Bool(_) => ColumnKind::Bool,
            DriverValue::Integer(_) => ColumnKind::Integer,
            DriverValue::Real(_) => ColumnKind::Real,
            DriverValue::Text(_) => ColumnKind::Text,
            DriverValue::Blob(_) => ColumnKind::Blob,
            DriverValue::Array(_) => ColumnKind::Array,
            DriverValue::Opaque(o) => ColumnKind::Opaque(o.type_id()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, DriverValue::Null)
    }
}

/// Dispatch key for column conversions: the runtime kind of a driver value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    Null,
    Bool,
    Integer,
    Real,
    Text,
    Blob,
    Array,
    Opaque(TypeId),
}

impl ColumnKind {
    /// Kind of driver-native objects of type `T`.
    pub fn opaque<T: Any>() -> Self {
        ColumnKind::Opaque(TypeId::of::<T>())
    }
}
