//! Opaque values carried by streams: chunks, cancel reasons and stored errors.

use std::fmt;
use std::rc::{Rc, Weak};

use crate::boundary::Domain;

/// Name of an error object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorName {
    /// Generic error.
    Error,
    /// Misuse of an API (wrong state, lock violations).
    TypeError,
    /// Numeric argument out of range (sizes, high-water marks).
    RangeError,
    /// A value could not be structurally cloned.
    DataCloneError,
}

impl fmt::Display for ErrorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorName::Error => "Error",
            ErrorName::TypeError => "TypeError",
            ErrorName::RangeError => "RangeError",
            ErrorName::DataCloneError => "DataCloneError",
        };
        f.write_str(name)
    }
}

/// Payload of an error object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorObject {
    /// Error class.
    pub name: ErrorName,
    /// Human-readable message.
    pub message: String,
}

/// Shape of an object value.
#[derive(Debug)]
pub enum ObjectKind {
    /// Error object.
    Error(ErrorObject),
    /// Ordered list of values.
    List(Vec<Value>),
    /// Ordered key/value record.
    Record(Vec<(String, Value)>),
    /// Proxy for an object living in another domain.
    Wrapper(Object),
}

pub(crate) struct ObjectData {
    home: Domain,
    kind: ObjectKind,
}

/// Reference-counted object homed in a [`Domain`]. Equality is identity.
#[derive(Clone)]
pub struct Object(Rc<ObjectData>);

impl Object {
    pub(crate) fn new(home: Domain, kind: ObjectKind) -> Self {
        Object(Rc::new(ObjectData { home, kind }))
    }

    pub(crate) fn from_data(data: Rc<ObjectData>) -> Self {
        Object(data)
    }

    pub(crate) fn downgrade(&self) -> Weak<ObjectData> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn address(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    /// Domain that owns this object.
    pub fn home(&self) -> &Domain {
        &self.0.home
    }

    /// Object shape.
    pub fn kind(&self) -> &ObjectKind {
        &self.0.kind
    }

    /// The wrapped object for wrappers, `self` otherwise.
    pub fn target(&self) -> &Object {
        match &self.0.kind {
            ObjectKind::Wrapper(target) => target,
            _ => self,
        }
    }

    /// Identity comparison.
    pub fn same(&self, other: &Object) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Object")
            .field("home", &self.0.home.id())
            .field("kind", &self.0.kind)
            .finish()
    }
}

/// Opaque value. Objects compare by identity, numbers by SameValue.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// Absent value.
    #[default]
    Undefined,
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Double-precision number.
    Number(f64),
    /// Immutable string.
    String(Rc<str>),
    /// Immutable byte chunk.
    Bytes(Rc<[u8]>),
    /// Domain-owned object.
    Object(Object),
}

impl Value {
    /// Creates an error object homed in `domain`.
    pub fn error(domain: &Domain, name: ErrorName, message: impl Into<String>) -> Self {
        Value::Object(Object::new(
            domain.clone(),
            ObjectKind::Error(ErrorObject {
                name,
                message: message.into(),
            }),
        ))
    }

    /// Creates a list object homed in `domain`.
    pub fn list(domain: &Domain, items: Vec<Value>) -> Self {
        Value::Object(Object::new(domain.clone(), ObjectKind::List(items)))
    }

    /// Creates a record object homed in `domain`.
    pub fn record(domain: &Domain, fields: Vec<(String, Value)>) -> Self {
        Value::Object(Object::new(domain.clone(), ObjectKind::Record(fields)))
    }

    /// SameValue comparison.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.same(b),
            _ => false,
        }
    }

    /// Returns `true` for [`Value::Undefined`].
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// String contents, if a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric value, if a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Byte contents, if a byte chunk.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Object handle, if an object.
    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(object) => Some(object),
            _ => None,
        }
    }

    /// Home domain of object values.
    pub fn home(&self) -> Option<&Domain> {
        self.as_object().map(Object::home)
    }

    /// Error class, looking through wrappers.
    pub fn error_name(&self) -> Option<ErrorName> {
        match self.as_object()?.target().kind() {
            ObjectKind::Error(err) => Some(err.name),
            _ => None,
        }
    }

    /// Error message, looking through wrappers.
    pub fn error_message(&self) -> Option<&str> {
        match self.as_object()?.target().kind() {
            ObjectKind::Error(err) => Some(&err.message),
            _ => None,
        }
    }

    /// List items, looking through wrappers. Items keep their own homes.
    pub fn list_items(&self) -> Option<&[Value]> {
        match self.as_object()?.target().kind() {
            ObjectKind::List(items) => Some(items),
            _ => None,
        }
    }

    /// Deep copy homed in `domain`. Fails with a `DataCloneError` when the
    /// source object lives in a domain that has been shut down.
    pub fn structured_clone(&self, domain: &Domain) -> Result<Value, Value> {
        let object = match self {
            Value::Object(object) => object.target(),
            other => return Ok(other.clone()),
        };
        if !object.home().is_alive() {
            return Err(Value::error(
                domain,
                ErrorName::DataCloneError,
                format!("cannot clone object from '{}'", object.home().label()),
            ));
        }
        let kind = match object.kind() {
            ObjectKind::Error(err) => ObjectKind::Error(err.clone()),
            ObjectKind::List(items) => ObjectKind::List(
                items
                    .iter()
                    .map(|item| item.structured_clone(domain))
                    .collect::<Result<_, _>>()?,
            ),
            ObjectKind::Record(fields) => ObjectKind::Record(
                fields
                    .iter()
                    .map(|(key, value)| -> Result<(String, Value), Value> {
                        Ok((key.clone(), value.structured_clone(domain)?))
                    })
                    .collect::<Result<_, _>>()?,
            ),
            ObjectKind::Wrapper(target) => {
                return Value::Object(target.clone()).structured_clone(domain);
            }
        };
        Ok(Value::Object(Object::new(domain.clone(), kind)))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same_value(other)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Rc::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(Rc::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(f64::from(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(Rc::from(value))
    }
}

impl From<&[u8]> for Value {
    fn from(value: &[u8]) -> Self {
        Value::Bytes(Rc::from(value))
    }
}
