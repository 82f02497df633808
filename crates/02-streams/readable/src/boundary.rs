//! Isolation domains and the marshaling contract between them.
//!
//! Every object [`Value`] has a home [`Domain`]. Before a value produced in one
//! domain is stored in or returned to another, it goes through
//! [`Boundary::adapt`]. Objects never alias across domains: the destination
//! receives a wrapper (cached, so identity holds per destination) or, when the
//! value already belongs to the destination, the original object.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::value::{Object, ObjectData, ObjectKind, Value};

static NEXT_DOMAIN_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identifier of an isolation domain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(u32);

impl DomainId {
    /// Raw numeric id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "domain#{}", self.0)
    }
}

/// Shared handle to an isolation domain.
#[derive(Clone)]
pub struct Domain {
    inner: Rc<DomainCell>,
}

struct DomainCell {
    id: DomainId,
    label: String,
    alive: Cell<bool>,
    // Keyed by the address of the wrapped target; entries die with their wrapper.
    wrappers: RefCell<HashMap<usize, Weak<ObjectData>>>,
}

impl Domain {
    /// Allocates a fresh live domain.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            inner: Rc::new(DomainCell {
                id: DomainId(NEXT_DOMAIN_ID.fetch_add(1, Ordering::Relaxed)),
                label: label.into(),
                alive: Cell::new(true),
                wrappers: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Identifier of this domain.
    pub fn id(&self) -> DomainId {
        self.inner.id
    }

    /// Diagnostic label.
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Returns `false` once the domain has been shut down.
    pub fn is_alive(&self) -> bool {
        self.inner.alive.get()
    }

    /// Marks the domain dead. Marshaling into or out of it fails afterwards.
    pub fn shutdown(&self) {
        self.inner.alive.set(false);
        self.inner.wrappers.borrow_mut().clear();
    }

    /// Returns `true` if both handles refer to the same domain.
    pub fn same(&self, other: &Domain) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    fn wrapper_for(&self, target: &Object) -> Object {
        let key = target.address();
        let mut wrappers = self.inner.wrappers.borrow_mut();
        if let Some(existing) = wrappers.get(&key).and_then(Weak::upgrade) {
            return Object::from_data(existing);
        }
        wrappers.retain(|_, wrapper| wrapper.strong_count() > 0);
        let wrapper = Object::new(self.clone(), ObjectKind::Wrapper(target.clone()));
        wrappers.insert(key, wrapper.downgrade());
        wrapper
    }
}

impl fmt::Debug for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("alive", &self.inner.alive.get())
            .finish()
    }
}

/// Failure to marshal a value across a boundary.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BoundaryError {
    /// One side of the boundary has been shut down. Nothing may be reported
    /// to the affected promise; it stays unsettled.
    #[error("isolation domain '{0}' has been shut down")]
    Uncatchable(String),
}

/// Marshaling entry point used at every domain crossing.
pub struct Boundary;

impl Boundary {
    /// Re-expresses `value` in `destination`.
    pub fn adapt(value: &Value, destination: &Domain) -> Result<Value, BoundaryError> {
        if !destination.is_alive() {
            return Err(BoundaryError::Uncatchable(destination.label().to_string()));
        }
        match value {
            Value::Object(object) => Self::adapt_object(object, destination).map(Value::Object),
            other => Ok(other.clone()),
        }
    }

    fn adapt_object(object: &Object, destination: &Domain) -> Result<Object, BoundaryError> {
        if object.home().same(destination) {
            return Ok(object.clone());
        }
        let target = object.target();
        if !target.home().is_alive() {
            return Err(BoundaryError::Uncatchable(target.home().label().to_string()));
        }
        if target.home().same(destination) {
            return Ok(target.clone());
        }
        Ok(destination.wrapper_for(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ErrorName;

    #[test]
    fn primitives_cross_unchanged() {
        let a = Domain::new("a");
        let value = Value::from("chunk");
        assert_eq!(Boundary::adapt(&value, &a).unwrap(), value);
    }

    #[test]
    fn foreign_objects_are_wrapped_once_per_destination() {
        let a = Domain::new("a");
        let b = Domain::new("b");
        let err = Value::error(&a, ErrorName::TypeError, "bad");

        let in_b = Boundary::adapt(&err, &b).unwrap();
        let again = Boundary::adapt(&err, &b).unwrap();
        assert_ne!(in_b, err, "wrapper must not alias the foreign object");
        assert_eq!(in_b, again, "wrapper identity is stable per destination");
        assert_eq!(in_b.error_name(), Some(ErrorName::TypeError));

        let back = Boundary::adapt(&in_b, &a).unwrap();
        assert_eq!(back, err, "crossing back unwraps to the original");
    }

    #[test]
    fn dead_domains_are_uncatchable() {
        let a = Domain::new("a");
        let b = Domain::new("b");
        let list = Value::list(&a, vec![Value::from(1.0)]);
        b.shutdown();
        assert!(matches!(
            Boundary::adapt(&list, &b),
            Err(BoundaryError::Uncatchable(_))
        ));

        let c = Domain::new("c");
        a.shutdown();
        assert!(Boundary::adapt(&list, &c).is_err());
        assert!(Boundary::adapt(&Value::Undefined, &c).is_ok());
    }
}
