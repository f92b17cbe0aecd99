//! Per-connection property bag values.
//!
//! Keys are plain strings; what each key holds is a convention between the
//! code that sets it and the code that reads it. The server itself sets only
//! [`HEARTBEAT_CHECKER_KEY`](crate::heartbeat::HEARTBEAT_CHECKER_KEY).

use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// A value stored on a connection.
#[derive(Clone)]
pub enum Property {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    Text(String),
    Bytes(Bytes),
    /// Arbitrary shared object, recovered with [`Property::downcast`].
    Shared(Arc<dyn Any + Send + Sync>),
}

impl Property {
    /// Wrap a shared object.
    pub fn shared<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Property::Shared(value)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Property::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Property::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Property::Uint(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Property::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Property::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Property::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Recover a shared object of type `T`.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        match self {
            Property::Shared(value) => Arc::clone(value).downcast::<T>().ok(),
            _ => None,
        }
    }
}

impl fmt::Debug for Property {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Property::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Property::Int(n) => f.debug_tuple("Int").field(n).finish(),
            Property::Uint(n) => f.debug_tuple("Uint").field(n).finish(),
            Property::Float(n) => f.debug_tuple("Float").field(n).finish(),
            Property::Text(s) => f.debug_tuple("Text").field(s).finish(),
            Property::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            Property::Shared(_) => f.write_str("Shared(..)"),
        }
    }
}

impl From<bool> for Property {
    fn from(value: bool) -> Self {
        Property::Bool(value)
    }
}

impl From<i64> for Property {
    fn from(value: i64) -> Self {
        Property::Int(value)
    }
}

impl From<u64> for Property {
    fn from(value: u64) -> Self {
        Property::Uint(value)
    }
}

impl From<f64> for Property {
    fn from(value: f64) -> Self {
        Property::Float(value)
    }
}

impl From<String> for Property {
    fn from(value: String) -> Self {
        Property::Text(value)
    }
}

impl From<&str> for Property {
    fn from(value: &str) -> Self {
        Property::Text(value.to_string())
    }
}

impl From<Bytes> for Property {
    fn from(value: Bytes) -> Self {
        Property::Bytes(value)
    }
}
