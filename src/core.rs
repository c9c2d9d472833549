use std::any::Any;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Serialize, Serializer};

/// A type-erased, thread-safe container.
///
/// Task outputs in a [`DependencyGraph`](crate::DependencyGraph) are stored in
/// this form and recovered by downcasting in [`Inputs`](crate::Inputs) and
/// [`Results`](crate::Results).
pub type Dynamic = Arc<dyn Any + Send + Sync>;

/// Atomic reference-counted string type used for identifiers.
pub(crate) type ArcStr = Arc<str>;

/// The natural index of an entry inside its source container.
///
/// Sequential containers (lists, sets, key-value maps) are keyed by position,
/// associative records are keyed by property name. A key is stable and unique
/// within a single run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// Position inside a sequential container.
    Index(usize),
    /// Property name inside an associative container.
    Name(ArcStr),
}

impl Key {
    pub fn as_index(&self) -> Option<usize> {
        match self {
            Key::Index(index) => Some(*index),
            Key::Name(_) => None,
        }
    }

    pub fn as_name(&self) -> Option<&str> {
        match self {
            Key::Index(_) => None,
            Key::Name(name) => Some(name),
        }
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Index(index) => write!(f, "{index}"),
            Key::Name(name) => f.write_str(name),
        }
    }
}

impl From<usize> for Key {
    fn from(value: usize) -> Self {
        Key::Index(value)
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Name(value.into())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Name(value.into())
    }
}

// Keys serialize the way they would appear as object keys: positions become
// their decimal form.
impl Serialize for Key {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// The shape family of a source container, which in turn decides the shape
/// of the result container produced from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// Positional source, positional results.
    Sequential,
    /// Named source, named results.
    Associative,
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown payload")
    }
}
