//! Change notifications over an eventually-changing set.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Kind {
    Add,
    Modify,
    Delete,
    BufferSentinel,
}

/// `BufferSentinel` ends the initial snapshot burst; everything after it is live tail.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ChangeNotification<T> {
    Add(T),
    Modify(T),
    Delete(T),
    BufferSentinel,
}

impl<T> ChangeNotification<T> {
    pub fn kind(&self) -> Kind {
        match self {
            ChangeNotification::Add(_) => Kind::Add,
            ChangeNotification::Modify(_) => Kind::Modify,
            ChangeNotification::Delete(_) => Kind::Delete,
            ChangeNotification::BufferSentinel => Kind::BufferSentinel,
        }
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            ChangeNotification::Add(d) | ChangeNotification::Modify(d) | ChangeNotification::Delete(d) => Some(d),
            ChangeNotification::BufferSentinel => None,
        }
    }

    pub fn into_data(self) -> Option<T> {
        match self {
            ChangeNotification::Add(d) | ChangeNotification::Modify(d) | ChangeNotification::Delete(d) => Some(d),
            ChangeNotification::BufferSentinel => None,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        matches!(self, ChangeNotification::BufferSentinel)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ChangeNotification<U> {
        match self {
            ChangeNotification::Add(d) => ChangeNotification::Add(f(d)),
            ChangeNotification::Modify(d) => ChangeNotification::Modify(f(d)),
            ChangeNotification::Delete(d) => ChangeNotification::Delete(f(d)),
            ChangeNotification::BufferSentinel => ChangeNotification::BufferSentinel,
        }
    }
}

impl<T: fmt::Display> fmt::Display for ChangeNotification<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeNotification::Add(d) => write!(f, "Add({})", d),
            ChangeNotification::Modify(d) => write!(f, "Modify({})", d),
            ChangeNotification::Delete(d) => write!(f, "Delete({})", d),
            ChangeNotification::BufferSentinel => f.write_str("BufferSentinel"),
        }
    }
}
