//! Request parameter forms.
//!
//! A request's `"params"` field is either omitted, a positional array,
//! a keyword object, or a single scalar value treated as one positional
//! argument. Positional and keyword forms are mutually exclusive per
//! call — the variant itself encodes which form was used.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Parameters attached to a method invocation.
///
/// Deserialization mirrors the lenient wire format: an array is
/// positional, an object is keyword, and anything else is a single
/// positional argument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Params {
    /// Positional arguments: `"params": [1, "two"]`.
    Positional(Vec<Value>),
    /// Keyword arguments: `"params": {"name": "World"}`.
    Named(Map<String, Value>),
    /// A bare scalar, shorthand for one positional argument:
    /// `"params": "hello"`.
    Single(Value),
}

impl Params {
    /// Returns the positional argument list, promoting a bare scalar to
    /// a one-element list. Keyword parameters yield an empty list.
    #[must_use]
    pub fn positional(&self) -> Vec<Value> {
        match self {
            Self::Positional(args) => args.clone(),
            Self::Single(value) => vec![value.clone()],
            Self::Named(_) => Vec::new(),
        }
    }

    /// Returns the keyword argument map, empty for positional forms.
    #[must_use]
    pub fn named(&self) -> Map<String, Value> {
        match self {
            Self::Named(map) => map.clone(),
            Self::Positional(_) | Self::Single(_) => Map::new(),
        }
    }

    /// Returns the sole argument of this parameter set, if there is
    /// exactly one positional argument.
    #[must_use]
    pub fn single(&self) -> Option<&Value> {
        match self {
            Self::Single(value) => Some(value),
            Self::Positional(args) if args.len() == 1 => args.first(),
            Self::Positional(_) | Self::Named(_) => None,
        }
    }

    /// Looks up a keyword argument by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Named(map) => map.get(name),
            Self::Positional(_) | Self::Single(_) => None,
        }
    }

    /// Returns `true` if no arguments were supplied in any form.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Positional(args) => args.is_empty(),
            Self::Named(map) => map.is_empty(),
            Self::Single(_) => false,
        }
    }
}
