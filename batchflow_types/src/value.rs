//! Dynamically typed attribute values and the [`Record`]s built from them.

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// A single attribute value.
///
/// Floats hash by their bit pattern so that equal keys always route to the
/// same task, including `NaN` payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
}

impl Value {
    /// Returns true if this is a [`Value::List`].
    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Self::Null => {}
            Self::Bool(v) => v.hash(state),
            Self::I64(v) => v.hash(state),
            Self::U64(v) => v.hash(state),
            Self::F64(v) => v.to_bits().hash(state),
            Self::String(v) => v.hash(state),
            Self::Bytes(v) => v.hash(state),
            Self::List(v) => v.hash(state),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::I64(v) => write!(f, "{v}"),
            Self::U64(v) => write!(f, "{v}"),
            Self::F64(v) => write!(f, "{v}"),
            Self::String(v) => write!(f, "{v:?}"),
            Self::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Self::List(v) => write!(f, "[{} values]", v.len()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::I64(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::U64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

/// An ordered sequence of attribute values matching a stream [`Schema`].
///
/// [`Schema`]: crate::Schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record(Vec<Value>);

impl Record {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    /// The number of attributes in this record.
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    /// Iterate the attributes at `indices`, in that order.
    ///
    /// # Panics
    ///
    /// The iterator panics if any index is out of bounds for this record.
    pub fn select<'a>(&'a self, indices: &'a [usize]) -> impl Iterator<Item = &'a Value> + 'a {
        indices.iter().map(move |&i| &self.0[i])
    }
}

impl From<Vec<Value>> for Record {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl FromIterator<Value> for Record {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Build a [`Record`] from a list of expressions convertible into [`Value`].
///
/// ```
/// use batchflow_types::{record, Value};
///
/// let r = record![1_i64, "a", true];
/// assert_eq!(r.arity(), 3);
/// assert_eq!(r.get(1), Some(&Value::from("a")));
/// ```
#[macro_export]
macro_rules! record {
    ($($v:expr),* $(,)?) => {
        $crate::Record::new(vec![$($crate::Value::from($v)),*])
    };
}
