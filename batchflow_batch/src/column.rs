//! A [`Column`] stores the values of one attribute across the rows of a batch

use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use batchflow_types::Value;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

/// A stable, opaque token derived from the first value written to a
/// [`Column`].
///
/// A transport that cannot partition a batch itself can hash this token
/// instead: every row in a batch shares a destination, so the first row's
/// key is as good as any. It is not a digest of the column contents.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PartitionFingerprint(u64);

impl PartitionFingerprint {
    fn of(value: &Value) -> Self {
        let mut hasher = XxHash64::with_seed(0);
        value.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl Display for PartitionFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The values of one attribute for every row in a batch, in append order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    values: Vec<Value>,
    fingerprint: Option<PartitionFingerprint>,
}

impl Column {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            values: Vec::with_capacity(capacity),
            fingerprint: None,
        }
    }

    /// Build a column from already collected values, e.g. after a transport
    /// erased the batch wrapper.
    pub fn from_values(values: Vec<Value>) -> Self {
        let fingerprint = values.first().map(PartitionFingerprint::of);
        Self {
            values,
            fingerprint,
        }
    }

    #[cfg(test)]
    pub(crate) fn reserved(&self) -> usize {
        self.values.capacity()
    }

    pub(crate) fn push(&mut self, value: Value) {
        if self.values.is_empty() {
            self.fingerprint = Some(PartitionFingerprint::of(&value));
        }
        self.values.push(value);
    }

    /// Returns the number of rows in this column
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if this column contains no rows
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, row: usize) -> Option<&Value> {
        self.values.get(row)
    }

    /// The fingerprint of the first value ever written, `None` while empty.
    pub fn fingerprint(&self) -> Option<PartitionFingerprint> {
        self.fingerprint
    }

    pub(crate) fn into_values(self) -> Vec<Value> {
        self.values
    }
}
