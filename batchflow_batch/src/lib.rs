//! A fixed-capacity, columnar accumulator of records.
//!
//! A [`RecordBatch`] holds up to `capacity` records of one stream. Each
//! attribute is stored in its own [`Column`]; every column always holds
//! exactly [`RecordBatch::rows`] values. Batches are write-only: rows are
//! appended until the batch is full (or flushed) and the batch is then handed
//! off whole and replaced by [`RecordBatch::empty_like`].

use std::num::NonZeroUsize;

use batchflow_types::{Record, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod column;
pub use column::{Column, PartitionFingerprint};

mod codec;
pub use codec::*;

mod message;
pub use message::*;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid batch shape (capacity {capacity}, width {width}): both must be positive")]
    InvalidShape { capacity: usize, width: usize },

    #[error("batch capacity {capacity} exceeds the maximum of {max} rows")]
    CapacityTooLarge { capacity: usize, max: usize },

    #[error("record arity {actual} does not match the batch width {expected}")]
    ArityMismatch { expected: usize, actual: usize },

    #[error("batch is full ({capacity} rows)")]
    BatchFull { capacity: usize },

    #[error("column {column} holds {actual} values but the batch holds {expected} rows")]
    CorruptBatch {
        column: usize,
        expected: usize,
        actual: usize,
    },

    #[error("no codec registered for payload tag {tag}")]
    UnknownPayloadTag { tag: u8 },

    #[error("a codec for {kind} payloads is already registered")]
    DuplicateCodec { kind: PayloadKind },

    #[error("codec for {expected} payloads cannot handle a {actual} payload")]
    WrongPayloadKind {
        expected: PayloadKind,
        actual: PayloadKind,
    },

    #[error("empty payload")]
    EmptyPayload,

    #[error("payload serialization error: {0}")]
    Serialization(#[from] bitcode::Error),
}

/// A specialized `Error` for [`RecordBatch`] errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A columnar batch of at most `capacity` records sharing a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordBatch {
    capacity: usize,
    columns: Vec<Column>,
    rows: usize,
}

/// Rows reserved up front in every column. Larger batches grow on demand.
const PREALLOCATED_ROWS: usize = 1024;

impl RecordBatch {
    /// The largest capacity [`Self::new`] accepts.
    pub const MAX_CAPACITY: usize = 1 << 24;

    /// Create an empty batch holding up to `capacity` records of `width`
    /// attributes.
    pub fn new(capacity: usize, width: usize) -> Result<Self> {
        if capacity > Self::MAX_CAPACITY {
            return Err(Error::CapacityTooLarge {
                capacity,
                max: Self::MAX_CAPACITY,
            });
        }
        match (NonZeroUsize::new(capacity), NonZeroUsize::new(width)) {
            (Some(capacity), Some(width)) => Ok(Self::with_shape(capacity.get(), width.get())),
            _ => Err(Error::InvalidShape { capacity, width }),
        }
    }

    fn with_shape(capacity: usize, width: usize) -> Self {
        Self {
            capacity,
            columns: (0..width)
                .map(|_| Column::with_capacity(capacity.min(PREALLOCATED_ROWS)))
                .collect(),
            rows: 0,
        }
    }

    /// Reassemble a batch from columns received over a transport.
    ///
    /// The batch is validated: all columns must agree in length.
    pub fn from_columns(columns: Vec<Column>) -> Result<Self> {
        let rows = columns.first().map(Column::len).unwrap_or_default();
        let batch = Self {
            capacity: rows.max(1),
            columns,
            rows,
        };
        batch.validate()?;
        Ok(batch)
    }

    /// A fresh, empty batch with the same capacity and width as `self`.
    pub fn empty_like(&self) -> Self {
        Self::with_shape(self.capacity, self.columns.len())
    }

    /// Append `record` as the next row.
    ///
    /// The record's arity must equal [`Self::width`] and the batch must not be
    /// full. Both conditions are checked before any column is touched, so a
    /// rejected record never leaves a partially written row behind.
    pub fn append(&mut self, record: Record) -> Result<()> {
        if record.arity() != self.columns.len() {
            return Err(Error::ArityMismatch {
                expected: self.columns.len(),
                actual: record.arity(),
            });
        }
        if self.is_full() {
            return Err(Error::BatchFull {
                capacity: self.capacity,
            });
        }

        for (column, value) in self.columns.iter_mut().zip(record.into_values()) {
            column.push(value);
        }
        self.rows += 1;

        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The schema width, i.e. the number of columns.
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    /// Return the number of rows in this batch
    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn is_full(&self) -> bool {
        self.rows == self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, idx: usize) -> Option<&Column> {
        self.columns.get(idx)
    }

    /// Check the shape invariants of a batch that did not originate from
    /// [`Self::append`].
    pub fn validate(&self) -> Result<()> {
        if self.columns.is_empty() || self.capacity == 0 {
            return Err(Error::InvalidShape {
                capacity: self.capacity,
                width: self.columns.len(),
            });
        }
        if self.rows > self.capacity {
            return Err(Error::BatchFull {
                capacity: self.capacity,
            });
        }
        match self
            .columns
            .iter()
            .enumerate()
            .find(|(_, c)| c.len() != self.rows)
        {
            Some((column, c)) => Err(Error::CorruptBatch {
                column,
                expected: self.rows,
                actual: c.len(),
            }),
            None => Ok(()),
        }
    }

    /// Reconstruct row `idx`, reading one value from every column.
    pub fn row(&self, idx: usize) -> Option<Record> {
        if idx >= self.rows {
            return None;
        }
        self.columns
            .iter()
            .map(|c| c.get(idx).cloned())
            .collect::<Option<Vec<Value>>>()
            .map(Record::new)
    }

    /// Iterate over copies of the rows in append order.
    pub fn iter_rows(&self) -> impl Iterator<Item = Record> + '_ {
        (0..self.rows).filter_map(|idx| self.row(idx))
    }

    /// Consume the batch, yielding its rows in append order.
    pub fn into_records(self) -> impl Iterator<Item = Record> {
        let rows = self.rows;
        let mut columns = self
            .columns
            .into_iter()
            .map(|c| c.into_values().into_iter())
            .collect::<Vec<_>>();

        (0..rows).map(move |_| {
            columns
                .iter_mut()
                .map(|c| c.next().unwrap_or(Value::Null))
                .collect::<Record>()
        })
    }
}
