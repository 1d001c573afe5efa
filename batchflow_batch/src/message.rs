//! The payloads exchanged between a producer and its consumers.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use batchflow_types::{Record, Value};
use serde::{Deserialize, Serialize};

use crate::{Column, RecordBatch};

/// The kind of a [`Message`], carried as an explicit tag wherever the
/// transport allows it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    Record,
    Batch,
}

impl PayloadKind {
    pub fn tag(&self) -> u8 {
        match self {
            Self::Record => 0,
            Self::Batch => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Record),
            1 => Some(Self::Batch),
            _ => None,
        }
    }
}

impl Display for PayloadKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Record => f.write_str("record"),
            Self::Batch => f.write_str("batch"),
        }
    }
}

/// A single record or a batch of records.
///
/// Batches are reference counted so one sealed batch can be handed to
/// several destination tasks without copying its columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    Record(Record),
    Batch(Arc<RecordBatch>),
}

impl Message {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Record(_) => PayloadKind::Record,
            Self::Batch(_) => PayloadKind::Batch,
        }
    }

    /// The number of records carried by this message.
    pub fn record_count(&self) -> usize {
        match self {
            Self::Record(_) => 1,
            Self::Batch(b) => b.rows(),
        }
    }

    /// Flatten this message into a plain value list, the form a transport
    /// that only understands records would carry.
    ///
    /// A batch becomes one [`Value::List`] per column.
    pub fn into_values(self) -> Vec<Value> {
        match self {
            Self::Record(r) => r.into_values(),
            Self::Batch(b) => {
                let batch = Arc::try_unwrap(b).unwrap_or_else(|b| (*b).clone());
                batch
                    .columns
                    .into_iter()
                    .map(|c| Value::List(c.into_values()))
                    .collect()
            }
        }
    }

    /// Classify a flattened payload by its structure.
    ///
    /// A payload whose values are all lists of one common, non-zero length
    /// is taken to be a batch. This is a heuristic: an ordinary record whose
    /// attributes all happen to be equally long lists is indistinguishable
    /// from a batch once the wrapper type is gone. Prefer an explicit
    /// [`PayloadKind`] tag whenever the transport can carry one.
    pub fn detect(values: Vec<Value>) -> Self {
        let Some(rows) = common_list_len(&values) else {
            return Self::Record(Record::new(values));
        };

        let columns = values
            .into_iter()
            .map(|v| match v {
                Value::List(values) => Column::from_values(values),
                other => unreachable!("non-list value {other} in a detected batch"),
            })
            .collect();

        Self::Batch(Arc::new(RecordBatch {
            capacity: rows,
            columns,
            rows,
        }))
    }
}

/// Returns the shared length if every value is a list of the same non-zero
/// length.
fn common_list_len(values: &[Value]) -> Option<usize> {
    let mut lens = values.iter().map(|v| match v {
        Value::List(l) => Some(l.len()),
        _ => None,
    });

    match lens.next().flatten() {
        Some(first) if first > 0 && lens.all(|l| l == Some(first)) => Some(first),
        _ => None,
    }
}

impl From<Record> for Message {
    fn from(r: Record) -> Self {
        Self::Record(r)
    }
}

impl From<RecordBatch> for Message {
    fn from(b: RecordBatch) -> Self {
        Self::Batch(Arc::new(b))
    }
}

#[cfg(test)]
mod tests {
    use batchflow_types::record;

    use super::*;

    fn batch_of(records: &[Record]) -> RecordBatch {
        let mut batch = RecordBatch::new(8, records[0].arity()).unwrap();
        for r in records {
            batch.append(r.clone()).unwrap();
        }
        batch
    }

    #[test]
    fn tags_are_stable() {
        for kind in [PayloadKind::Record, PayloadKind::Batch] {
            assert_eq!(PayloadKind::from_tag(kind.tag()), Some(kind));
        }
        assert_eq!(PayloadKind::from_tag(7), None);
    }

    #[test]
    fn structural_detection_recovers_batches() {
        let records = vec![record![1_i64, "a"], record![2_i64, "b"]];
        let msg = Message::from(batch_of(&records));
        assert_eq!(msg.record_count(), 2);

        let values = msg.into_values();
        assert!(values.iter().all(Value::is_list));

        match Message::detect(values) {
            Message::Batch(b) => assert_eq!(b.iter_rows().collect::<Vec<_>>(), records),
            other => panic!("expected a batch, got {other:?}"),
        }
    }

    #[test]
    fn structural_detection_passes_records_through() {
        let r = record![1_i64, "a"];
        assert_eq!(
            Message::detect(Message::from(r.clone()).into_values()),
            Message::Record(r)
        );

        // Lists of differing length cannot be columns of one batch.
        let ragged = Record::new(vec![
            Value::List(vec![Value::I64(1)]),
            Value::List(vec![]),
        ]);
        assert_eq!(
            Message::detect(ragged.clone().into_values()),
            Message::Record(ragged)
        );
    }

    #[test]
    fn structural_detection_is_ambiguous_for_list_records() {
        // A genuine record made only of equal-length lists is misread as a
        // batch. This is the documented limit of untagged detection.
        let r = Record::new(vec![
            Value::List(vec![Value::I64(1)]),
            Value::List(vec![Value::I64(2)]),
        ]);
        assert_eq!(Message::detect(r.into_values()).kind(), PayloadKind::Batch);
    }
}
