//! Buffer index arithmetic.
//!
//! When every destination of a stream can be computed from the record alone,
//! its buffers live in one flat array. Two numberings are used:
//!
//! * [`ContiguousLayout`]: one slot per (receiver, task) pair, receivers laid
//!   out back to back. A record occupies one slot per receiver.
//! * [`BufferIndexLayout`]: a mixed-radix number with one digit per receiver.
//!   Digit `i` is the task index chosen in receiver `i` and carries weight
//!   `w_i`, the product of the task counts of all preceding digits. A record
//!   occupies exactly one slot, `Σ w_i × t_i`, and the array holds the product
//!   of all task counts.

use crate::{Error, Result};

/// One receiver's digit in a [`BufferIndexLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexDigit {
    /// Position of the receiver among the stream's receivers.
    pub receiver: usize,
    /// The positional weight of this digit.
    pub weight: usize,
    /// The radix of this digit, the receiver's live task count.
    pub task_count: usize,
}

/// Mixed-radix numbering of buffer slots. See the module docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferIndexLayout {
    digits: Vec<IndexDigit>,
    len: usize,
}

impl BufferIndexLayout {
    /// Build a layout from `(receiver position, task count)` pairs, in digit
    /// order. The first digit gets weight 1.
    pub fn new(task_counts: impl IntoIterator<Item = (usize, usize)>) -> Result<Self> {
        let mut digits = vec![];
        let mut weight = 1_usize;

        for (receiver, task_count) in task_counts {
            if task_count == 0 {
                return Err(Error::EmptyRadix { receiver });
            }
            digits.push(IndexDigit {
                receiver,
                weight,
                task_count,
            });
            weight = weight
                .checked_mul(task_count)
                .ok_or(Error::IndexSpaceOverflow)?;
        }

        Ok(Self {
            len: if digits.is_empty() { 0 } else { weight },
            digits,
        })
    }

    /// The number of buffer slots, the product of every digit's radix.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn digits(&self) -> &[IndexDigit] {
        &self.digits
    }

    pub fn weight_of(&self, receiver: usize) -> Option<usize> {
        self.digits
            .iter()
            .find(|d| d.receiver == receiver)
            .map(|d| d.weight)
    }

    /// Combine per-digit task indices (in digit order) into a slot index.
    pub fn combine(&self, task_indices: impl IntoIterator<Item = usize>) -> usize {
        self.digits
            .iter()
            .zip(task_indices)
            .map(|(d, t)| {
                debug_assert!(t < d.task_count, "task index {t} out of radix {}", d.task_count);
                d.weight * t
            })
            .sum()
    }

    /// Split a slot index back into its per-digit task indices.
    pub fn decompose(&self, index: usize) -> Vec<usize> {
        debug_assert!(index < self.len, "slot {index} out of {}", self.len);
        self.digits
            .iter()
            .map(|d| (index / d.weight) % d.task_count)
            .collect()
    }
}

/// Back-to-back numbering of (receiver, task) slots. See the module docs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContiguousLayout {
    offsets: Vec<usize>,
    len: usize,
}

impl ContiguousLayout {
    /// Build a layout from the task counts of each receiver, in receiver
    /// order.
    pub fn new(task_counts: impl IntoIterator<Item = usize>) -> Result<Self> {
        let mut offsets = vec![];
        let mut len = 0_usize;
        for (receiver, count) in task_counts.into_iter().enumerate() {
            if count == 0 {
                return Err(Error::EmptyRadix { receiver });
            }
            offsets.push(len);
            len = len.checked_add(count).ok_or(Error::IndexSpaceOverflow)?;
        }
        Ok(Self { offsets, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The slot of task index `task` of receiver `receiver`.
    pub fn index(&self, receiver: usize, task: usize) -> usize {
        self.offsets[receiver] + task
    }

    /// The (receiver, task index) pair owning slot `index`.
    pub fn locate(&self, index: usize) -> (usize, usize) {
        debug_assert!(index < self.len, "slot {index} out of {}", self.len);
        let receiver = self.offsets.partition_point(|&o| o <= index) - 1;
        (receiver, index - self.offsets[receiver])
    }
}
