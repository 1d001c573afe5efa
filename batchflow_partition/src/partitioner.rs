//! Key partitioning functions.
//!
//! The resolver must place every record exactly where the runtime's own
//! router would have placed it, so the hash function is injected through
//! [`KeyPartitioner`] rather than chosen here. Two implementations are
//! provided: [`HashModPartitioner`] (hash then modulo, the default router
//! behaviour) and [`JumpHashPartitioner`] (consistent hashing).

use std::fmt::Debug;
use std::hash::{Hash, Hasher};

use batchflow_types::{ComponentId, Record, StreamId};
use siphasher::sip::SipHasher13;

/// A randomly generated static siphash key so that every producer hashes
/// the same key to the same u64.
///
/// Generated with: xxd -i -l 16 /dev/urandom
const DEFAULT_KEY: [u8; 16] = [
    0x3b, 0x9e, 0x51, 0x0c, 0xd4, 0x72, 0x18, 0xa6, 0x5f, 0xe3, 0x27, 0x81, 0x0a, 0xc9, 0x46,
    0xbd,
];

/// Maps the key attributes of a record to a task index of one consumer.
pub trait KeyPartitioner: Debug + Send + Sync {
    /// Return the index (in `0..task_count`) of the task receiving `record`,
    /// hashing the attributes at `key_indices`.
    ///
    /// `task_count` is never 0.
    fn partition(
        &self,
        stream: &StreamId,
        consumer: &ComponentId,
        record: &Record,
        key_indices: &[usize],
        task_count: usize,
    ) -> usize;
}

fn hash_key(hasher: SipHasher13, record: &Record, key_indices: &[usize]) -> u64 {
    let mut state = hasher;
    key_indices.len().hash(&mut state);
    for value in record.select(key_indices) {
        value.hash(&mut state);
    }
    state.finish()
}

/// Hash the key attributes with SipHash-1-3 and reduce modulo the task count.
#[derive(Debug, Clone, Copy)]
pub struct HashModPartitioner {
    hasher: SipHasher13,
}

impl Default for HashModPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl HashModPartitioner {
    pub fn new() -> Self {
        Self {
            hasher: SipHasher13::new_with_key(&DEFAULT_KEY),
        }
    }

    /// Reinitialise [`Self`] with a new key.
    ///
    /// Re-keying changes the mapping of keys to tasks, so every producer and
    /// the runtime's router must agree on the key.
    pub fn with_seed_key(self, key: &[u8; 16]) -> Self {
        Self {
            hasher: SipHasher13::new_with_key(key),
        }
    }
}

impl KeyPartitioner for HashModPartitioner {
    fn partition(
        &self,
        _stream: &StreamId,
        _consumer: &ComponentId,
        record: &Record,
        key_indices: &[usize],
        task_count: usize,
    ) -> usize {
        (hash_key(self.hasher, record, key_indices) % task_count as u64) as usize
    }
}

/// Consistently hash the key attributes onto tasks with Google's [jump hash].
///
/// Growing a consumer from `N` to `N + 1` tasks remaps approximately `1/N`
/// of the keys.
///
/// [jump hash]: https://arxiv.org/ftp/arxiv/papers/1406/1406.2294.pdf
#[derive(Debug, Clone, Copy)]
pub struct JumpHashPartitioner {
    hasher: SipHasher13,
}

impl Default for JumpHashPartitioner {
    fn default() -> Self {
        Self::new()
    }
}

impl JumpHashPartitioner {
    pub fn new() -> Self {
        Self {
            hasher: SipHasher13::new_with_key(&DEFAULT_KEY),
        }
    }

    pub fn with_seed_key(self, key: &[u8; 16]) -> Self {
        Self {
            hasher: SipHasher13::new_with_key(key),
        }
    }
}

/// Map `key` onto one of `buckets` buckets.
fn jump(mut key: u64, buckets: usize) -> usize {
    let mut b = -1_i64;
    let mut j = 0_i64;
    while j < buckets as i64 {
        b = j;
        key = key.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * (((1u64 << 31) as f64) / (((key >> 33) + 1) as f64)))
            as i64
    }

    assert!(b >= 0, "jump hash over zero buckets");
    b as usize
}

impl KeyPartitioner for JumpHashPartitioner {
    fn partition(
        &self,
        _stream: &StreamId,
        _consumer: &ComponentId,
        record: &Record,
        key_indices: &[usize],
        task_count: usize,
    ) -> usize {
        jump(hash_key(self.hasher, record, key_indices), task_count)
    }
}
