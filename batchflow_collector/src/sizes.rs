//! Per-stream batch capacities.

use std::collections::BTreeMap;

use batchflow_batch::RecordBatch;
use batchflow_topology::is_shadow_stream;
use batchflow_types::{ComponentId, StreamId};

use crate::SetupError;

/// The batch capacity of every stream of a producer.
///
/// A capacity of zero or less disables batching for a stream: its records
/// are sent immediately through the runtime's router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchSizes {
    /// One capacity for every stream.
    Uniform(i64),
    /// A default capacity with per-stream overrides.
    PerStream {
        default: i64,
        overrides: BTreeMap<StreamId, i64>,
    },
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self::disabled()
    }
}

impl BatchSizes {
    pub fn disabled() -> Self {
        Self::Uniform(0)
    }

    pub fn uniform(size: i64) -> Self {
        Self::Uniform(size)
    }

    /// Override the capacity of the named streams, falling back to `default`
    /// for the rest. A later override of the same stream wins.
    pub fn per_stream<I, S>(default: i64, overrides: I) -> Self
    where
        I: IntoIterator<Item = (S, i64)>,
        S: Into<StreamId>,
    {
        Self::PerStream {
            default,
            overrides: overrides.into_iter().map(|(s, n)| (s.into(), n)).collect(),
        }
    }

    /// The configured size of `stream`, before validation.
    pub fn raw_size(&self, stream: &StreamId) -> i64 {
        match self {
            Self::Uniform(size) => *size,
            Self::PerStream { default, overrides } => {
                overrides.get(stream).copied().unwrap_or(*default)
            }
        }
    }

    /// The batch capacity of `stream`, `None` if batching is disabled.
    ///
    /// Sizes above [`RecordBatch::MAX_CAPACITY`] are rejected.
    pub fn for_stream(&self, stream: &StreamId) -> Result<Option<usize>, SetupError> {
        match self.raw_size(stream) {
            size if size <= 0 => Ok(None),
            size => usize::try_from(size)
                .ok()
                .filter(|&capacity| capacity <= RecordBatch::MAX_CAPACITY)
                .map(Some)
                .ok_or_else(|| SetupError::CapacityTooLarge {
                    stream: stream.clone(),
                    size,
                }),
        }
    }

    /// Check that every overridden stream is one of `declared`, the streams
    /// of `producer`.
    pub fn validate<'a>(
        &self,
        producer: &ComponentId,
        declared: impl IntoIterator<Item = &'a StreamId> + Clone,
    ) -> Result<(), SetupError> {
        let Self::PerStream { overrides, .. } = self else {
            return Ok(());
        };

        for stream in overrides.keys() {
            if is_shadow_stream(stream) {
                return Err(SetupError::ShadowBatchSize {
                    stream: stream.clone(),
                });
            }
            if !declared.clone().into_iter().any(|s| s == stream) {
                return Err(SetupError::UnknownBatchStream {
                    producer: producer.clone(),
                    stream: stream.clone(),
                });
            }
        }
        Ok(())
    }
}
