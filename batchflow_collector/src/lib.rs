//! Producer-side batching and consumer-side debatching.
//!
//! A [`BatchingCollector`] replaces a producer task's emit calls. Every
//! record is routed, at the producer, to the consumer task(s) the runtime's
//! own router would pick, and appended to a per-destination
//! [`RecordBatch`](batchflow_batch::RecordBatch). Full batches are shipped
//! point-to-point through the task's [`BatchSink`]; partial batches wait for
//! [`BatchingCollector::flush`], either from a lifecycle hook or from a
//! [`PeriodicFlusher`].
//!
//! On the consumer side a [`Debatcher`] unpacks every inbound batch and
//! replays its records, in order, into the wrapped [`RecordHandler`].
//!
//! ```text
//!   producer logic
//!        │ emit
//!        ▼
//!   BatchingCollector ──▶ DestinationResolver
//!        │ full / flush
//!        ▼
//!   BatchSink::send_direct ═══ transport ═══▶ Debatcher ──▶ RecordHandler
//! ```
//!
//! # Delivery guarantees
//!
//! Batched delivery is at-most-once at batch granularity: the anchors and
//! message ids of batched records are not carried, and a batch lost to a
//! transport failure loses every record it held. Streams that need per-record
//! tracking must disable batching.
//!
//! A failed send does not stop the rest of an emit: the record is appended
//! for every destination first, then every buffer it filled is sent, and the
//! first failure is returned. A failing [`BatchingCollector::flush`] stops at
//! the failed batch and leaves the remaining buffers for a later flush.

use batchflow_types::{ComponentId, StreamId, TaskId};
use thiserror::Error;

mod collector;
pub use collector::*;

mod debatcher;
pub use debatcher::*;

mod flusher;
pub use flusher::*;

mod sink;
pub use sink::*;

mod sizes;
pub use sizes::*;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// Configuration faults detected while building a [`BatchingCollector`].
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("component {0} is not part of the topology")]
    UnknownComponent(ComponentId),

    #[error("batch size configured for stream {stream}, which {producer} does not declare")]
    UnknownBatchStream {
        producer: ComponentId,
        stream: StreamId,
    },

    #[error("batch size configured for internal batch stream {stream}")]
    ShadowBatchSize { stream: StreamId },

    #[error("batch size {size} for stream {stream} exceeds the maximum batch capacity")]
    CapacityTooLarge { stream: StreamId, size: i64 },

    #[error(
        "batching is enabled for {producer}/{stream} but the stream was not declared \
         through a batching declarer (no direct batch stream)"
    )]
    MissingShadowStream {
        producer: ComponentId,
        stream: StreamId,
    },

    #[error("consumer {consumer} of {producer}/{stream} is not subscribed to its batch stream")]
    UnwiredShadowStream {
        producer: ComponentId,
        stream: StreamId,
        consumer: ComponentId,
    },

    #[error(transparent)]
    Batch(#[from] batchflow_batch::Error),

    #[error(transparent)]
    Resolver(#[from] batchflow_partition::Error),
}

/// Errors returned by the emit and flush paths of a [`BatchingCollector`].
#[derive(Debug, Error)]
pub enum EmitError<E> {
    #[error("stream {0} is not declared by this producer")]
    UnknownStream(StreamId),

    #[error("stream {0} is not a direct stream")]
    NotDirectStream(StreamId),

    #[error("stream {0} is a direct stream, emit with an explicit task")]
    DirectStreamRequiresTask(StreamId),

    #[error("task {task} does not consume stream {stream}")]
    UnknownTask { stream: StreamId, task: TaskId },

    #[error("record rejected by the batch buffer: {0}")]
    Batch(#[from] batchflow_batch::Error),

    #[error("transport failed to deliver a message: {0}")]
    Send(#[source] E),
}

/// Errors returned by [`Debatcher`].
#[derive(Debug, Error)]
pub enum DebatchError<E> {
    #[error("rejecting corrupt batch from task {source_task}: {source}")]
    CorruptBatch {
        source_task: TaskId,
        source: batchflow_batch::Error,
    },

    #[error("failed to decode payload: {0}")]
    Decode(#[source] batchflow_batch::Error),

    #[error("record handler failed: {0}")]
    Handler(#[source] E),
}
