use std::fmt::Debug;

use batchflow_batch::Message;
use batchflow_types::{Anchors, MessageId, Record, StreamId, TaskId};

/// The send capabilities of one task, provided by the runtime.
///
/// A producer with batching enabled on a stream never hands a batch to
/// [`BatchSink::send`]: the runtime's router would treat the batch as a
/// single opaque record with no usable key. Batches always travel through
/// [`BatchSink::send_direct`].
pub trait BatchSink: Debug + Send {
    /// The transport failure type, propagated untouched by the collector.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send `record` on `stream` through the runtime's router, returning the
    /// tasks it was delivered to.
    fn send(
        &mut self,
        stream: &StreamId,
        anchors: &Anchors,
        record: Record,
        message_id: Option<MessageId>,
    ) -> Result<Vec<TaskId>, Self::Error>;

    /// Send `message` to `task` on the direct stream `stream`.
    fn send_direct(
        &mut self,
        task: TaskId,
        stream: &StreamId,
        anchors: &Anchors,
        message: Message,
        message_id: Option<MessageId>,
    ) -> Result<Vec<TaskId>, Self::Error>;
}
