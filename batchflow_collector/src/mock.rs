//! Recording doubles of the runtime collaborators, for tests.

use std::convert::Infallible;
use std::sync::Arc;

use batchflow_batch::{Message, RecordBatch};
use batchflow_types::{Anchors, MessageId, Provenance, Record, StreamId, TaskId};
use thiserror::Error;

use crate::{BatchSink, RecordHandler};

/// A send observed by a [`RecordingSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum Sent {
    Native {
        stream: StreamId,
        anchors: Anchors,
        record: Record,
        message_id: Option<MessageId>,
    },
    Direct {
        task: TaskId,
        stream: StreamId,
        anchors: Anchors,
        message: Message,
        message_id: Option<MessageId>,
    },
}

#[derive(Debug, Clone, Copy, Error)]
#[error("mock transport failure")]
pub struct MockSendError;

/// A [`BatchSink`] that records every successful send.
#[derive(Debug, Default)]
pub struct RecordingSink {
    native_destinations: Vec<TaskId>,
    failures: usize,
    sent: Vec<Sent>,
}

impl RecordingSink {
    /// Report `tasks` as the destinations of every native send.
    pub fn with_native_destinations(self, tasks: Vec<TaskId>) -> Self {
        Self {
            native_destinations: tasks,
            ..self
        }
    }

    /// Fail the next `n` sends with [`MockSendError`].
    pub fn fail_next(&mut self, n: usize) {
        self.failures = n;
    }

    pub fn sent(&self) -> &[Sent] {
        &self.sent
    }

    /// Every batch sent so far as `(task, stream, batch)`, in send order.
    pub fn batches(&self) -> Vec<(TaskId, StreamId, Arc<RecordBatch>)> {
        self.sent
            .iter()
            .filter_map(|s| match s {
                Sent::Direct {
                    task,
                    stream,
                    message: Message::Batch(batch),
                    ..
                } => Some((*task, stream.clone(), Arc::clone(batch))),
                _ => None,
            })
            .collect()
    }

    fn check_failure(&mut self) -> Result<(), MockSendError> {
        if self.failures > 0 {
            self.failures -= 1;
            return Err(MockSendError);
        }
        Ok(())
    }
}

impl BatchSink for RecordingSink {
    type Error = MockSendError;

    fn send(
        &mut self,
        stream: &StreamId,
        anchors: &Anchors,
        record: Record,
        message_id: Option<MessageId>,
    ) -> Result<Vec<TaskId>, Self::Error> {
        self.check_failure()?;
        self.sent.push(Sent::Native {
            stream: stream.clone(),
            anchors: anchors.clone(),
            record,
            message_id,
        });
        Ok(self.native_destinations.clone())
    }

    fn send_direct(
        &mut self,
        task: TaskId,
        stream: &StreamId,
        anchors: &Anchors,
        message: Message,
        message_id: Option<MessageId>,
    ) -> Result<Vec<TaskId>, Self::Error> {
        self.check_failure()?;
        self.sent.push(Sent::Direct {
            task,
            stream: stream.clone(),
            anchors: anchors.clone(),
            message,
            message_id,
        });
        Ok(vec![task])
    }
}

/// A [`RecordHandler`] that records every call.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Vec<(Record, Provenance)>,
}

impl RecordingHandler {
    pub fn calls(&self) -> &[(Record, Provenance)] {
        &self.calls
    }

    pub fn into_calls(self) -> Vec<(Record, Provenance)> {
        self.calls
    }
}

impl RecordHandler for RecordingHandler {
    type Error = Infallible;

    fn on_record(&mut self, record: Record, provenance: &Provenance) -> Result<(), Self::Error> {
        self.calls.push((record, provenance.clone()));
        Ok(())
    }
}
