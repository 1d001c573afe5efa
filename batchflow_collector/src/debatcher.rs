//! The consumer-side debatcher.

use std::fmt::Debug;
use std::sync::Arc;

use batchflow_batch::{Message, PayloadRegistry, RecordBatch};
use batchflow_topology::original_stream_id;
use batchflow_types::{Provenance, Record, Value};
use observability_deps::tracing::{error, trace};

use crate::DebatchError;

/// The per-record entry point of consumer logic.
pub trait RecordHandler: Debug + Send {
    type Error: std::error::Error + Send + Sync + 'static;

    fn on_record(&mut self, record: Record, provenance: &Provenance) -> Result<(), Self::Error>;
}

/// The payload of an inbound message as handed over by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundPayload {
    /// The transport preserved the message kind.
    Tagged(Message),
    /// The transport erased the message kind and delivered plain values.
    Erased(Vec<Value>),
}

/// An inbound message and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub provenance: Provenance,
    pub payload: InboundPayload,
}

impl Envelope {
    pub fn new(provenance: Provenance, payload: impl Into<Message>) -> Self {
        Self {
            provenance,
            payload: InboundPayload::Tagged(payload.into()),
        }
    }

    pub fn erased(provenance: Provenance, values: Vec<Value>) -> Self {
        Self {
            provenance,
            payload: InboundPayload::Erased(values),
        }
    }
}

/// How the kind of an [`InboundPayload::Erased`] payload is decided.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Detection {
    /// Erased payloads are always ordinary records.
    #[default]
    TagOnly,
    /// Erased payloads made only of equally long lists are batches.
    ///
    /// An ordinary record whose attributes all happen to be lists of one
    /// common length is misread as a batch. Only enable this for transports
    /// that cannot carry a message kind and streams whose schemas rule the
    /// collision out.
    Structural,
}

/// Unpacks inbound batches and replays their records, one at a time and in
/// append order, into the wrapped [`RecordHandler`].
///
/// Every record of a batch is delivered with the batch's own provenance,
/// with the batch stream mapped back to the stream the producer emitted on.
/// Ordinary records pass through unchanged, so batched and unbatched traffic
/// can share a stream.
#[derive(Debug)]
pub struct Debatcher<H> {
    handler: H,
    detection: Detection,
}

impl<H> Debatcher<H>
where
    H: RecordHandler,
{
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            detection: Detection::default(),
        }
    }

    pub fn with_detection(self, detection: Detection) -> Self {
        Self { detection, ..self }
    }

    /// Deliver every record carried by `envelope` to the handler, returning
    /// the number of records delivered.
    ///
    /// A batch whose columns disagree in length is rejected whole, before
    /// any of its records reach the handler.
    pub fn on_message(&mut self, envelope: Envelope) -> Result<usize, DebatchError<H::Error>> {
        let Envelope {
            mut provenance,
            payload,
        } = envelope;
        if let Some(stream) = original_stream_id(&provenance.stream) {
            provenance.stream = stream;
        }

        let message = match (payload, self.detection) {
            (InboundPayload::Tagged(message), _) => message,
            (InboundPayload::Erased(values), Detection::Structural) => Message::detect(values),
            (InboundPayload::Erased(values), Detection::TagOnly) => {
                Message::Record(Record::new(values))
            }
        };

        match message {
            Message::Record(record) => {
                self.handler
                    .on_record(record, &provenance)
                    .map_err(DebatchError::Handler)?;
                Ok(1)
            }
            Message::Batch(batch) => self.replay(batch, &provenance),
        }
    }

    /// Decode a payload encoded by `registry` and deliver its records.
    pub fn on_encoded(
        &mut self,
        provenance: Provenance,
        bytes: &[u8],
        registry: &PayloadRegistry,
    ) -> Result<usize, DebatchError<H::Error>> {
        let message = registry.decode(bytes).map_err(DebatchError::Decode)?;
        self.on_message(Envelope::new(provenance, message))
    }

    fn replay(
        &mut self,
        batch: Arc<RecordBatch>,
        provenance: &Provenance,
    ) -> Result<usize, DebatchError<H::Error>> {
        if let Err(source) = batch.validate() {
            error!(
                source_task = %provenance.source_task,
                stream = %provenance.stream,
                error = %source,
                "rejecting corrupt batch"
            );
            return Err(DebatchError::CorruptBatch {
                source_task: provenance.source_task,
                source,
            });
        }

        let rows = batch.rows();
        trace!(
            source_task = %provenance.source_task,
            stream = %provenance.stream,
            rows,
            "unpacking batch"
        );

        let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
        for record in batch.into_records() {
            self.handler
                .on_record(record, provenance)
                .map_err(DebatchError::Handler)?;
        }
        Ok(rows)
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn into_handler(self) -> H {
        self.handler
    }
}
