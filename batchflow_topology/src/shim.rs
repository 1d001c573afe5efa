//! Mirrors streams and subscriptions onto shadow direct streams.
//!
//! A formed batch has no single partition key, so it cannot be handed to the
//! runtime's partitioned send: the router would try to partition the batch
//! object as one opaque record. Instead the producer computes every record's
//! destination itself and ships each per-destination batch point-to-point.
//! That needs a direct channel to every consumer, which this module creates
//! at assembly time.

use batchflow_types::{ComponentId, Schema, StreamId};
use observability_deps::tracing::debug;

use crate::{Error, Grouping, InputDeclarer, OutputDeclarer, Result};

/// The prefix of every shadow stream name.
pub const BATCH_STREAM_PREFIX: &str = "__batch_";

/// The name of the shadow direct stream mirroring `stream`.
pub fn shadow_stream_id(stream: &StreamId) -> StreamId {
    StreamId::from(format!("{BATCH_STREAM_PREFIX}{stream}"))
}

/// The original stream mirrored by `shadow`, or `None` if `shadow` is not a
/// shadow stream.
pub fn original_stream_id(shadow: &StreamId) -> Option<StreamId> {
    shadow
        .as_str()
        .strip_prefix(BATCH_STREAM_PREFIX)
        .map(StreamId::from)
}

pub fn is_shadow_stream(stream: &StreamId) -> bool {
    stream.as_str().starts_with(BATCH_STREAM_PREFIX)
}

/// Wraps a component's declarer, declaring a shadow direct stream next to
/// every output stream, and subscribing to the shadow stream with direct
/// delivery next to every non-direct subscription.
#[derive(Debug)]
pub struct BatchingDeclarer<D> {
    inner: D,
}

impl<D> BatchingDeclarer<D> {
    pub fn new(inner: D) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> D {
        self.inner
    }
}

impl<D> OutputDeclarer for BatchingDeclarer<D>
where
    D: OutputDeclarer,
{
    fn declare_stream(&mut self, stream: StreamId, direct: bool, schema: Schema) -> Result<()> {
        if is_shadow_stream(&stream) {
            return Err(Error::ReservedStreamName { stream });
        }

        let shadow = shadow_stream_id(&stream);
        self.inner.declare_stream(stream, direct, schema.clone())?;
        self.inner.declare_stream(shadow, true, schema)
    }
}

impl<D> InputDeclarer for BatchingDeclarer<D>
where
    D: InputDeclarer,
{
    fn subscribe(
        &mut self,
        producer: &ComponentId,
        stream: &StreamId,
        grouping: Grouping,
    ) -> Result<()> {
        let mirror = !grouping.is_direct();
        let strategy = grouping.name();
        self.inner.subscribe(producer, stream, grouping)?;

        if mirror {
            let shadow = shadow_stream_id(stream);
            debug!(%producer, %stream, %shadow, strategy, "mirroring subscription onto direct stream");
            self.inner.subscribe(producer, &shadow, Grouping::Direct)?;
        }
        Ok(())
    }
}
