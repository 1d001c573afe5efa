//! Destination resolution for batched streams.
//!
//! Batching must not change where records end up: a batch may only contain
//! records that the runtime's router would have sent to the same consumer
//! task(s). The [`DestinationResolver`] recomputes, per record, the
//! destination the router would choose, and maps it onto a buffer slot
//! ([`TableForm::Indexed`]) or a task id ([`TableForm::ByTask`]).

use batchflow_types::{ComponentId, SchemaError, StreamId};
use thiserror::Error;

mod layout;
pub use layout::*;

mod partitioner;
pub use partitioner::*;

mod resolver;
pub use resolver::*;

#[derive(Debug, Error)]
pub enum Error {
    #[error("consumer {consumer} of stream {stream} has no live tasks")]
    NoTasks {
        consumer: ComponentId,
        stream: StreamId,
    },

    #[error("receiver {receiver} contributes an empty radix to the buffer index")]
    EmptyRadix { receiver: usize },

    #[error("the buffer index space does not fit in usize")]
    IndexSpaceOverflow,

    #[error("consumer {consumer} groups {stream} by an invalid key: {source}")]
    InvalidKey {
        consumer: ComponentId,
        stream: StreamId,
        source: SchemaError,
    },
}

/// A specialized `Error` for destination resolution errors
pub type Result<T, E = Error> = std::result::Result<T, E>;
