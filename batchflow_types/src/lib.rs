//! Identifiers, record values and schemas shared by the batchflow crates.
//!
//! A producer task emits [`Record`]s on a named [`StreamId`]. Every stream
//! carries a fixed [`Schema`] and every record emitted on it must match the
//! schema's width. Consumers receive records together with a [`Provenance`]
//! describing where they came from.

use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

mod schema;
pub use schema::*;

mod value;
pub use value::*;

/// The identifier of one live execution instance of a component.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct TaskId(u32);

impl TaskId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl From<u32> for TaskId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque token identifying an emitted message for the runtime's
/// reliability layer.
#[derive(Debug, Copy, Clone, Eq, PartialOrd, Ord, PartialEq, Serialize, Deserialize, Hash)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl From<u64> for MessageId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! name_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Eq, PartialOrd, Ord, PartialEq, Hash)]
        pub struct $name(Arc<str>);

        impl $name {
            pub fn new(name: impl AsRef<str>) -> Self {
                Self(Arc::from(name.as_ref()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(Arc::from(value))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_id!(
    /// The name of a component (an operator) in the topology.
    ComponentId
);

name_id!(
    /// The name of a logical output stream declared by a producer component.
    StreamId
);

/// Name of the stream used when a producer does not name one explicitly.
pub const DEFAULT_STREAM: &str = "default";

impl Default for StreamId {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM)
    }
}

/// Producer-side provenance of an emitted record: the inbound messages it was
/// derived from.
///
/// Source components emit with no anchors and identify their output with a
/// [`MessageId`] instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Anchors(Vec<MessageId>);

impl Anchors {
    /// An empty anchor set.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn ids(&self) -> &[MessageId] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<MessageId> for Anchors {
    fn from_iter<T: IntoIterator<Item = MessageId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Consumer-side provenance of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    /// The task that sent the message.
    pub source_task: TaskId,
    /// The component the sending task belongs to.
    pub source_component: ComponentId,
    /// The stream the message arrived on.
    pub stream: StreamId,
    /// The message id assigned by the runtime, if tracked.
    pub message_id: Option<MessageId>,
}

impl Provenance {
    pub fn new(source_task: TaskId, source_component: ComponentId, stream: StreamId) -> Self {
        Self {
            source_task,
            source_component,
            stream,
            message_id: None,
        }
    }

    pub fn with_message_id(self, message_id: MessageId) -> Self {
        Self {
            message_id: Some(message_id),
            ..self
        }
    }
}
