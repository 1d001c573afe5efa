//! Read-only topology metadata consumed by the batching engine.
//!
//! A topology is a set of components, each running a fixed number of tasks.
//! Producer components declare typed output streams; consumer components
//! subscribe to those streams with a [`Grouping`] deciding which consumer
//! task(s) receive each record.
//!
//! Topologies are assembled through the [`OutputDeclarer`] and
//! [`InputDeclarer`] traits. Wrapping a component's declarer in a
//! [`BatchingDeclarer`] mirrors every stream and every non-direct
//! subscription onto a shadow direct stream, which is what allows
//! pre-partitioned batches to be delivered point-to-point.

use std::fmt::Debug;
use std::sync::Arc;

use batchflow_types::{ComponentId, Record, Schema, SchemaError, StreamId, TaskId};
use indexmap::IndexMap;
use thiserror::Error;

mod shim;
pub use shim::*;

#[derive(Debug, Error)]
pub enum Error {
    #[error("component {0} declared twice")]
    DuplicateComponent(ComponentId),

    #[error("component {0} must run at least one task")]
    ZeroParallelism(ComponentId),

    #[error("no task ids left for the {parallelism} tasks of component {component}")]
    TaskIdsExhausted {
        component: ComponentId,
        parallelism: usize,
    },

    #[error("component {component} declared stream {stream} twice")]
    DuplicateStream {
        component: ComponentId,
        stream: StreamId,
    },

    #[error("stream name {stream} uses the reserved batch stream prefix")]
    ReservedStreamName { stream: StreamId },

    #[error("component {consumer} subscribed to {producer}/{stream} twice")]
    DuplicateSubscription {
        consumer: ComponentId,
        producer: ComponentId,
        stream: StreamId,
    },

    #[error("component {consumer} subscribed to unknown component {producer}")]
    UnknownComponent {
        consumer: ComponentId,
        producer: ComponentId,
    },

    #[error("component {consumer} subscribed to undeclared stream {producer}/{stream}")]
    UnknownStream {
        consumer: ComponentId,
        producer: ComponentId,
        stream: StreamId,
    },

    #[error(
        "component {consumer} uses {grouping} grouping on {producer}/{stream} \
         (direct stream: {stream_direct})"
    )]
    GroupingMismatch {
        consumer: ComponentId,
        producer: ComponentId,
        stream: StreamId,
        grouping: &'static str,
        stream_direct: bool,
    },

    #[error("component {consumer} uses a fields grouping on {stream} with no key fields")]
    EmptyFieldsGrouping {
        consumer: ComponentId,
        stream: StreamId,
    },

    #[error("component {consumer} groups {stream} by an invalid key: {source}")]
    InvalidKey {
        consumer: ComponentId,
        stream: StreamId,
        source: SchemaError,
    },
}

/// A specialized `Error` for topology assembly errors
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A user supplied partitioning function.
pub trait CustomGrouping: Debug + Send + Sync {
    /// Choose the subset of `live_tasks` that receives `record`.
    fn choose_tasks(&self, live_tasks: &[TaskId], record: &Record) -> Vec<TaskId>;
}

/// The partitioning strategy of a subscription.
#[derive(Debug, Clone)]
pub enum Grouping {
    /// Records are spread evenly over the consumer's tasks.
    Shuffle,
    /// Records with equal values for the named attributes go to the same
    /// task.
    Fields(Vec<String>),
    /// Every record goes to the consumer's lowest task id.
    Global,
    /// The destination is chosen per record by a user callback.
    Custom(Arc<dyn CustomGrouping>),
    /// The producer names the destination task of every record.
    Direct,
}

impl Grouping {
    /// Convenience constructor for [`Grouping::Fields`].
    pub fn fields<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Fields(fields.into_iter().map(Into::into).collect())
    }

    pub fn is_direct(&self) -> bool {
        matches!(self, Self::Direct)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Shuffle => "shuffle",
            Self::Fields(_) => "fields",
            Self::Global => "global",
            Self::Custom(_) => "custom",
            Self::Direct => "direct",
        }
    }
}

/// A stream declared by a producer component.
#[derive(Debug, Clone)]
pub struct StreamDeclaration {
    id: StreamId,
    schema: Arc<Schema>,
    direct: bool,
}

impl StreamDeclaration {
    pub fn id(&self) -> &StreamId {
        &self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Whether the producer addresses every record to an explicit task.
    pub fn is_direct(&self) -> bool {
        self.direct
    }
}

/// One consumer of a stream: its identity, live tasks and grouping.
#[derive(Debug, Clone)]
pub struct Receiver {
    consumer: ComponentId,
    tasks: Arc<[TaskId]>,
    grouping: Grouping,
}

impl Receiver {
    pub fn consumer(&self) -> &ComponentId {
        &self.consumer
    }

    /// The consumer's live tasks in ascending id order.
    pub fn tasks(&self) -> &Arc<[TaskId]> {
        &self.tasks
    }

    pub fn grouping(&self) -> &Grouping {
        &self.grouping
    }
}

/// Declares the output streams of a component.
pub trait OutputDeclarer {
    fn declare_stream(&mut self, stream: StreamId, direct: bool, schema: Schema) -> Result<()>;
}

/// Declares the inputs of a component.
pub trait InputDeclarer {
    fn subscribe(
        &mut self,
        producer: &ComponentId,
        stream: &StreamId,
        grouping: Grouping,
    ) -> Result<()>;
}

#[derive(Debug)]
struct Subscription {
    producer: ComponentId,
    stream: StreamId,
    grouping: Grouping,
}

#[derive(Debug)]
struct ComponentSpec {
    tasks: Arc<[TaskId]>,
    streams: IndexMap<StreamId, StreamDeclaration>,
    inputs: Vec<Subscription>,
}

/// Assembles a [`Topology`], assigning task ids in declaration order.
#[derive(Debug)]
pub struct TopologyBuilder {
    components: IndexMap<ComponentId, ComponentSpec>,
    next_task: u32,
}

impl Default for TopologyBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self {
            components: IndexMap::new(),
            next_task: 1,
        }
    }

    /// Add a component running `parallelism` tasks and return a declarer
    /// for its streams and subscriptions.
    pub fn component(
        &mut self,
        id: impl Into<ComponentId>,
        parallelism: usize,
    ) -> Result<ComponentDeclarer<'_>> {
        let id = id.into();
        if parallelism == 0 {
            return Err(Error::ZeroParallelism(id));
        }
        if self.components.contains_key(&id) {
            return Err(Error::DuplicateComponent(id));
        }

        let first = self.next_task;
        self.next_task = u32::try_from(parallelism)
            .ok()
            .and_then(|n| first.checked_add(n))
            .ok_or_else(|| Error::TaskIdsExhausted {
                component: id.clone(),
                parallelism,
            })?;
        let tasks = (first..self.next_task).map(TaskId::new).collect();

        let spec = self.components.entry(id.clone()).or_insert(ComponentSpec {
            tasks,
            streams: IndexMap::new(),
            inputs: vec![],
        });

        Ok(ComponentDeclarer { id, spec })
    }

    /// Validate every subscription and freeze the topology.
    pub fn build(self) -> Result<Topology> {
        let mut receivers: IndexMap<(ComponentId, StreamId), Vec<Receiver>> = IndexMap::new();

        for (consumer, spec) in &self.components {
            for sub in &spec.inputs {
                let producer =
                    self.components
                        .get(&sub.producer)
                        .ok_or_else(|| Error::UnknownComponent {
                            consumer: consumer.clone(),
                            producer: sub.producer.clone(),
                        })?;
                let decl = producer
                    .streams
                    .get(&sub.stream)
                    .ok_or_else(|| Error::UnknownStream {
                        consumer: consumer.clone(),
                        producer: sub.producer.clone(),
                        stream: sub.stream.clone(),
                    })?;

                if decl.direct != sub.grouping.is_direct() {
                    return Err(Error::GroupingMismatch {
                        consumer: consumer.clone(),
                        producer: sub.producer.clone(),
                        stream: sub.stream.clone(),
                        grouping: sub.grouping.name(),
                        stream_direct: decl.direct,
                    });
                }

                if let Grouping::Fields(fields) = &sub.grouping {
                    if fields.is_empty() {
                        return Err(Error::EmptyFieldsGrouping {
                            consumer: consumer.clone(),
                            stream: sub.stream.clone(),
                        });
                    }
                    decl.schema
                        .indices_of(fields)
                        .map_err(|source| Error::InvalidKey {
                            consumer: consumer.clone(),
                            stream: sub.stream.clone(),
                            source,
                        })?;
                }

                receivers
                    .entry((sub.producer.clone(), sub.stream.clone()))
                    .or_default()
                    .push(Receiver {
                        consumer: consumer.clone(),
                        tasks: Arc::clone(&spec.tasks),
                        grouping: sub.grouping.clone(),
                    });
            }
        }

        Ok(Topology {
            components: self.components,
            receivers,
        })
    }
}

/// Declares the streams and subscriptions of one component of a
/// [`TopologyBuilder`].
#[derive(Debug)]
pub struct ComponentDeclarer<'a> {
    id: ComponentId,
    spec: &'a mut ComponentSpec,
}

impl ComponentDeclarer<'_> {
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.spec.tasks
    }
}

impl OutputDeclarer for ComponentDeclarer<'_> {
    fn declare_stream(&mut self, stream: StreamId, direct: bool, schema: Schema) -> Result<()> {
        if self.spec.streams.contains_key(&stream) {
            return Err(Error::DuplicateStream {
                component: self.id.clone(),
                stream,
            });
        }
        self.spec.streams.insert(
            stream.clone(),
            StreamDeclaration {
                id: stream,
                schema: Arc::new(schema),
                direct,
            },
        );
        Ok(())
    }
}

impl InputDeclarer for ComponentDeclarer<'_> {
    fn subscribe(
        &mut self,
        producer: &ComponentId,
        stream: &StreamId,
        grouping: Grouping,
    ) -> Result<()> {
        if self
            .spec
            .inputs
            .iter()
            .any(|s| &s.producer == producer && &s.stream == stream)
        {
            return Err(Error::DuplicateSubscription {
                consumer: self.id.clone(),
                producer: producer.clone(),
                stream: stream.clone(),
            });
        }
        self.spec.inputs.push(Subscription {
            producer: producer.clone(),
            stream: stream.clone(),
            grouping,
        });
        Ok(())
    }
}

/// A validated, immutable topology.
#[derive(Debug)]
pub struct Topology {
    components: IndexMap<ComponentId, ComponentSpec>,
    receivers: IndexMap<(ComponentId, StreamId), Vec<Receiver>>,
}

impl Topology {
    pub fn components(&self) -> impl Iterator<Item = &ComponentId> + '_ {
        self.components.keys()
    }

    /// The live tasks of `component`, in ascending id order.
    pub fn tasks(&self, component: &ComponentId) -> Option<&[TaskId]> {
        self.components.get(component).map(|c| c.tasks.as_ref())
    }

    /// The component a task belongs to.
    pub fn component_of(&self, task: TaskId) -> Option<&ComponentId> {
        self.components
            .iter()
            .find(|(_, spec)| spec.tasks.binary_search(&task).is_ok())
            .map(|(id, _)| id)
    }

    /// The streams declared by `component`, in declaration order.
    pub fn streams(&self, component: &ComponentId) -> impl Iterator<Item = &StreamDeclaration> + '_ {
        self.components
            .get(component)
            .into_iter()
            .flat_map(|c| c.streams.values())
    }

    pub fn stream(&self, component: &ComponentId, stream: &StreamId) -> Option<&StreamDeclaration> {
        self.components.get(component)?.streams.get(stream)
    }

    /// The consumers subscribed to `producer`'s `stream`, in declaration
    /// order of the consumers.
    pub fn receivers(&self, producer: &ComponentId, stream: &StreamId) -> &[Receiver] {
        self.receivers
            .get(&(producer.clone(), stream.clone()))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
