//! Per-record destination resolution for one producer stream.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use batchflow_topology::{CustomGrouping, Grouping, Receiver, StreamDeclaration};
use batchflow_types::{ComponentId, Record, StreamId, TaskId};
use observability_deps::tracing::{debug, warn};

use crate::{BufferIndexLayout, ContiguousLayout, Error, KeyPartitioner, Result};

/// How the buffers of a stream are addressed. Fixed when the resolver is
/// built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableForm {
    /// Every destination is computable from the record alone; buffers live in
    /// an array of [`DestinationResolver::table_len`] slots.
    Indexed,
    /// At least one destination is data dependent (direct or custom
    /// grouping); buffers are keyed by task id.
    ByTask,
}

impl Display for TableForm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Indexed => f.write_str("indexed"),
            Self::ByTask => f.write_str("by-task"),
        }
    }
}

#[derive(Debug)]
enum Strategy {
    Shuffle { next: usize },
    Key { indices: Vec<usize> },
    Global,
    Custom(Arc<dyn CustomGrouping>),
    Direct,
}

#[derive(Debug)]
struct Route {
    consumer: ComponentId,
    tasks: Arc<[TaskId]>,
    strategy: Strategy,
}

#[derive(Debug)]
enum Plan {
    Contiguous(ContiguousLayout),
    MixedRadix(BufferIndexLayout),
    ByTask,
}

/// Re-derives, at the producer, the consumer task(s) the runtime's router
/// would pick for each record of one stream, without invoking the router.
///
/// Key partitioned receivers are resolved through the injected
/// [`KeyPartitioner`], which must be the router's own function. Shuffle
/// receivers rotate over their tasks and global receivers always pick the
/// lowest task id.
#[derive(Debug)]
pub struct DestinationResolver {
    stream: StreamId,
    routes: Vec<Route>,
    plan: Plan,
    partitioner: Arc<dyn KeyPartitioner>,
}

impl DestinationResolver {
    /// Plan the buffer table of `decl` as the runtime routes it: indexed
    /// when every receiver's choice is computable from the record, by task
    /// otherwise.
    pub fn new(
        decl: &StreamDeclaration,
        receivers: &[Receiver],
        partitioner: Arc<dyn KeyPartitioner>,
    ) -> Result<Self> {
        let stream = decl.id().clone();
        let routes = routes(decl, receivers)?;

        let data_dependent = decl.is_direct()
            || routes
                .iter()
                .any(|r| matches!(r.strategy, Strategy::Custom(_) | Strategy::Direct));
        let keyed = routes
            .iter()
            .any(|r| matches!(r.strategy, Strategy::Key { .. }));

        let plan = if data_dependent {
            Plan::ByTask
        } else if keyed {
            // Key partitioned receivers take the low order digits, so the
            // first one has weight 1 and the second the first's task count.
            let (keys, others): (Vec<_>, Vec<_>) = routes
                .iter()
                .enumerate()
                .partition(|(_, r)| matches!(r.strategy, Strategy::Key { .. }));
            Plan::MixedRadix(BufferIndexLayout::new(
                keys.into_iter()
                    .chain(others)
                    .map(|(i, r)| (i, r.tasks.len())),
            )?)
        } else {
            Plan::Contiguous(ContiguousLayout::new(routes.iter().map(|r| r.tasks.len()))?)
        };

        Ok(Self::with_plan(stream, routes, plan, partitioner))
    }

    /// Plan `decl` for delivery over a direct stream, where every receiver
    /// has been rewired to direct delivery and buffers are keyed by task.
    ///
    /// No index space is allocated: the number of buffers is bounded by the
    /// receivers' total task count.
    pub fn for_direct_delivery(
        decl: &StreamDeclaration,
        receivers: &[Receiver],
        partitioner: Arc<dyn KeyPartitioner>,
    ) -> Result<Self> {
        let routes = routes(decl, receivers)?;
        Ok(Self::with_plan(
            decl.id().clone(),
            routes,
            Plan::ByTask,
            partitioner,
        ))
    }

    fn with_plan(
        stream: StreamId,
        routes: Vec<Route>,
        plan: Plan,
        partitioner: Arc<dyn KeyPartitioner>,
    ) -> Self {
        let resolver = Self {
            stream,
            routes,
            plan,
            partitioner,
        };

        debug!(
            stream = %resolver.stream,
            receivers = resolver.routes.len(),
            form = %resolver.form(),
            slots = resolver.table_len(),
            "resolved buffer layout"
        );

        resolver
    }

    pub fn stream(&self) -> &StreamId {
        &self.stream
    }

    pub fn form(&self) -> TableForm {
        match self.plan {
            Plan::Contiguous(_) | Plan::MixedRadix(_) => TableForm::Indexed,
            Plan::ByTask => TableForm::ByTask,
        }
    }

    /// The number of buffer slots for [`TableForm::Indexed`] streams, 0 for
    /// [`TableForm::ByTask`].
    pub fn table_len(&self) -> usize {
        match &self.plan {
            Plan::Contiguous(l) => l.len(),
            Plan::MixedRadix(l) => l.len(),
            Plan::ByTask => 0,
        }
    }

    /// The mixed-radix layout, if any receiver is key partitioned and the
    /// stream is indexed.
    pub fn layout(&self) -> Option<&BufferIndexLayout> {
        match &self.plan {
            Plan::MixedRadix(l) => Some(l),
            _ => None,
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.routes.len()
    }

    /// Whether `task` belongs to any receiver of this stream.
    pub fn accepts_task(&self, task: TaskId) -> bool {
        self.routes
            .iter()
            .any(|r| r.tasks.binary_search(&task).is_ok())
    }

    /// The task index (into the receiver's ordered task list) chosen for
    /// `record` by receiver `receiver`.
    ///
    /// Returns `None` for custom and direct receivers, whose choice is not a
    /// single index.
    pub fn task_index(&mut self, receiver: usize, record: &Record) -> Option<usize> {
        choose(
            &mut self.routes[receiver],
            &self.stream,
            self.partitioner.as_ref(),
            record,
        )
    }

    /// Resolve the buffer slot(s) of `record` for an indexed stream into
    /// `out`.
    ///
    /// # Panics
    ///
    /// Panics if the stream is not [`TableForm::Indexed`].
    pub fn resolve_slots(&mut self, record: &Record, out: &mut Vec<usize>) {
        out.clear();
        let Self {
            stream,
            routes,
            plan,
            partitioner,
        } = self;

        match plan {
            Plan::Contiguous(layout) => {
                for (receiver, route) in routes.iter_mut().enumerate() {
                    let task = choose(route, stream, partitioner.as_ref(), record)
                        .expect("indexed streams have no custom or direct receivers");
                    out.push(layout.index(receiver, task));
                }
            }
            Plan::MixedRadix(layout) => {
                let slot = layout
                    .digits()
                    .iter()
                    .map(|d| {
                        let task =
                            choose(&mut routes[d.receiver], stream, partitioner.as_ref(), record)
                                .expect("indexed streams have no custom or direct receivers");
                        d.weight * task
                    })
                    .sum();
                out.push(slot);
            }
            Plan::ByTask => panic!("stream {stream} is not indexed"),
        }
    }

    /// The destination tasks of buffer slot `slot` of an indexed stream.
    pub fn slot_destinations(&self, slot: usize) -> Vec<TaskId> {
        match &self.plan {
            Plan::Contiguous(layout) => {
                let (receiver, task) = layout.locate(slot);
                vec![self.routes[receiver].tasks[task]]
            }
            Plan::MixedRadix(layout) => layout
                .digits()
                .iter()
                .zip(layout.decompose(slot))
                .map(|(d, task)| self.routes[d.receiver].tasks[task])
                .collect(),
            Plan::ByTask => vec![],
        }
    }

    /// Resolve the destination tasks of `record` for a by-task stream into
    /// `out`, sorted and without duplicates.
    ///
    /// Direct receivers contribute nothing: their destination is named by
    /// the producer.
    pub fn resolve_tasks(&mut self, record: &Record, out: &mut Vec<TaskId>) {
        out.clear();
        let Self {
            stream,
            routes,
            partitioner,
            ..
        } = self;

        for route in routes.iter_mut() {
            if let Some(task) = choose(route, stream, partitioner.as_ref(), record) {
                out.push(route.tasks[task]);
                continue;
            }

            if let Strategy::Custom(f) = &route.strategy {
                for task in f.choose_tasks(&route.tasks, record) {
                    if route.tasks.binary_search(&task).is_ok() {
                        out.push(task);
                    } else {
                        warn!(
                            %stream,
                            consumer = %route.consumer,
                            %task,
                            "custom grouping chose a task outside the consumer, dropping"
                        );
                    }
                }
            }
        }
        out.sort_unstable();
        out.dedup();
    }
}

/// One route per receiver, with key fields resolved against the schema.
fn routes(decl: &StreamDeclaration, receivers: &[Receiver]) -> Result<Vec<Route>> {
    let stream = decl.id();
    receivers
        .iter()
        .map(|r| {
            if r.tasks().is_empty() {
                return Err(Error::NoTasks {
                    consumer: r.consumer().clone(),
                    stream: stream.clone(),
                });
            }
            let strategy = match r.grouping() {
                Grouping::Shuffle => Strategy::Shuffle { next: 0 },
                Grouping::Fields(fields) => Strategy::Key {
                    indices: decl.schema().indices_of(fields).map_err(|source| {
                        Error::InvalidKey {
                            consumer: r.consumer().clone(),
                            stream: stream.clone(),
                            source,
                        }
                    })?,
                },
                Grouping::Global => Strategy::Global,
                Grouping::Custom(f) => Strategy::Custom(Arc::clone(f)),
                Grouping::Direct => Strategy::Direct,
            };
            Ok(Route {
                consumer: r.consumer().clone(),
                tasks: Arc::clone(r.tasks()),
                strategy,
            })
        })
        .collect()
}

/// The task index `route` picks for `record`, `None` if the choice is not a
/// single index.
fn choose(
    route: &mut Route,
    stream: &StreamId,
    partitioner: &dyn KeyPartitioner,
    record: &Record,
) -> Option<usize> {
    let count = route.tasks.len();
    match &mut route.strategy {
        Strategy::Shuffle { next } => {
            let idx = *next;
            *next = (idx + 1) % count;
            Some(idx)
        }
        Strategy::Key { indices } => Some(partitioner.partition(
            stream,
            &route.consumer,
            record,
            indices,
            count,
        )),
        Strategy::Global => Some(0),
        Strategy::Custom(_) | Strategy::Direct => None,
    }
}
