//! The producer-side batching collector.

use std::collections::BTreeMap;
use std::sync::Arc;

use batchflow_batch::{Message, RecordBatch};
use batchflow_partition::{DestinationResolver, KeyPartitioner};
use batchflow_topology::{Topology, is_shadow_stream, shadow_stream_id};
use batchflow_types::{Anchors, ComponentId, MessageId, Record, StreamId, TaskId};
use hashbrown::HashSet;
use indexmap::IndexMap;
use observability_deps::tracing::{debug, error, info, trace, warn};

use crate::{BatchSink, BatchSizes, EmitError, SetupError};

type EmitResult<T, S> = Result<T, EmitError<<S as BatchSink>::Error>>;

#[derive(Debug)]
struct Batched {
    /// An empty batch with the stream's shape, cloned into every new buffer.
    template: RecordBatch,
    /// The direct stream batches travel on.
    delivery: StreamId,
    resolver: DestinationResolver,
    /// One lazily created buffer per destination task.
    buffers: BTreeMap<TaskId, RecordBatch>,
    /// Set once a warning about untracked anchors has been logged.
    warned_untracked: bool,
}

#[derive(Debug)]
struct StreamState {
    direct: bool,
    /// `None` when batching is disabled for the stream.
    batched: Option<Batched>,
}

/// Buffers the records emitted by one producer task into per-destination
/// batches.
///
/// Every record is appended to the buffer of each consumer task the
/// runtime's router would have delivered it to, so batching never changes
/// where a record ends up. Buffers are keyed by destination task, so a
/// stream never holds more buffers than its receivers have tasks. A buffer
/// is shipped as soon as it fills; partially filled buffers are only shipped
/// by [`Self::flush`], which the owning task must call on deactivation.
///
/// The collector is owned by a single task and needs no synchronisation.
/// Wrap it in a mutex only to share it with a
/// [`PeriodicFlusher`](crate::PeriodicFlusher).
#[derive(Debug)]
pub struct BatchingCollector<S> {
    producer: ComponentId,
    streams: IndexMap<StreamId, StreamState>,
    sink: S,

    scratch_tasks: Vec<TaskId>,
}

impl<S> BatchingCollector<S>
where
    S: BatchSink,
{
    /// Build the batching state of every stream `producer` declares in
    /// `topology`.
    ///
    /// All configuration faults are reported here, before any record flows:
    /// batch sizes naming undeclared streams or exceeding
    /// [`RecordBatch::MAX_CAPACITY`], and batched streams lacking a direct
    /// batch stream wired to every consumer.
    pub fn new(
        topology: &Topology,
        producer: &ComponentId,
        sizes: &BatchSizes,
        partitioner: Arc<dyn KeyPartitioner>,
        sink: S,
    ) -> Result<Self, SetupError> {
        if topology.tasks(producer).is_none() {
            return Err(SetupError::UnknownComponent(producer.clone()));
        }

        let declared = topology
            .streams(producer)
            .filter(|decl| !is_shadow_stream(decl.id()))
            .collect::<Vec<_>>();
        sizes.validate(producer, declared.iter().map(|decl| decl.id()))?;

        let mut streams = IndexMap::with_capacity(declared.len());
        for decl in declared {
            let stream = decl.id();
            let batched = match sizes.for_stream(stream)? {
                None => {
                    debug!(%producer, %stream, "batching disabled");
                    None
                }
                Some(capacity) => {
                    let template = RecordBatch::new(capacity, decl.schema().width())?;
                    let receivers = topology.receivers(producer, stream);

                    let delivery = if decl.is_direct() {
                        stream.clone()
                    } else {
                        let shadow = shadow_stream_id(stream);
                        if !topology
                            .stream(producer, &shadow)
                            .is_some_and(|s| s.is_direct())
                        {
                            return Err(SetupError::MissingShadowStream {
                                producer: producer.clone(),
                                stream: stream.clone(),
                            });
                        }
                        let wired = topology
                            .receivers(producer, &shadow)
                            .iter()
                            .map(|r| r.consumer())
                            .collect::<HashSet<_>>();
                        if let Some(r) = receivers.iter().find(|r| !wired.contains(r.consumer())) {
                            return Err(SetupError::UnwiredShadowStream {
                                producer: producer.clone(),
                                stream: stream.clone(),
                                consumer: r.consumer().clone(),
                            });
                        }
                        shadow
                    };

                    // Every receiver is rewired onto the direct batch stream,
                    // so no indexed table is needed.
                    let resolver = DestinationResolver::for_direct_delivery(
                        decl,
                        receivers,
                        Arc::clone(&partitioner),
                    )?;

                    debug!(
                        %producer,
                        %stream,
                        %delivery,
                        capacity,
                        receivers = resolver.receiver_count(),
                        "batching enabled"
                    );

                    Some(Batched {
                        template,
                        delivery,
                        resolver,
                        buffers: BTreeMap::new(),
                        warned_untracked: false,
                    })
                }
            };

            streams.insert(
                stream.clone(),
                StreamState {
                    direct: decl.is_direct(),
                    batched,
                },
            );
        }

        info!(
            %producer,
            streams = streams.len(),
            batched = streams.values().filter(|s| s.batched.is_some()).count(),
            "initialised batching collector"
        );

        Ok(Self {
            producer: producer.clone(),
            streams,
            sink,
            scratch_tasks: vec![],
        })
    }

    /// Emit `record` on the non-direct `stream`.
    ///
    /// When batching is disabled for `stream` the record is sent immediately
    /// and the tasks it was delivered to are returned. Otherwise the record
    /// is buffered and `None` is returned: its destinations are not known to
    /// have received it until its batch ships.
    ///
    /// The record is appended for every destination before any filled
    /// buffer is shipped. If a ship fails the error is returned after the
    /// remaining filled buffers have been sent.
    pub fn emit(
        &mut self,
        stream: &StreamId,
        anchors: &Anchors,
        record: Record,
        message_id: Option<MessageId>,
    ) -> EmitResult<Option<Vec<TaskId>>, S> {
        let Self {
            producer,
            streams,
            sink,
            scratch_tasks,
        } = self;

        let state = streams
            .get_mut(stream)
            .ok_or_else(|| EmitError::UnknownStream(stream.clone()))?;
        if state.direct {
            return Err(EmitError::DirectStreamRequiresTask(stream.clone()));
        }
        let Some(batched) = &mut state.batched else {
            return sink
                .send(stream, anchors, record, message_id)
                .map(Some)
                .map_err(EmitError::Send);
        };

        check_record::<S::Error>(producer, stream, batched, anchors, message_id, &record)?;

        batched.resolver.resolve_tasks(&record, scratch_tasks);
        append_and_ship(sink, stream, batched, scratch_tasks, record)?;

        Ok(None)
    }

    /// Emit `record` to `task` on the direct `stream`.
    pub fn emit_direct(
        &mut self,
        task: TaskId,
        stream: &StreamId,
        anchors: &Anchors,
        record: Record,
        message_id: Option<MessageId>,
    ) -> EmitResult<(), S> {
        let Self {
            producer,
            streams,
            sink,
            ..
        } = self;

        let state = streams
            .get_mut(stream)
            .ok_or_else(|| EmitError::UnknownStream(stream.clone()))?;
        if !state.direct {
            return Err(EmitError::NotDirectStream(stream.clone()));
        }
        let Some(batched) = &mut state.batched else {
            sink.send_direct(task, stream, anchors, Message::Record(record), message_id)
                .map_err(EmitError::Send)?;
            return Ok(());
        };

        if !batched.resolver.accepts_task(task) {
            return Err(EmitError::UnknownTask {
                stream: stream.clone(),
                task,
            });
        }
        check_record::<S::Error>(producer, stream, batched, anchors, message_id, &record)?;

        append_and_ship(sink, stream, batched, &[task], record)
    }

    /// Ship every non-empty buffer of every stream, full or not, returning
    /// the number of buffers shipped.
    ///
    /// On a transport failure the failed batch is lost and the remaining
    /// buffers stay in place for a later flush.
    pub fn flush(&mut self) -> EmitResult<usize, S> {
        let Self { streams, sink, .. } = self;
        let mut shipped = 0;

        for (stream, state) in streams.iter_mut() {
            let Some(batched) = &mut state.batched else {
                continue;
            };
            for (task, buffer) in batched.buffers.iter_mut() {
                if buffer.is_empty() {
                    continue;
                }
                let batch = std::mem::replace(buffer, batched.template.empty_like());
                ship(sink, stream, &batched.delivery, *task, batch)?;
                shipped += 1;
            }
        }

        if shipped > 0 {
            debug!(producer = %self.producer, shipped, "flushed batch buffers");
        }
        Ok(shipped)
    }

    /// The number of records buffered for `stream`.
    pub fn pending_rows(&self, stream: &StreamId) -> usize {
        self.streams
            .get(stream)
            .and_then(|s| s.batched.as_ref())
            .map(|b| b.buffers.values().map(RecordBatch::rows).sum::<usize>())
            .unwrap_or_default()
    }

    /// The number of non-empty buffers across all streams.
    pub fn open_buffers(&self) -> usize {
        self.streams
            .values()
            .filter_map(|s| s.batched.as_ref())
            .map(|b| b.buffers.values().filter(|b| !b.is_empty()).count())
            .sum()
    }

    /// The number of buffers allocated for `stream`, empty or not.
    pub fn allocated_buffers(&self, stream: &StreamId) -> usize {
        self.streams
            .get(stream)
            .and_then(|s| s.batched.as_ref())
            .map(|b| b.buffers.len())
            .unwrap_or_default()
    }

    /// The batch capacity of `stream`, `None` if batching is disabled or the
    /// stream is unknown.
    pub fn capacity(&self, stream: &StreamId) -> Option<usize> {
        self.streams
            .get(stream)?
            .batched
            .as_ref()
            .map(|b| b.template.capacity())
    }

    pub fn producer(&self) -> &ComponentId {
        &self.producer
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Consume the collector, returning the sink. Buffered records are
    /// dropped: call [`Self::flush`] first.
    pub fn into_sink(self) -> S {
        let pending = self.open_buffers();
        if pending > 0 {
            warn!(producer = %self.producer, pending, "dropping unflushed batch buffers");
        }
        self.sink
    }
}

/// Take the record out of `pending` for the last destination, clone it for
/// every other one.
fn next_copy(pending: &mut Option<Record>, last: bool) -> Record {
    match (last, pending.take()) {
        (true, Some(record)) => record,
        (false, Some(record)) => {
            let copy = record.clone();
            *pending = Some(record);
            copy
        }
        (_, None) => unreachable!("record consumed before its last destination"),
    }
}

/// Validate an emitted record against its stream before any buffer is
/// touched.
fn check_record<E>(
    producer: &ComponentId,
    stream: &StreamId,
    batched: &mut Batched,
    anchors: &Anchors,
    message_id: Option<MessageId>,
    record: &Record,
) -> Result<(), EmitError<E>> {
    let width = batched.template.width();
    debug_assert_eq!(
        record.arity(),
        width,
        "record emitted on {stream} does not match the stream schema"
    );
    if record.arity() != width {
        error!(
            %producer,
            %stream,
            expected = width,
            actual = record.arity(),
            "dropping record with mismatched arity"
        );
        return Err(EmitError::Batch(batchflow_batch::Error::ArityMismatch {
            expected: width,
            actual: record.arity(),
        }));
    }

    if !batched.warned_untracked && (!anchors.is_empty() || message_id.is_some()) {
        batched.warned_untracked = true;
        warn!(
            %producer,
            %stream,
            "batched records are not tracked individually, anchors and message ids are dropped"
        );
    }
    Ok(())
}

/// Append `record` to the buffer of every task in `tasks`, then ship the
/// buffers that filled up.
///
/// Every filled buffer is sent even if an earlier send fails; the first
/// failure is returned.
fn append_and_ship<S>(
    sink: &mut S,
    stream: &StreamId,
    batched: &mut Batched,
    tasks: &[TaskId],
    record: Record,
) -> EmitResult<(), S>
where
    S: BatchSink,
{
    let Batched {
        template,
        delivery,
        buffers,
        ..
    } = batched;

    let mut sealed = vec![];
    let mut pending = Some(record);
    for (i, &task) in tasks.iter().enumerate() {
        let record = next_copy(&mut pending, i + 1 == tasks.len());
        let buffer = buffers.entry(task).or_insert_with(|| template.empty_like());
        buffer.append(record)?;
        if buffer.is_full() {
            sealed.push((task, std::mem::replace(buffer, template.empty_like())));
        }
    }

    let mut result = Ok(());
    for (task, batch) in sealed {
        if let Err(e) = ship(sink, stream, delivery, task, batch) {
            if result.is_ok() {
                result = Err(e);
            }
        }
    }
    result
}

/// Send `batch` to `task` on the direct stream `delivery`. A batch whose
/// send fails is dropped.
fn ship<S>(
    sink: &mut S,
    stream: &StreamId,
    delivery: &StreamId,
    task: TaskId,
    batch: RecordBatch,
) -> EmitResult<(), S>
where
    S: BatchSink,
{
    let rows = batch.rows();
    trace!(%stream, %delivery, %task, rows, "sending batch");
    sink.send_direct(
        task,
        delivery,
        &Anchors::none(),
        Message::Batch(Arc::new(batch)),
        None,
    )
    .map_err(|e| {
        warn!(%stream, %task, rows, error = %e, "batch send failed, batch dropped");
        EmitError::Send(e)
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use batchflow_partition::HashModPartitioner;
    use batchflow_topology::{
        BatchingDeclarer, Grouping, InputDeclarer, OutputDeclarer, TopologyBuilder,
    };
    use batchflow_types::{Schema, record};
    use proptest::prelude::*;

    use super::*;
    use crate::mock::{RecordingSink, Sent};

    fn schema() -> Schema {
        Schema::new(["user", "page"]).unwrap()
    }

    /// source (1 task) declaring "clicks" and the direct "targeted" stream,
    /// with the given (parallelism, grouping) consumers of "clicks" and one
    /// 2-task direct consumer of "targeted".
    fn topology(consumers: Vec<(usize, Grouping)>) -> Topology {
        let mut b = TopologyBuilder::new();
        {
            let mut source = BatchingDeclarer::new(b.component("source", 1).unwrap());
            source
                .declare_stream("clicks".into(), false, schema())
                .unwrap();
            source
                .declare_stream("targeted".into(), true, schema())
                .unwrap();
        }
        for (i, (n, grouping)) in consumers.into_iter().enumerate() {
            BatchingDeclarer::new(b.component(format!("c{i}"), n).unwrap())
                .subscribe(&"source".into(), &"clicks".into(), grouping)
                .unwrap();
        }
        BatchingDeclarer::new(b.component("direct", 2).unwrap())
            .subscribe(&"source".into(), &"targeted".into(), Grouping::Direct)
            .unwrap();
        b.build().unwrap()
    }

    fn collector(t: &Topology, sizes: BatchSizes) -> BatchingCollector<RecordingSink> {
        BatchingCollector::new(
            t,
            &"source".into(),
            &sizes,
            Arc::new(HashModPartitioner::new()),
            RecordingSink::default(),
        )
        .unwrap()
    }

    fn clicks() -> StreamId {
        "clicks".into()
    }

    #[test]
    fn disabled_batching_passes_records_through() {
        let t = topology(vec![(2, Grouping::Shuffle)]);
        let native = vec![TaskId::new(2)];
        let mut c = BatchingCollector::new(
            &t,
            &"source".into(),
            &BatchSizes::disabled(),
            Arc::new(HashModPartitioner::new()),
            RecordingSink::default().with_native_destinations(native.clone()),
        )
        .unwrap();

        let got = c
            .emit(&clicks(), &Anchors::none(), record!["alice", "/"], None)
            .unwrap();
        assert_eq!(got, Some(native));
        assert_eq!(c.open_buffers(), 0);
        assert_eq!(c.capacity(&clicks()), None);

        c.emit_direct(
            TaskId::new(4),
            &"targeted".into(),
            &Anchors::none(),
            record!["bob", "/x"],
            None,
        )
        .unwrap();

        let sent = c.sink().sent();
        assert!(matches!(&sent[0], Sent::Native { stream, .. } if stream == &clicks()));
        assert!(matches!(
            &sent[1],
            Sent::Direct { task, message: Message::Record(_), .. } if *task == TaskId::new(4)
        ));
        assert_eq!(c.flush().unwrap(), 0);
    }

    #[test_log::test]
    fn full_buffers_ship_on_the_batch_stream() {
        let t = topology(vec![(1, Grouping::Shuffle)]);
        let mut c = collector(&t, BatchSizes::uniform(2));
        let consumer = t.tasks(&"c0".into()).unwrap()[0];

        let got = c
            .emit(&clicks(), &Anchors::none(), record!["a", "/1"], None)
            .unwrap();
        assert_eq!(got, None);
        assert!(c.sink().sent().is_empty());
        assert_eq!(c.pending_rows(&clicks()), 1);

        c.emit(&clicks(), &Anchors::none(), record!["b", "/2"], None)
            .unwrap();
        assert_eq!(c.pending_rows(&clicks()), 0);

        let batches = c.sink().batches();
        assert_eq!(batches.len(), 1);
        let (task, stream, batch) = &batches[0];
        assert_eq!(*task, consumer);
        assert_eq!(stream.as_str(), "__batch_clicks");
        assert_eq!(
            batch.iter_rows().collect::<Vec<_>>(),
            vec![record!["a", "/1"], record!["b", "/2"]]
        );
    }

    #[test]
    fn keyed_batches_reach_every_receiver_once() {
        let t = topology(vec![
            (3, Grouping::fields(["user"])),
            (2, Grouping::Global),
        ]);
        let mut c = collector(&t, BatchSizes::uniform(100));

        for i in 0..20_i64 {
            c.emit(&clicks(), &Anchors::none(), record![i % 5, i], None)
                .unwrap();
        }
        c.flush().unwrap();

        // Every record arrives exactly once at each consumer component, and
        // the global consumer only ever sees its lowest task.
        let global = t.tasks(&"c1".into()).unwrap()[0];
        let keyed = t.tasks(&"c0".into()).unwrap();
        let mut per_component = [0, 0];
        let mut owner = std::collections::HashMap::new();
        for (task, _, batch) in c.sink().batches() {
            if task == global {
                per_component[1] += batch.rows();
                continue;
            }
            assert!(keyed.contains(&task), "unexpected destination {task}");
            per_component[0] += batch.rows();
            for row in batch.iter_rows() {
                let user = row.get(0).unwrap().to_string();
                assert_eq!(*owner.entry(user).or_insert(task), task);
            }
        }
        assert_eq!(per_component, [20, 20]);
    }

    #[test]
    fn buffers_are_bounded_by_receiver_tasks() {
        let t = topology(vec![
            (40, Grouping::fields(["user"])),
            (40, Grouping::Shuffle),
            (40, Grouping::Shuffle),
            (40, Grouping::Shuffle),
        ]);
        let mut c = collector(&t, BatchSizes::uniform(10));
        assert_eq!(c.allocated_buffers(&clicks()), 0);

        for i in 0..2_000_i64 {
            c.emit(&clicks(), &Anchors::none(), record![i % 7, i], None)
                .unwrap();
        }
        assert!(c.allocated_buffers(&clicks()) <= 4 * 40);

        // Keyed and shuffled buffers fill and ship without a flush.
        let before_flush = c.sink().batches();
        assert!(!before_flush.is_empty());
        assert!(before_flush.iter().all(|(_, _, b)| b.rows() == 10));

        c.flush().unwrap();
        let rows = c
            .sink()
            .batches()
            .iter()
            .map(|(_, _, b)| b.rows())
            .sum::<usize>();
        assert_eq!(rows, 4 * 2_000);
    }

    #[test]
    fn failed_send_does_not_skip_other_destinations() {
        let t = topology(vec![
            (1, Grouping::Shuffle),
            (1, Grouping::Global),
            (1, Grouping::fields(["user"])),
        ]);
        let mut c = collector(&t, BatchSizes::uniform(1));

        c.sink_mut().fail_next(1);
        let err = c
            .emit(&clicks(), &Anchors::none(), record!["a", "/"], None)
            .unwrap_err();
        assert!(matches!(err, EmitError::Send(_)));

        // Only the first sealed batch is lost, the others were still sent.
        let tasks = c
            .sink()
            .batches()
            .into_iter()
            .map(|(task, _, _)| task)
            .collect::<Vec<_>>();
        assert_eq!(
            tasks,
            vec![
                t.tasks(&"c1".into()).unwrap()[0],
                t.tasks(&"c2".into()).unwrap()[0],
            ]
        );
        assert_eq!(c.open_buffers(), 0);
    }

    #[test]
    fn flush_drains_every_buffer() {
        let t = topology(vec![(3, Grouping::Shuffle), (2, Grouping::fields(["user"]))]);
        let mut c = collector(&t, BatchSizes::uniform(50));

        for i in 0..10_i64 {
            c.emit(&clicks(), &Anchors::none(), record![i, "/"], None)
                .unwrap();
        }
        for task in t.tasks(&"direct".into()).unwrap() {
            c.emit_direct(*task, &"targeted".into(), &Anchors::none(), record![1_i64, "/"], None)
                .unwrap();
        }

        let open = c.open_buffers();
        assert!(open > 0);
        assert!(c.sink().sent().is_empty());

        assert_eq!(c.flush().unwrap(), open);
        assert_eq!(c.open_buffers(), 0);
        assert_eq!(c.pending_rows(&clicks()), 0);
        assert_eq!(c.pending_rows(&"targeted".into()), 0);

        // Nothing left to send.
        let sent = c.sink().sent().len();
        assert_eq!(c.flush().unwrap(), 0);
        assert_eq!(c.sink().sent().len(), sent);
    }

    #[test]
    fn direct_streams_batch_per_task() {
        let t = topology(vec![]);
        let mut c = collector(&t, BatchSizes::uniform(2));
        let tasks = t.tasks(&"direct".into()).unwrap().to_vec();
        let targeted = StreamId::from("targeted");

        for i in 0..3_i64 {
            c.emit_direct(tasks[0], &targeted, &Anchors::none(), record![i, "/"], None)
                .unwrap();
        }
        c.emit_direct(tasks[1], &targeted, &Anchors::none(), record![9_i64, "/"], None)
            .unwrap();

        let batches = c.sink().batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, tasks[0]);
        assert_eq!(batches[0].1, targeted);
        assert_eq!(c.pending_rows(&targeted), 2);

        let err = c
            .emit_direct(TaskId::new(99), &targeted, &Anchors::none(), record![1_i64, "/"], None)
            .unwrap_err();
        assert!(matches!(err, EmitError::UnknownTask { .. }));

        let err = c
            .emit(&targeted, &Anchors::none(), record![1_i64, "/"], None)
            .unwrap_err();
        assert!(matches!(err, EmitError::DirectStreamRequiresTask(_)));

        let err = c
            .emit_direct(tasks[0], &clicks(), &Anchors::none(), record![1_i64, "/"], None)
            .unwrap_err();
        assert!(matches!(err, EmitError::NotDirectStream(_)));

        let err = c
            .emit(&"__batch_clicks".into(), &Anchors::none(), record![1_i64, "/"], None)
            .unwrap_err();
        assert!(matches!(err, EmitError::UnknownStream(_)));
    }

    #[test]
    fn per_stream_sizes() {
        let t = topology(vec![(1, Grouping::Shuffle)]);
        let mut c = collector(&t, BatchSizes::per_stream(0, [("targeted", 4)]));
        assert_eq!(c.capacity(&clicks()), None);
        assert_eq!(c.capacity(&"targeted".into()), Some(4));

        c.emit(&clicks(), &Anchors::none(), record!["a", "/"], None)
            .unwrap();
        assert!(matches!(&c.sink().sent()[0], Sent::Native { .. }));
    }

    #[test]
    #[cfg_attr(debug_assertions, should_panic(expected = "does not match the stream schema"))]
    fn arity_mismatch_is_rejected() {
        let t = topology(vec![(1, Grouping::Shuffle)]);
        let mut c = collector(&t, BatchSizes::uniform(4));

        let err = c
            .emit(&clicks(), &Anchors::none(), record!["only one"], None)
            .unwrap_err();
        assert!(matches!(err, EmitError::Batch(_)));
        assert_eq!(c.open_buffers(), 0);
    }

    #[test]
    fn send_failures_propagate_and_lose_the_batch() {
        let t = topology(vec![(1, Grouping::Shuffle)]);
        let mut c = collector(&t, BatchSizes::uniform(2));

        c.emit(&clicks(), &Anchors::none(), record!["a", "/"], None)
            .unwrap();
        c.sink_mut().fail_next(1);
        let err = c
            .emit(&clicks(), &Anchors::none(), record!["b", "/"], None)
            .unwrap_err();
        assert!(matches!(err, EmitError::Send(_)));

        // The failed batch is gone, the buffer starts afresh.
        assert_eq!(c.pending_rows(&clicks()), 0);
        c.emit(&clicks(), &Anchors::none(), record!["c", "/"], None)
            .unwrap();
        assert_eq!(c.flush().unwrap(), 1);
        assert_eq!(c.sink().batches().len(), 1);
    }

    #[test_log::test]
    fn untracked_anchors_are_dropped() {
        let t = topology(vec![(1, Grouping::Shuffle)]);
        let mut c = collector(&t, BatchSizes::uniform(1));
        let anchors = [MessageId::new(7)].into_iter().collect::<Anchors>();

        c.emit(&clicks(), &anchors, record!["a", "/"], Some(MessageId::new(1)))
            .unwrap();
        match &c.sink().sent()[0] {
            Sent::Direct {
                anchors,
                message_id,
                ..
            } => {
                assert!(anchors.is_empty());
                assert_eq!(*message_id, None);
            }
            other => panic!("unexpected send {other:?}"),
        }
    }

    #[test]
    fn setup_rejects_misconfiguration() {
        let t = topology(vec![(1, Grouping::Shuffle)]);
        let new = |sizes: BatchSizes, producer: &str| {
            BatchingCollector::new(
                &t,
                &producer.into(),
                &sizes,
                Arc::new(HashModPartitioner::new()),
                RecordingSink::default(),
            )
        };

        assert!(matches!(
            new(BatchSizes::uniform(1), "nope"),
            Err(SetupError::UnknownComponent(_))
        ));
        assert!(matches!(
            new(BatchSizes::per_stream(1, [("views", 2)]), "source"),
            Err(SetupError::UnknownBatchStream { .. })
        ));
        assert!(matches!(
            new(BatchSizes::uniform(i64::MAX), "source"),
            Err(SetupError::CapacityTooLarge { .. })
        ));

        // Declared without the batching declarer: no batch stream exists.
        let mut b = TopologyBuilder::new();
        b.component("source", 1)
            .unwrap()
            .declare_stream("clicks".into(), false, schema())
            .unwrap();
        let plain = b.build().unwrap();
        let err = BatchingCollector::new(
            &plain,
            &"source".into(),
            &BatchSizes::uniform(4),
            Arc::new(HashModPartitioner::new()),
            RecordingSink::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SetupError::MissingShadowStream { .. }));

        // A consumer subscribed to the stream but not to its batch stream.
        let mut b = TopologyBuilder::new();
        BatchingDeclarer::new(b.component("source", 1).unwrap())
            .declare_stream("clicks".into(), false, schema())
            .unwrap();
        b.component("c", 1)
            .unwrap()
            .subscribe(&"source".into(), &"clicks".into(), Grouping::Shuffle)
            .unwrap();
        let unwired = b.build().unwrap();
        let err = BatchingCollector::new(
            &unwired,
            &"source".into(),
            &BatchSizes::uniform(4),
            Arc::new(HashModPartitioner::new()),
            RecordingSink::default(),
        )
        .unwrap_err();
        assert!(matches!(err, SetupError::UnwiredShadowStream { consumer, .. } if consumer.as_str() == "c"));

        // Disabled batching needs no batch stream.
        BatchingCollector::new(
            &unwired,
            &"source".into(),
            &BatchSizes::disabled(),
            Arc::new(HashModPartitioner::new()),
            RecordingSink::default(),
        )
        .unwrap();
    }

    proptest! {
        /// N records into one buffer of capacity C ship ⌊N/C⌋ full batches
        /// before a flush and one batch of N mod C rows after it.
        #[test]
        fn prop_capacity(n in 0_usize..200, capacity in 1_usize..20) {
            let t = topology(vec![(1, Grouping::Global)]);
            let mut c = collector(&t, BatchSizes::uniform(capacity as i64));

            for i in 0..n {
                c.emit(&clicks(), &Anchors::none(), record![i as i64, "/"], None).unwrap();
            }
            let sizes = |c: &BatchingCollector<RecordingSink>| {
                c.sink().batches().iter().map(|(_, _, b)| b.rows()).collect::<Vec<_>>()
            };
            prop_assert_eq!(sizes(&c), vec![capacity; n / capacity]);

            c.flush().unwrap();
            let mut want = vec![capacity; n / capacity];
            if n % capacity != 0 {
                want.push(n % capacity);
            }
            prop_assert_eq!(sizes(&c), want);

            let rows = c.sink()
                .batches()
                .into_iter()
                .flat_map(|(_, _, b)| b.iter_rows().collect::<Vec<_>>())
                .collect::<Vec<_>>();
            let expected = (0..n).map(|i| record![i as i64, "/"]).collect::<Vec<_>>();
            prop_assert_eq!(rows, expected);
        }
    }
}
