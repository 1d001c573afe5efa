//! Batched delivery must reach exactly the tasks, with exactly the records,
//! that per-record routing by the runtime would.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use batchflow_batch::{Message, PayloadRegistry};
use batchflow_collector::{
    BatchSink, BatchSizes, BatchingCollector, Debatcher, RecordHandler,
};
use batchflow_partition::{HashModPartitioner, KeyPartitioner};
use batchflow_topology::{
    BatchingDeclarer, CustomGrouping, Grouping, InputDeclarer, OutputDeclarer, Topology,
    TopologyBuilder,
};
use batchflow_types::{
    Anchors, ComponentId, MessageId, Provenance, Record, Schema, StreamId, TaskId, Value, record,
};

#[derive(Debug)]
struct ByNameLength;

impl CustomGrouping for ByNameLength {
    fn choose_tasks(&self, live_tasks: &[TaskId], record: &Record) -> Vec<TaskId> {
        let len = match record.get(0) {
            Some(Value::String(s)) => s.len(),
            _ => 0,
        };
        vec![live_tasks[len % live_tasks.len()]]
    }
}

fn clicks() -> StreamId {
    StreamId::from("clicks")
}

/// Four built-in groupings, plus an optional custom one.
fn topology(with_custom: bool) -> Topology {
    let mut b = TopologyBuilder::new();
    BatchingDeclarer::new(b.component("source", 1).unwrap())
        .declare_stream(clicks(), false, Schema::new(["user", "seq"]).unwrap())
        .unwrap();

    let mut consumers = vec![
        ("per_user", 3, Grouping::fields(["user"])),
        ("spread", 2, Grouping::Shuffle),
        ("totals", 2, Grouping::Global),
        ("per_seq", 2, Grouping::fields(["seq"])),
    ];
    if with_custom {
        consumers.push(("by_length", 3, Grouping::Custom(Arc::new(ByNameLength))));
    }
    for (name, parallelism, grouping) in consumers {
        BatchingDeclarer::new(b.component(name, parallelism).unwrap())
            .subscribe(&"source".into(), &clicks(), grouping)
            .unwrap();
    }
    b.build().unwrap()
}

fn records() -> Vec<Record> {
    let users = ["ann", "bartholomew", "cy", "dee", "ed", "frederica"];
    (0..97_i64)
        .map(|seq| record![users[seq as usize % users.len()], seq])
        .collect()
}

/// The destinations a per-record router picks, computed independently of the
/// resolver.
fn route_natively(t: &Topology, partitioner: &dyn KeyPartitioner) -> BTreeMap<TaskId, Vec<Record>> {
    let source = ComponentId::from("source");
    let receivers = t.receivers(&source, &clicks());
    let mut next = vec![0_usize; receivers.len()];
    let mut delivered = BTreeMap::<TaskId, Vec<Record>>::new();

    for record in records() {
        for (i, r) in receivers.iter().enumerate() {
            let tasks = r.tasks();
            let chosen = match r.grouping() {
                Grouping::Shuffle => {
                    let task = tasks[next[i] % tasks.len()];
                    next[i] += 1;
                    vec![task]
                }
                Grouping::Fields(fields) => {
                    let key = if fields[0] == "user" { [0] } else { [1] };
                    let idx =
                        partitioner.partition(&clicks(), r.consumer(), &record, &key, tasks.len());
                    vec![tasks[idx]]
                }
                Grouping::Global => vec![tasks[0]],
                Grouping::Custom(f) => f.choose_tasks(tasks, &record),
                Grouping::Direct => unreachable!("no direct subscribers"),
            };
            for task in chosen {
                delivered.entry(task).or_default().push(record.clone());
            }
        }
    }
    delivered
}

/// A transport encoding every direct send with a [`PayloadRegistry`].
#[derive(Debug)]
struct Wire {
    registry: PayloadRegistry,
    queues: BTreeMap<TaskId, Vec<(StreamId, bytes::Bytes)>>,
}

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
struct WireError(#[from] batchflow_batch::Error);

impl BatchSink for Wire {
    type Error = WireError;

    fn send(
        &mut self,
        _stream: &StreamId,
        _anchors: &Anchors,
        _record: Record,
        _message_id: Option<MessageId>,
    ) -> Result<Vec<TaskId>, Self::Error> {
        panic!("batched streams never use the router");
    }

    fn send_direct(
        &mut self,
        task: TaskId,
        stream: &StreamId,
        _anchors: &Anchors,
        message: Message,
        _message_id: Option<MessageId>,
    ) -> Result<Vec<TaskId>, Self::Error> {
        let bytes = self.registry.encode(&message)?;
        self.queues
            .entry(task)
            .or_default()
            .push((stream.clone(), bytes));
        Ok(vec![task])
    }
}

#[derive(Debug, Default)]
struct Inbox(Vec<Record>);

impl RecordHandler for Inbox {
    type Error = Infallible;

    fn on_record(&mut self, record: Record, provenance: &Provenance) -> Result<(), Self::Error> {
        assert_eq!(provenance.stream, clicks());
        self.0.push(record);
        Ok(())
    }
}

fn by_seq(mut records: Vec<Record>) -> Vec<Record> {
    records.sort_by_key(|r| match r.get(1) {
        Some(Value::I64(seq)) => *seq,
        _ => i64::MAX,
    });
    records
}

#[test]
fn batched_delivery_matches_native_routing() {
    for with_custom in [false, true] {
        check_against_native_routing(topology(with_custom));
    }
}

fn check_against_native_routing(t: Topology) {
    let partitioner = Arc::new(HashModPartitioner::new());
    let want = route_natively(&t, partitioner.as_ref());

    for capacity in [1, 4, 7, 1_000] {
        let wire = Wire {
            registry: PayloadRegistry::with_default_codecs(),
            queues: BTreeMap::new(),
        };
        let mut collector = BatchingCollector::new(
            &t,
            &"source".into(),
            &BatchSizes::uniform(capacity),
            Arc::clone(&partitioner) as Arc<dyn KeyPartitioner>,
            wire,
        )
        .unwrap();

        for record in records() {
            let got = collector
                .emit(&clicks(), &Anchors::none(), record, None)
                .unwrap();
            assert_eq!(got, None);
        }
        collector.flush().unwrap();
        assert_eq!(collector.open_buffers(), 0);

        let wire = collector.into_sink();
        let mut got = BTreeMap::new();
        for (task, queue) in wire.queues {
            let mut debatcher = Debatcher::new(Inbox::default());
            for (stream, bytes) in queue {
                assert_eq!(stream.as_str(), "__batch_clicks");
                let provenance = Provenance::new(TaskId::new(1), "source".into(), stream);
                debatcher
                    .on_encoded(provenance, &bytes, &wire.registry)
                    .unwrap();
            }
            got.insert(task, debatcher.into_handler().0);
        }

        assert_eq!(
            got.keys().collect::<Vec<_>>(),
            want.keys().collect::<Vec<_>>(),
            "capacity {capacity}"
        );
        for (task, records) in &want {
            assert_eq!(
                by_seq(got[task].clone()),
                by_seq(records.clone()),
                "capacity {capacity}, task {task}"
            );
        }
    }
}

#[test]
fn single_destination_order_is_preserved() {
    let mut b = TopologyBuilder::new();
    BatchingDeclarer::new(b.component("source", 1).unwrap())
        .declare_stream(clicks(), false, Schema::new(["user", "seq"]).unwrap())
        .unwrap();
    BatchingDeclarer::new(b.component("per_user", 4).unwrap())
        .subscribe(&"source".into(), &clicks(), Grouping::fields(["user"]))
        .unwrap();
    let t = b.build().unwrap();

    let wire = Wire {
        registry: PayloadRegistry::with_default_codecs(),
        queues: BTreeMap::new(),
    };
    let mut collector = BatchingCollector::new(
        &t,
        &"source".into(),
        &BatchSizes::uniform(3),
        Arc::new(HashModPartitioner::new()),
        wire,
    )
    .unwrap();
    for record in records() {
        collector
            .emit(&clicks(), &Anchors::none(), record, None)
            .unwrap();
    }
    collector.flush().unwrap();

    // With one keyed receiver every task owns exactly one buffer, so
    // arrival order is emit order.
    let wire = collector.into_sink();
    for (_, queue) in wire.queues {
        let mut debatcher = Debatcher::new(Inbox::default());
        for (stream, bytes) in queue {
            let provenance = Provenance::new(TaskId::new(1), "source".into(), stream);
            debatcher
                .on_encoded(provenance, &bytes, &wire.registry)
                .unwrap();
        }
        let received = debatcher.into_handler().0;
        assert_eq!(by_seq(received.clone()), received);
    }
}
