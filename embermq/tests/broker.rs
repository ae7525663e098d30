use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use embermq::conf::logging::To;
use embermq::conf::{Inner, Settings};
use embermq::replication::Replicator;
use embermq::types::{GroupName, TopicName};
use embermq::{AckLevel, Broker, BrokerError, Deadline, Delivery, Offset, Result, Subscription, TopicConfig};

fn settings<F: FnOnce(&mut Inner)>(dir: &Path, f: F) -> Settings {
    let mut inner = Inner::default();
    inner.log.to = To::Off;
    inner.storage.data_dir = dir.to_path_buf();
    f(&mut inner);
    Settings::from(inner)
}

fn open(dir: &Path) -> Broker {
    Broker::open(settings(dir, |_| {})).unwrap()
}

async fn publish_n(broker: &Broker, topic: &TopicName, n: usize) {
    for i in 0..n {
        let payload = Bytes::from(format!("msg-{i}"));
        broker.publish(topic, None, payload, AckLevel::Local, &Deadline::none()).await.unwrap();
    }
}

async fn drain(sub: &mut Subscription, expect: usize) -> Vec<Delivery> {
    let mut out = Vec::new();
    while out.len() < expect {
        let ds = sub.fetch(100, &Deadline::after(Duration::from_secs(5))).await.unwrap();
        assert!(!ds.is_empty(), "no messages after {}", out.len());
        out.extend(ds);
    }
    out
}

/// Whatever is available within `ms`, nothing if the wait times out.
async fn poll(sub: &mut Subscription, ms: u64) -> Vec<Delivery> {
    match sub.fetch(100, &Deadline::after(Duration::from_millis(ms))).await {
        Ok(ds) => ds,
        Err(BrokerError::Timeout) => Vec::new(),
        Err(e) => panic!("fetch failed, {e}"),
    }
}

fn offsets(ds: &[Delivery]) -> Vec<Offset> {
    ds.iter().map(|d| d.offset).collect()
}

#[tokio::test]
async fn publish_order_is_delivery_order() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("ordered");
    publish_n(&broker, &topic, 100).await;

    let mut sub = broker.subscribe(&topic, &GroupName::from("g"), "c", &Deadline::none()).await.unwrap();
    let ds = drain(&mut sub, 100).await;
    assert_eq!(offsets(&ds), (0..100).collect::<Vec<_>>());
    for d in ds.iter() {
        assert_eq!(d.payload, Bytes::from(format!("msg-{}", d.offset)));
        assert_eq!(d.topic, topic);
        assert!(!d.is_redelivery());
    }
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn offsets_continue_across_segments() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("rolling");
    let config = TopicConfig { segment_bytes: 256, index_interval_bytes: 64, ..TopicConfig::default() };
    broker.create_topic(&topic, config).await.unwrap();
    publish_n(&broker, &topic, 60).await;

    let info = broker.topics().await.remove(0);
    assert!(info.segments > 1, "expected a rotation, got {} segment(s)", info.segments);
    assert_eq!(info.high_water_mark, 60);
    assert!(broker.stats().rotations.count() > 0);

    let mut sub = broker.subscribe(&topic, &GroupName::from("g"), "c", &Deadline::none()).await.unwrap();
    assert_eq!(offsets(&drain(&mut sub, 60).await), (0..60).collect::<Vec<_>>());
    broker.shutdown().await.unwrap();

    //the chain survives a restart
    let broker = open(dir.path());
    assert_eq!(broker.high_water_mark(&topic).await.unwrap(), 60);
    let first = broker.publish(&topic, None, Bytes::from("more"), AckLevel::Local, &Deadline::none()).await.unwrap();
    assert_eq!(first, Some(60));
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn torn_write_is_recovered_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let topic = TopicName::from("torn");
    {
        let broker = open(dir.path());
        publish_n(&broker, &topic, 10).await;
        broker.shutdown().await.unwrap();
    }
    let seg = dir.path().join("torn").join(format!("{:020}.log", 0));
    let len = std::fs::metadata(&seg).unwrap().len();
    let f = std::fs::OpenOptions::new().write(true).open(&seg).unwrap();
    f.set_len(len - 3).unwrap();
    drop(f);

    let broker = open(dir.path());
    assert_eq!(broker.high_water_mark(&topic).await.unwrap(), 9);
    let next = broker.publish(&topic, None, Bytes::from("again"), AckLevel::Local, &Deadline::none()).await.unwrap();
    assert_eq!(next, Some(9));
    let mut sub = broker.subscribe(&topic, &GroupName::from("g"), "c", &Deadline::none()).await.unwrap();
    let ds = drain(&mut sub, 10).await;
    assert_eq!(offsets(&ds), (0..10).collect::<Vec<_>>());
    assert_eq!(ds[9].payload, Bytes::from("again"));
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn every_group_gets_every_message() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("fanout");
    let mut a = broker.subscribe(&topic, &GroupName::from("a"), "a1", &Deadline::none()).await.unwrap();
    let mut b = broker.subscribe(&topic, &GroupName::from("b"), "b1", &Deadline::none()).await.unwrap();
    publish_n(&broker, &topic, 20).await;

    assert_eq!(offsets(&drain(&mut a, 20).await), (0..20).collect::<Vec<_>>());
    assert_eq!(offsets(&drain(&mut b, 20).await), (0..20).collect::<Vec<_>>());
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn members_of_a_group_split_the_messages() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(settings(dir.path(), |s| s.consumer.max_inflight = 5)).unwrap();
    let topic = TopicName::from("work");
    let group = GroupName::from("workers");
    let mut c1 = broker.subscribe(&topic, &group, "c1", &Deadline::none()).await.unwrap();
    let mut c2 = broker.subscribe(&topic, &group, "c2", &Deadline::none()).await.unwrap();
    assert_eq!(c2.generation(), 2);
    publish_n(&broker, &topic, 40).await;

    let mut seen = HashSet::new();
    let (mut n1, mut n2) = (0, 0);
    while seen.len() < 40 {
        for (sub, n) in [(&mut c1, &mut n1), (&mut c2, &mut n2)] {
            let ds = poll(sub, 50).await;
            assert!(ds.windows(2).all(|w| w[0].offset < w[1].offset));
            for d in ds.iter() {
                assert!(seen.insert(d.offset), "offset {} delivered twice", d.offset);
            }
            *n += ds.len();
            sub.heartbeat().unwrap();
        }
        //acknowledge the contiguous prefix, freeing both windows
        let prefix = (0..40).take_while(|o| seen.contains(o)).count() as u64;
        if prefix > 0 {
            broker.commit(&topic, &group, prefix - 1).await.unwrap();
        }
    }
    assert!(n1 > 0 && n2 > 0, "work was not shared, {n1} / {n2}");
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn committed_offset_never_moves_back() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("mono");
    let group = GroupName::from("g");
    publish_n(&broker, &topic, 10).await;

    assert!(broker.commit(&topic, &group, 7).await.unwrap());
    assert!(!broker.commit(&topic, &group, 6).await.unwrap());
    assert_eq!(broker.committed(&topic, &group), Some(7));
    let err = broker.commit(&topic, &group, 10).await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidOffset { offset: 10, high_water_mark: 10 }));
    assert_eq!(err.kind(), embermq::ErrorKind::Caller);
    broker.shutdown().await.unwrap();

    let broker = open(dir.path());
    assert_eq!(broker.committed(&topic, &group), Some(7));
    broker.shutdown().await.unwrap();
}

struct Stalled;

#[async_trait]
impl Replicator for Stalled {
    async fn replicate(&self, _: &TopicName, _: Offset, _: Offset, _: usize) -> Result<()> {
        futures::future::pending::<()>().await;
        Ok(())
    }
}

#[tokio::test]
async fn full_buffer_times_out_with_backpressure() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(settings(dir.path(), |s| {
        s.flow.buffer_capacity = 8;
        s.replication.ack_timeout = Duration::from_secs(3600);
    }))
    .unwrap();
    *broker.context().extends.replicator_mut().await = Arc::new(Stalled);
    let topic = TopicName::from("slow");

    let stuck = {
        let broker = broker.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            let records = (0..8).map(|i| embermq::Record::new(None, Bytes::from(format!("{i}")))).collect();
            broker.publish_batch(&topic, records, AckLevel::Replicated, &Deadline::none()).await
        })
    };
    loop {
        let buffered = broker.topics().await.first().map(|t| t.buffered).unwrap_or_default();
        if buffered == 8 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let deadline = Deadline::after(Duration::from_millis(100));
    let res = broker.publish(&topic, None, Bytes::from("late"), AckLevel::None, &deadline).await;
    let err = res.unwrap_err();
    assert!(matches!(err, BrokerError::Backpressure(_)));
    assert!(err.is_transient());
    assert!(broker.topics().await[0].buffered <= 8);
    stuck.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resume_after_restart_without_redelivery() {
    let dir = tempfile::tempdir().unwrap();
    let topic = TopicName::from("T");
    let group = GroupName::from("G1");
    {
        let broker = open(dir.path());
        let records = (0..1000).map(|i| embermq::Record::new(None, Bytes::from(format!("{i}")))).collect::<Vec<_>>();
        for chunk in records.chunks(100) {
            broker.publish_batch(&topic, chunk.to_vec(), AckLevel::Local, &Deadline::none()).await.unwrap();
        }
        let mut sub = broker.subscribe(&topic, &group, "c1", &Deadline::none()).await.unwrap();
        let ds = drain(&mut sub, 1000).await;
        assert_eq!(offsets(&ds), (0..1000).collect::<Vec<_>>());
        sub.commit(999).await.unwrap();
        broker.shutdown().await.unwrap();
    }

    let broker = open(dir.path());
    let mut sub = broker.subscribe(&topic, &group, "c1", &Deadline::none()).await.unwrap();
    let ds = poll(&mut sub, 200).await;
    assert!(ds.is_empty(), "redelivered {:?}", offsets(&ds));

    let offset = broker.publish(&topic, None, Bytes::from("new"), AckLevel::Local, &Deadline::none()).await.unwrap();
    assert_eq!(offset, Some(1000));
    let ds = sub.fetch(100, &Deadline::after(Duration::from_secs(5))).await.unwrap();
    assert_eq!(offsets(&ds), vec![1000]);
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn fire_and_forget_publish() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("ff");
    for i in 0..50 {
        let res = broker.publish(&topic, None, Bytes::from(format!("{i}")), AckLevel::None, &Deadline::none()).await;
        assert_eq!(res.unwrap(), None);
    }
    let mut sub = broker.subscribe(&topic, &GroupName::from("g"), "", &Deadline::none()).await.unwrap();
    assert!(!sub.consumer_id().is_empty());
    assert_eq!(offsets(&drain(&mut sub, 50).await), (0..50).collect::<Vec<_>>());
    assert!(matches!(AckLevel::try_from(7), Err(BrokerError::InvalidAckLevel(7))));
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn subscription_stream_and_long_poll() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("stream");
    let sub = broker.subscribe(&topic, &GroupName::from("g"), "c", &Deadline::none()).await.unwrap();

    let producer = {
        let broker = broker.clone();
        let topic = topic.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            publish_n(&broker, &topic, 5).await;
        })
    };
    let got = sub.into_stream().take(5).map(|d| d.unwrap().offset).collect::<Vec<_>>().await;
    assert_eq!(got, (0..5).collect::<Vec<_>>());
    producer.await.unwrap();
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn leave_hands_work_to_the_rest_of_the_group() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("handover");
    let group = GroupName::from("g");
    publish_n(&broker, &topic, 10).await;

    let mut c1 = broker.subscribe(&topic, &group, "c1", &Deadline::none()).await.unwrap();
    let first = drain(&mut c1, 10).await;
    assert_eq!(first.len(), 10);
    let mut c2 = broker.subscribe(&topic, &group, "c2", &Deadline::none()).await.unwrap();
    c1.leave().unwrap();
    assert!(matches!(c1.fetch(1, &Deadline::none()).await, Err(BrokerError::UnknownConsumer(_))));

    let again = drain(&mut c2, 10).await;
    assert_eq!(offsets(&again), (0..10).collect::<Vec<_>>());
    assert!(again.iter().all(|d| d.attempt == 2));
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn cancelled_fetch_returns_promptly() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let mut sub = broker.subscribe(&TopicName::from("idle"), &GroupName::from("g"), "c", &Deadline::none()).await.unwrap();
    let token = tokio_util::sync::CancellationToken::new();
    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            token.cancel();
        })
    };
    let res = sub.fetch(10, &Deadline::none().with_cancel(token)).await;
    assert!(matches!(res, Err(BrokerError::Cancelled)));
    canceller.await.unwrap();

    let err = sub.fetch(10, &Deadline::after(Duration::from_millis(20))).await.unwrap_err();
    assert!(matches!(err, BrokerError::Timeout));
    assert!(err.is_transient());
    broker.shutdown().await.unwrap();
    assert!(matches!(sub.fetch(10, &Deadline::none()).await, Err(BrokerError::ShuttingDown)));
}

#[tokio::test]
async fn producer_timestamps_do_not_drive_rolling() {
    let dir = tempfile::tempdir().unwrap();
    let broker = open(dir.path());
    let topic = TopicName::from("stamped");
    for ts in [0, 1, -5, i64::MIN, i64::MAX] {
        let records = (0..3).map(|i| embermq::Record::new(None, Bytes::from(format!("{i}"))).with_timestamp(ts)).collect();
        broker.publish_batch(&topic, records, AckLevel::Local, &Deadline::none()).await.unwrap();
    }
    assert_eq!(broker.apply_retention().await.unwrap(), 0);
    let info = broker.topics().await.remove(0);
    assert_eq!(info.segments, 1);
    assert_eq!((info.log_start_offset, info.high_water_mark), (0, 15));

    let next = broker.publish(&topic, None, Bytes::from("now"), AckLevel::Local, &Deadline::none()).await.unwrap();
    assert_eq!(next, Some(15));
    let mut sub = broker.subscribe(&topic, &GroupName::from("g"), "c", &Deadline::none()).await.unwrap();
    let ds = drain(&mut sub, 16).await;
    assert_eq!(ds[9].timestamp, i64::MIN);
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn replicated_publish_needs_a_replicator() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(settings(dir.path(), |s| s.replication.replicas = 2)).unwrap();
    let topic = TopicName::from("replicated");
    let err = broker.publish(&topic, None, Bytes::from("x"), AckLevel::Replicated, &Deadline::none()).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");

    //local durability is unaffected
    let offset = broker.publish(&topic, None, Bytes::from("y"), AckLevel::Local, &Deadline::none()).await.unwrap();
    assert_eq!(offset, Some(1));
    broker.shutdown().await.unwrap();
}

#[tokio::test]
async fn fetch_below_log_start_can_fail() {
    let dir = tempfile::tempdir().unwrap();
    let broker = Broker::open(settings(dir.path(), |s| {
        s.consumer.out_of_range = embermq::conf::OutOfRange::Fail;
    }))
    .unwrap();
    let topic = TopicName::from("trimmed");
    let config = TopicConfig { segment_bytes: 64, index_interval_bytes: 16, retention_bytes: 1, ..TopicConfig::default() };
    broker.create_topic(&topic, config).await.unwrap();
    let mut sub = broker.subscribe(&topic, &GroupName::from("g"), "c", &Deadline::none()).await.unwrap();
    publish_n(&broker, &topic, 20).await;

    assert!(broker.apply_retention().await.unwrap() > 0);
    let start = broker.topics().await[0].log_start_offset;
    assert!(start > 0);
    let err = sub.fetch(10, &Deadline::after(Duration::from_secs(1))).await.unwrap_err();
    assert!(matches!(err, BrokerError::OffsetOutOfRange { offset: 0, .. }), "{err:?}");
    broker.shutdown().await.unwrap();
}
