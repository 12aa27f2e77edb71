//! End-to-end scenarios exercising the send and read paths together against
//! `MemoryKvStore`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mlog_core::{
    Clock, KeySliceQuery, KvStore, KvTransaction, Log, LogConfig, LogManager, MemoryKvStore,
    Message, MessageReader, ReadMarker, RowMutation, StaticLogManager, TransactionProvider,
};
use tokio::sync::watch;

/// A manually-advanced clock so tests control timeslice/lag-window math
/// without depending on wall-clock timing.
struct FakeClock(AtomicI64);

impl FakeClock {
    /// Starts well past the epoch so `timeslice()` math never goes negative.
    fn new() -> Arc<Self> {
        Arc::new(Self(AtomicI64::new(1_000 * mlog_core::key::TIMESLICE_INTERVAL)))
    }

    fn advance(&self, micros: i64) {
        self.0.fetch_add(micros, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now_micros(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Default, Clone)]
struct CollectingReader {
    name: &'static str,
    seen: Arc<Mutex<Vec<Message>>>,
}

impl CollectingReader {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn messages(&self) -> Vec<Message> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageReader for CollectingReader {
    async fn process(&self, message: &Message) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(message.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        self.name
    }
}

fn manager_with(
    store: Arc<MemoryKvStore>,
    partition_bit_width: u8,
    read_partition_ids: Vec<u32>,
) -> Arc<dyn LogManager> {
    Arc::new(StaticLogManager::new(
        "sender-1",
        partition_bit_width,
        0,
        read_partition_ids,
        store.clone(),
        store,
    ))
}

/// Wraps `MemoryKvStore` and blocks every `mutate`/`mutate_many` behind a
/// `watch` gate until the test releases it, so a flush can be held open long
/// enough to observe the send queue filling up (mirrors `FlakyKvStore`'s
/// role of giving a test deterministic control over backend behavior).
struct StallingKvStore {
    inner: MemoryKvStore,
    gate: watch::Receiver<bool>,
}

impl StallingKvStore {
    fn new(inner: MemoryKvStore, gate: watch::Receiver<bool>) -> Self {
        Self { inner, gate }
    }

    async fn wait_gate(&self) {
        let mut rx = self.gate.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

#[async_trait]
impl TransactionProvider for StallingKvStore {
    async fn begin(&self, key_consistent: bool) -> anyhow::Result<Box<dyn KvTransaction>> {
        self.inner.begin(key_consistent).await
    }
}

#[async_trait]
impl KvStore for StallingKvStore {
    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<(Vec<u8>, Vec<u8>)>,
        deletions: Vec<Vec<u8>>,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()> {
        self.wait_gate().await;
        self.inner.mutate(key, additions, deletions, tx).await
    }

    async fn mutate_many(
        &self,
        mutations: Vec<RowMutation>,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()> {
        self.wait_gate().await;
        self.inner.mutate_many(mutations, tx).await
    }

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<Vec<mlog_core::key::Entry>> {
        self.inner.get_slice(query, tx).await
    }

    fn supports_batch_mutation(&self) -> bool {
        self.inner.supports_batch_mutation()
    }

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.inner.close().await
    }
}

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn single_message_is_produced_and_consumed() {
    let store = Arc::new(MemoryKvStore::new("s1"));
    let manager = manager_with(store, 0, vec![0]);
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::ZERO, // below MIN_DELIVERY_DELAY: batching disabled
        read_interval: Duration::from_millis(20),
        read_lag_time: Duration::from_millis(0),
        ..LogConfig::default()
    };
    let log = Log::open("s1", manager, config, clock.clone()).await.unwrap();

    let reader = CollectingReader::new("r1");
    log.register_reader(Arc::new(reader.clone()), ReadMarker::anonymous(clock.now_micros()))
        .await
        .unwrap();

    let delivery = log.produce(b"hello".to_vec()).await.unwrap();
    delivery.await.unwrap();

    clock.advance(10_000_000);
    let delivered = wait_for(|| !reader.messages().is_empty(), Duration::from_secs(2)).await;
    assert!(delivered, "expected the message to be delivered to the reader");
    assert_eq!(reader.messages()[0].payload, b"hello");

    log.close().await.unwrap();
}

#[tokio::test]
async fn batching_coalesces_multiple_sends_into_one_flush() {
    let store = Arc::new(MemoryKvStore::new("s2"));
    let manager = manager_with(store, 0, vec![0]);
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::from_millis(100),
        send_batch_size: 50,
        read_interval: Duration::from_millis(20),
        read_lag_time: Duration::from_millis(0),
        ..LogConfig::default()
    };
    let log = Log::open("s2", manager, config, clock.clone()).await.unwrap();

    let reader = CollectingReader::new("r2");
    log.register_reader(Arc::new(reader.clone()), ReadMarker::anonymous(clock.now_micros()))
        .await
        .unwrap();

    let mut futures = Vec::new();
    for i in 0..10u32 {
        futures.push(log.produce(format!("msg-{i}").into_bytes()).await.unwrap());
    }
    for f in futures {
        f.await.unwrap();
    }

    clock.advance(10_000_000);
    let delivered = wait_for(|| reader.messages().len() == 10, Duration::from_secs(2)).await;
    assert!(delivered, "expected all 10 batched messages to be delivered");

    log.close().await.unwrap();
}

#[tokio::test]
async fn restart_resumes_the_send_side_sequence_counter() {
    let store = Arc::new(MemoryKvStore::new("s3"));
    let manager = manager_with(store.clone(), 0, vec![0]);
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::ZERO,
        ..LogConfig::default()
    };

    let log = Log::open("s3", manager.clone(), config.clone(), clock.clone())
        .await
        .unwrap();
    for i in 0..3u32 {
        log.produce(format!("first-run-{i}").into_bytes())
            .await
            .unwrap()
            .await
            .unwrap();
    }
    log.close().await.unwrap();

    let store_dyn: Arc<dyn mlog_core::KvStore> = store.clone();
    let persisted = mlog_core::settings::read_setting_or(
        &store_dyn,
        store.as_ref(),
        false,
        Duration::from_secs(1),
        &mlog_core::harness::RetryPolicy::default(),
        manager.sender_id(),
        &mlog_core::key::message_counter_column(),
        -1,
    )
    .await
    .unwrap();
    assert_eq!(persisted, 3, "sequence counter should persist across close");

    let log2 = Log::open("s3", manager, config, clock).await.unwrap();
    let delivery = log2.produce(b"second-run".to_vec()).await.unwrap();
    delivery.await.unwrap();
    log2.close().await.unwrap();
}

#[tokio::test]
async fn saturated_reads_drain_within_a_single_tick() {
    let store = Arc::new(MemoryKvStore::new("s4"));
    let manager = manager_with(store, 0, vec![0]);
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::ZERO,
        read_batch_size: 2, // force multiple saturated follow-up queries
        read_interval: Duration::from_millis(20),
        read_lag_time: Duration::from_millis(0),
        ..LogConfig::default()
    };
    let log = Log::open("s4", manager, config, clock.clone()).await.unwrap();

    let reader = CollectingReader::new("r4");
    log.register_reader(Arc::new(reader.clone()), ReadMarker::anonymous(clock.now_micros()))
        .await
        .unwrap();

    for i in 0..7u32 {
        log.produce(format!("burst-{i}").into_bytes())
            .await
            .unwrap()
            .await
            .unwrap();
    }

    clock.advance(10_000_000);
    let delivered = wait_for(|| reader.messages().len() == 7, Duration::from_secs(2)).await;
    assert!(
        delivered,
        "expected every message to drain despite a read_batch_size smaller than the burst"
    );

    log.close().await.unwrap();
}

#[tokio::test]
async fn reader_only_sees_messages_from_registered_partitions() {
    let store = Arc::new(MemoryKvStore::new("s5"));
    // 2-bit partition width: partitions 0..4. Only partition 0 is read.
    let manager = manager_with(store, 2, vec![0]);
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::ZERO,
        read_interval: Duration::from_millis(20),
        read_lag_time: Duration::from_millis(0),
        ..LogConfig::default()
    };
    let log = Log::open("s5", manager, config, clock.clone()).await.unwrap();

    let reader = CollectingReader::new("r5");
    log.register_reader(Arc::new(reader.clone()), ReadMarker::anonymous(clock.now_micros()))
        .await
        .unwrap();

    log.produce_on_partition(b"in-partition".to_vec(), 0)
        .await
        .unwrap()
        .await
        .unwrap();
    log.produce_on_partition(b"other-partition".to_vec(), 1)
        .await
        .unwrap()
        .await
        .unwrap();

    clock.advance(10_000_000);
    wait_for(|| !reader.messages().is_empty(), Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let payloads: Vec<Vec<u8>> = reader.messages().into_iter().map(|m| m.payload).collect();
    assert!(payloads.contains(&b"in-partition".to_vec()));
    assert!(!payloads.contains(&b"other-partition".to_vec()));

    log.close().await.unwrap();
}

#[tokio::test]
async fn routing_key_derives_partition_from_its_top_bits() {
    // partitionBitWidth = 4: routingKey = [0xA0, ...] routes to partition
    // 0xA (= 0xA0 >> 4 of the top 4 bits).
    let store = Arc::new(MemoryKvStore::new("s6"));
    let manager = manager_with(store, 4, vec![0xA]);
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::ZERO,
        read_interval: Duration::from_millis(20),
        read_lag_time: Duration::from_millis(0),
        ..LogConfig::default()
    };
    let log = Log::open("s6", manager, config, clock.clone()).await.unwrap();

    let reader = CollectingReader::new("r6");
    log.register_reader(Arc::new(reader.clone()), ReadMarker::anonymous(clock.now_micros()))
        .await
        .unwrap();

    log.produce_with_routing_key(b"routed".to_vec(), &[0xA0, 0x00, 0x00, 0x00])
        .await
        .unwrap()
        .await
        .unwrap();

    clock.advance(10_000_000);
    let delivered = wait_for(|| !reader.messages().is_empty(), Duration::from_secs(2)).await;
    assert!(delivered, "expected the routed message to reach the reader on partition 0xA");
    assert_eq!(reader.messages()[0].payload, b"routed");

    log.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_queue_blocks_the_producer_once_full() {
    let (gate_tx, gate_rx) = watch::channel(false);
    let store = Arc::new(StallingKvStore::new(MemoryKvStore::new("s7"), gate_rx));
    let manager: Arc<dyn LogManager> = Arc::new(StaticLogManager::new(
        "sender-1",
        0,
        0,
        vec![0],
        store.clone(),
        store,
    ));
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::from_secs(5),
        send_batch_size: 1, // queue capacity = 1 * BATCH_SIZE_MULTIPLIER = 10
        ..LogConfig::default()
    };
    let log = Log::open("s7", manager, config, clock).await.unwrap();

    // The first produce is pulled off the queue by the batcher immediately
    // and stalls mid-flush on the gate; the next 10 fit in the now-freed
    // queue capacity without blocking.
    let mut deliveries = Vec::new();
    for i in 0..11u32 {
        deliveries.push(log.produce(format!("msg-{i}").into_bytes()).await.unwrap());
    }

    let log_for_blocked = Arc::clone(&log);
    let blocked = tokio::spawn(async move {
        log_for_blocked
            .produce(b"the-11th-slot-is-full".to_vec())
            .await
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        !blocked.is_finished(),
        "producing past queue capacity should block while the only flush in flight is stalled"
    );

    gate_tx.send(true).unwrap();

    let delivery = blocked.await.unwrap().unwrap();
    delivery.await.unwrap();
    for d in deliveries {
        d.await.unwrap();
    }

    log.close().await.unwrap();
}

#[tokio::test]
async fn reader_resumes_from_persisted_cursor_after_restart() {
    let store = Arc::new(MemoryKvStore::new("s8"));
    let manager = manager_with(store, 0, vec![0]);
    let clock = FakeClock::new();
    let config = LogConfig {
        send_delay: Duration::ZERO,
        read_interval: Duration::from_millis(20),
        read_lag_time: Duration::from_millis(0),
        ..LogConfig::default()
    };

    let log = Log::open("s8", manager.clone(), config.clone(), clock.clone())
        .await
        .unwrap();
    let reader = CollectingReader::new("r8a");
    log.register_reader(
        Arc::new(reader.clone()),
        ReadMarker::named("s8-reader", clock.now_micros()),
    )
    .await
    .unwrap();

    for i in 0..3u32 {
        log.produce(format!("old-{i}").into_bytes())
            .await
            .unwrap()
            .await
            .unwrap();
    }
    clock.advance(10_000_000);
    let delivered = wait_for(|| reader.messages().len() == 3, Duration::from_secs(2)).await;
    assert!(delivered, "expected the first run's 3 messages to be delivered");

    log.close().await.unwrap();

    // Reopen with the same manager and the same named marker, but a fresh
    // reader instance: the persisted cursor, not the marker's default start
    // time, must gate what this reader sees.
    let log2 = Log::open("s8", manager, config, clock.clone()).await.unwrap();
    let reader2 = CollectingReader::new("r8b");
    log2.register_reader(
        Arc::new(reader2.clone()),
        ReadMarker::named("s8-reader", clock.now_micros()),
    )
    .await
    .unwrap();

    log2.produce(b"new-message".to_vec())
        .await
        .unwrap()
        .await
        .unwrap();
    clock.advance(10_000_000);
    let delivered2 = wait_for(|| !reader2.messages().is_empty(), Duration::from_secs(2)).await;
    assert!(delivered2, "expected the new message to be delivered to the fresh reader");

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        reader2.messages().len(),
        1,
        "reader should resume from the persisted cursor and see only the new message"
    );
    assert_eq!(reader2.messages()[0].payload, b"new-message");

    log2.close().await.unwrap();
}
