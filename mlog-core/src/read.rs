//! Read path — spec §4.E: pollers, cursor persistence, and a fixed
//! dispatch pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::config::ReadMarker;
use crate::error::Result;
use crate::key::{self, DecodedMessage};
use crate::kvs::KeySliceQuery;
use crate::log::Log;
use crate::message::Message;

/// A registered consumer of decoded messages (spec §4.E "readers").
#[async_trait]
pub trait MessageReader: Send + Sync {
    async fn process(&self, message: &Message) -> anyhow::Result<()>;
    fn name(&self) -> &str;
}

/// One puller's mutable poll state: which partition/bucket it owns, its
/// cursor identifier (if the marker is named), and the next micros to read
/// from.
struct PullerState {
    partition_id: u32,
    bucket_id: u32,
    cursor_identifier: Option<String>,
    next_start_micros: i64,
}

impl Log {
    /// Registers a reader and, on first registration, stands up the fixed
    /// puller pool across every `(readPartitionId, bucket)` pair (spec
    /// §4.E). Later registrations join the already-running pool.
    pub async fn register_reader(
        &self,
        reader: Arc<dyn MessageReader>,
        marker: ReadMarker,
    ) -> Result<()> {
        self.check_open()?;
        self.readers.write().await.push(reader);
        self.ensure_reader_pool(marker).await
    }

    /// Convenience for registering several readers under the same marker.
    pub async fn register_readers(
        &self,
        readers: Vec<Arc<dyn MessageReader>>,
        marker: ReadMarker,
    ) -> Result<()> {
        self.check_open()?;
        self.readers.write().await.extend(readers);
        self.ensure_reader_pool(marker).await
    }

    pub async fn unregister_reader(&self, name: &str) {
        self.readers.write().await.retain(|r| r.name() != name);
    }

    async fn ensure_reader_pool(&self, marker: ReadMarker) -> Result<()> {
        let mut guard = self.reader_pool.lock().await;
        if guard.is_some() {
            return Ok(());
        }
        let pool = ReaderPool::start(self, marker).await?;
        *guard = Some(pool);
        Ok(())
    }
}

/// The running set of puller tasks plus the dispatch semaphore they share
/// (spec §4.E "a fixed pool of puller threads dispatch to a bounded worker
/// pool"; here, one tokio task per puller and a `Semaphore` standing in for
/// the bounded dispatch pool — permits are acquired before `process` runs
/// and a full pool simply makes the next acquire wait, the async analogue
/// of "rejected tasks run inline").
pub(crate) struct ReaderPool {
    handles: Vec<JoinHandle<()>>,
    states: Vec<Arc<Mutex<PullerState>>>,
    stop: Arc<AtomicBool>,
}

impl ReaderPool {
    async fn start(log: &Log, marker: ReadMarker) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let dispatch = Arc::new(Semaphore::new(log.config.read_threads.max(1)));
        let mut handles = Vec::new();
        let mut states = Vec::new();

        for &partition_id in log.manager.read_partition_ids() {
            for bucket_id in 0..log.config.num_buckets {
                // One row per reader identifier; `marker_column` alone
                // differentiates the (partition, bucket) columns within it.
                let cursor_identifier = marker.identifier.clone();

                let start_micros = if let Some(identifier) = &cursor_identifier {
                    let column = key::marker_column(partition_id, bucket_id);
                    crate::settings::read_setting_or(
                        &log.manager.store(),
                        log.manager.transactions().as_ref(),
                        log.config.key_consistent,
                        log.config.max_read_time,
                        &log.retry,
                        identifier,
                        &column,
                        marker.start_time_micros,
                    )
                    .await?
                } else {
                    marker.start_time_micros
                };

                let state = Arc::new(Mutex::new(PullerState {
                    partition_id,
                    bucket_id,
                    cursor_identifier,
                    next_start_micros: start_micros,
                }));
                states.push(state.clone());

                let log = log
                    .self_weak
                    .upgrade()
                    .expect("log outlives its own reader pool");
                let stop = stop.clone();
                let dispatch = dispatch.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(crate::config::INITIAL_READER_DELAY).await;
                    loop {
                        if stop.load(Ordering::Acquire) {
                            break;
                        }
                        let mut guard = state.lock().await;
                        if let Err(e) = poll_once(&log, &mut guard, &dispatch).await {
                            tracing::warn!(
                                partition = guard.partition_id,
                                bucket = guard.bucket_id,
                                error = %e,
                                "puller tick failed"
                            );
                        }
                        drop(guard);
                        tokio::time::sleep(log.config.read_interval).await;
                    }
                });
                handles.push(handle);
            }
        }

        Ok(Self { handles, states, stop })
    }

    /// Stops every puller (1s drain, then force-cancel) and persists each
    /// one's final cursor, so a puller force-aborted mid-tick doesn't lose
    /// that tick's cursor advance — the per-tick write inside `poll_once` is
    /// only incidental, this is the dedicated close-time write.
    pub(crate) async fn shutdown(self, log: &Log) -> Result<()> {
        self.stop.store(true, Ordering::Release);
        let mut remaining = self.handles;
        let deadline =
            tokio::time::sleep(crate::config::READER_POOL_SHUTDOWN_WAIT);
        tokio::pin!(deadline);
        let all = futures_join_all(&mut remaining);
        tokio::select! {
            _ = all => {}
            _ = &mut deadline => {
                for handle in &remaining {
                    handle.abort();
                }
            }
        }

        for state in &self.states {
            let guard = state.lock().await;
            if let Err(e) = persist_cursor(log, &guard).await {
                tracing::warn!(
                    partition = guard.partition_id,
                    bucket = guard.bucket_id,
                    error = %e,
                    "failed to persist cursor during shutdown"
                );
            }
        }
        Ok(())
    }
}

/// Awaits every handle in `handles`, tolerating panics (a puller panicking
/// must not prevent the others from being awaited during shutdown).
async fn futures_join_all(handles: &mut [JoinHandle<()>]) {
    for handle in handles.iter_mut() {
        let _ = handle.await;
    }
}

/// One poll tick for a single `(partition, bucket)` puller (spec §4.E steps
/// 1-7): compute the read window bounded to the cursor's own timeslice row,
/// pull up to `read_batch_size` entries, dispatch each to every registered
/// reader, and — if the slice came back saturated — issue one follow-up
/// unbounded query starting just past the last entry read, so a burst within
/// one tick isn't held back a whole `read_interval`. A cursor that starts far
/// behind live only advances to the end of its own timeslice per tick; it
/// naturally steps forward one timeslice per scheduled tick rather than
/// catching up within a single call (a stale cursor against a real clock can
/// be many years behind — looping across timeslices in one call would block
/// the puller task for as long as catch-up takes).
async fn poll_once(
    log: &Log,
    state: &mut PullerState,
    dispatch: &Arc<Semaphore>,
) -> anyhow::Result<()> {
    let live_bound = log.clock.now_micros()
        - log.config.read_lag_time.as_micros() as i64
        - log.config.send_delay.as_micros() as i64;
    if state.next_start_micros >= live_bound {
        return Ok(());
    }

    let timeslice = key::timeslice(state.next_start_micros)?;
    let timeslice_end = (timeslice as i64 + 1) * key::TIMESLICE_INTERVAL;
    let max_time = live_bound.min(timeslice_end);

    let row_key = key::log_key(
        state.partition_id,
        state.bucket_id,
        log.config.num_buckets,
        timeslice,
        log.manager.partition_bit_width(),
    )?;

    let store = log.manager.store();
    let transactions = log.manager.transactions();

    let query = KeySliceQuery::new(
        row_key.to_vec(),
        key::timestamp_bound(state.next_start_micros),
        key::timestamp_bound(max_time),
    )
    .with_limit(log.config.read_batch_size);
    let entries = run_slice_query(log, &store, transactions.as_ref(), query).await?;

    let saturated = entries.len() == log.config.read_batch_size;
    let mut last_timestamp = None;
    for entry in &entries {
        let decoded: DecodedMessage = key::decode_message(entry)?;
        dispatch_to_readers(log, &decoded, dispatch).await;
        last_timestamp = Some(decoded.timestamp_micros);
    }

    if saturated {
        // More entries may share the last returned column or follow it
        // within this same window; one unbounded follow-up query (capped
        // only by what's actually in the row) drains them within this tick.
        let last_entry = entries.last().expect("saturated implies non-empty");
        let follow_start = key::successor(&last_entry.column);
        let follow_end = key::timestamp_bound(last_timestamp.unwrap() + 2);
        let follow_query = KeySliceQuery::new(row_key.to_vec(), follow_start, follow_end);
        let follow_entries = run_slice_query(log, &store, transactions.as_ref(), follow_query).await?;
        for entry in &follow_entries {
            let decoded: DecodedMessage = key::decode_message(entry)?;
            dispatch_to_readers(log, &decoded, dispatch).await;
            last_timestamp = Some(decoded.timestamp_micros);
        }
        state.next_start_micros = last_timestamp.unwrap() + 2;
    } else {
        state.next_start_micros = max_time;
    }

    persist_cursor(log, state).await
}

async fn run_slice_query(
    log: &Log,
    store: &Arc<dyn crate::kvs::KvStore>,
    transactions: &dyn crate::kvs::TransactionProvider,
    query: KeySliceQuery,
) -> anyhow::Result<Vec<crate::key::Entry>> {
    let store = store.clone();
    crate::harness::execute(
        transactions,
        log.config.key_consistent,
        log.config.max_read_time,
        &log.retry,
        move |tx| {
            let store = store.clone();
            let query = query.clone();
            Box::pin(async move { store.get_slice(&query, tx).await })
        },
    )
    .await
    .map_err(anyhow::Error::from)
}

async fn dispatch_to_readers(log: &Log, decoded: &DecodedMessage, dispatch: &Arc<Semaphore>) {
    let message = Message {
        payload: decoded.payload.clone(),
        timestamp_micros: decoded.timestamp_micros,
        sender_id: decoded.sender_id.clone(),
    };
    let readers = log.readers.read().await.clone();
    let (tx, mut rx) = mpsc::channel::<()>(readers.len().max(1));
    for reader in readers {
        let permit = dispatch
            .clone()
            .acquire_owned()
            .await
            .expect("dispatch semaphore never closes");
        let message = message.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = reader.process(&message).await {
                tracing::warn!(reader = reader.name(), error = %e, "reader failed");
            }
            let _ = tx.send(()).await;
        });
    }
    drop(tx);
    while rx.recv().await.is_some() {}
}

async fn persist_cursor(log: &Log, state: &PullerState) -> Result<()> {
    let Some(identifier) = &state.cursor_identifier else {
        return Ok(());
    };
    let column = key::marker_column(state.partition_id, state.bucket_id);
    crate::settings::write_setting(
        &log.manager.store(),
        log.manager.transactions().as_ref(),
        log.config.key_consistent,
        log.config.max_read_time,
        &log.retry,
        identifier,
        &column,
        state.next_start_micros,
    )
    .await
}
