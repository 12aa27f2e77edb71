//! Log lifecycle — spec §4.F.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::clock::Clock;
use crate::config::LogConfig;
use crate::error::{LogError, Result};
use crate::harness::RetryPolicy;
use crate::key;
use crate::manager::LogManager;
use crate::read::{MessageReader, ReaderPool};
use crate::send::Envelope;
use crate::settings;

/// A durable, partitioned, append-only message log (spec §1).
pub struct Log {
    pub(crate) name: String,
    pub(crate) manager: Arc<dyn LogManager>,
    pub(crate) config: LogConfig,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) retry: RetryPolicy,

    pub(crate) is_open: Arc<AtomicBool>,
    pub(crate) next_bucket: AtomicU32,
    pub(crate) next_sequence: AtomicI64,

    /// `None` when batching is disabled. Wrapped so `close()` can drop the
    /// sender through `&self`, which closes the channel and lets the batcher
    /// exit its `recv()` loop naturally — no lost-wakeup race with a
    /// `Notify`, whose `notify_waiters()` only reaches tasks already waiting.
    pub(crate) queue_tx: Option<Mutex<Option<mpsc::Sender<Envelope>>>>,
    pub(crate) batcher_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,

    pub(crate) readers: Arc<RwLock<Vec<Arc<dyn MessageReader>>>>,
    pub(crate) reader_pool: Mutex<Option<ReaderPool>>,

    /// Lets the reader pool hand its puller tasks an owned `Arc<Log>`
    /// without the caller threading one through every registration call.
    pub(crate) self_weak: Weak<Log>,
}

impl Log {
    /// Opens a log: seeds the send-side sequence counter from persisted
    /// state and starts the batcher iff batching is enabled (spec §4.F).
    /// Pullers are not created until the first reader registration.
    pub async fn open(
        name: impl Into<String>,
        manager: Arc<dyn LogManager>,
        config: LogConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Log>> {
        let name = name.into();
        let retry = RetryPolicy::default();
        let store = manager.store();
        let transactions = manager.transactions();

        let next_sequence = settings::read_setting_or(
            &store,
            transactions.as_ref(),
            config.key_consistent,
            config.max_write_time,
            &retry,
            manager.sender_id(),
            &key::message_counter_column(),
            0,
        )
        .await?;

        let batching_enabled = config.send_delay >= crate::config::MIN_DELIVERY_DELAY;
        let (queue_tx, queue_rx) = if batching_enabled {
            let (tx, rx) = mpsc::channel(config.send_batch_size * crate::config::BATCH_SIZE_MULTIPLIER);
            (Some(Mutex::new(Some(tx))), Some(rx))
        } else {
            (None, None)
        };

        let log = Arc::new_cyclic(|self_weak| Log {
            name,
            manager,
            config,
            clock,
            retry,
            is_open: Arc::new(AtomicBool::new(true)),
            next_bucket: AtomicU32::new(0),
            next_sequence: AtomicI64::new(next_sequence),
            queue_tx,
            batcher_handle: Mutex::new(None),
            readers: Arc::new(RwLock::new(Vec::new())),
            reader_pool: Mutex::new(None),
            self_weak: self_weak.clone(),
        });

        if let Some(queue_rx) = queue_rx {
            let log_for_batcher = Arc::clone(&log);
            let handle = tokio::spawn(async move {
                crate::send::batcher_loop(log_for_batcher, queue_rx).await;
            });
            *log.batcher_handle.lock().await = Some(handle);
        }

        Ok(log)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LogError::ClosedLog)
        }
    }

    /// Closes the log: stops the reader pool (1s drain, then force-cancel),
    /// stops the batcher (10s drain), persists every puller's cursor and the
    /// send-side sequence counter, closes the store, and notifies the
    /// manager. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if !self.is_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(pool) = self.reader_pool.lock().await.take() {
            pool.shutdown(self).await?;
        }

        if let Some(queue_tx) = &self.queue_tx {
            queue_tx.lock().await.take();
        }
        if let Some(handle) = self.batcher_handle.lock().await.take() {
            match tokio::time::timeout(crate::config::CLOSE_DOWN_WAIT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "batcher task panicked during shutdown"),
                Err(_) => tracing::warn!("batcher did not drain within CLOSE_DOWN_WAIT"),
            }
        }

        settings::write_setting(
            &self.manager.store(),
            self.manager.transactions().as_ref(),
            self.config.key_consistent,
            self.config.max_write_time,
            &self.retry,
            self.manager.sender_id(),
            &key::message_counter_column(),
            self.next_sequence.load(Ordering::SeqCst),
        )
        .await?;

        self.manager.store().close().await.map_err(|source| {
            LogError::BackendUnavailable {
                elapsed_micros: 0,
                source,
            }
        })?;

        self.manager.closed_log(&self.name);
        Ok(())
    }
}
