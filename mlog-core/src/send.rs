//! Send path — spec §4.D: bounded queue, batcher task, flush, delivery
//! futures.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::error::{LogError, Result};
use crate::key::{self, Entry};
use crate::kvs::RowMutation;
use crate::log::Log;
use crate::message::{delivery_pair, DeliveryFuture, DeliverySender};

/// A produced message queued for the batcher: its row key, its encoded
/// entry, and the sender half of its delivery future (GLOSSARY: Envelope).
pub(crate) struct Envelope {
    pub row_key: Vec<u8>,
    pub entry: Entry,
    pub sender: DeliverySender,
    pub queued_at: Instant,
}

impl Log {
    /// Produces a message on the manager's default partition.
    pub async fn produce(&self, payload: Vec<u8>) -> Result<DeliveryFuture> {
        let partition_id = self.manager.default_partition_id();
        self.produce_on_partition(payload, partition_id).await
    }

    /// Produces a message, deriving its partition from the first up-to-4
    /// bytes of `routing_key`, right-shifted by `32 - partitionBitWidth`
    /// (spec §4.D).
    pub async fn produce_with_routing_key(
        &self,
        payload: Vec<u8>,
        routing_key: &[u8],
    ) -> Result<DeliveryFuture> {
        let width = self.manager.partition_bit_width();
        let take = routing_key.len().min(4);
        let mut bytes = [0u8; 4];
        bytes[..take].copy_from_slice(&routing_key[..take]);
        let raw = u32::from_be_bytes(bytes);
        let partition_id = if width == 0 { 0 } else { raw >> (32 - width as u32) };
        self.produce_on_partition(payload, partition_id).await
    }

    /// Produces a message on an explicit partition id (spec §4.D steps 1-6).
    pub async fn produce_on_partition(
        &self,
        payload: Vec<u8>,
        partition_id: u32,
    ) -> Result<DeliveryFuture> {
        self.check_open()?;
        if payload.is_empty() {
            return Err(LogError::InvalidArgument("payload must not be empty".into()));
        }
        self.validate_partition(partition_id)?;

        let timestamp_micros = self.clock.now_micros();
        let bucket_id = self.next_bucket.fetch_add(1, Ordering::Relaxed) % self.config.num_buckets;
        let timeslice = key::timeslice(timestamp_micros)?;
        let row_key = key::log_key(
            partition_id,
            bucket_id,
            self.config.num_buckets,
            timeslice,
            self.manager.partition_bit_width(),
        )?;
        let sequence_number = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let entry = key::encode_message(
            timestamp_micros,
            self.manager.sender_id(),
            sequence_number,
            &payload,
        );

        let (sender, future) = delivery_pair();
        let envelope = Envelope {
            row_key: row_key.to_vec(),
            entry,
            sender,
            queued_at: Instant::now(),
        };

        match &self.queue_tx {
            None => {
                // Batching disabled: flush synchronously before returning.
                self.flush(vec![envelope]).await;
            }
            Some(queue_tx) => {
                // Backpressure point: a full queue blocks the caller. The
                // sender is cleared by `close()`, so a lock-then-clone keeps
                // the await off the mutex (it's dropped by the time we'd
                // block on `send`).
                let tx = queue_tx.lock().await.clone();
                match tx {
                    Some(tx) if tx.send(envelope).await.is_ok() => {}
                    _ => return Err(LogError::Interrupted),
                }
            }
        }

        Ok(future)
    }

    fn validate_partition(&self, partition_id: u32) -> Result<()> {
        let width = self.manager.partition_bit_width();
        if width >= 32 {
            return Ok(());
        }
        let limit = 1u32 << width;
        if partition_id >= limit {
            return Err(LogError::InvalidArgument(format!(
                "partition {partition_id} out of range for bit width {width}"
            )));
        }
        Ok(())
    }

    /// Groups `envelopes` by row key (stable insertion order within a key)
    /// and flushes them in a single transaction, via one multi-key mutation
    /// if the store supports it, else one mutation per key. Completes every
    /// envelope's delivery future with the outcome.
    pub(crate) async fn flush(&self, envelopes: Vec<Envelope>) {
        let mut order: Vec<Vec<u8>> = Vec::new();
        let mut groups: HashMap<Vec<u8>, Vec<(Entry, DeliverySender)>> = HashMap::new();
        for envelope in envelopes {
            let group = groups.entry(envelope.row_key.clone()).or_insert_with(|| {
                order.push(envelope.row_key.clone());
                Vec::new()
            });
            group.push((envelope.entry, envelope.sender));
        }

        let store = self.manager.store();
        let transactions = self.manager.transactions();
        let supports_batch = store.supports_batch_mutation();

        let mutations: Vec<RowMutation> = order
            .iter()
            .map(|key| {
                let additions = groups[key]
                    .iter()
                    .map(|(entry, _)| (entry.column.clone(), entry.value.clone()))
                    .collect();
                RowMutation {
                    key: key.clone(),
                    additions,
                    deletions: vec![],
                }
            })
            .collect();

        let result = crate::harness::execute(
            transactions.as_ref(),
            self.config.key_consistent,
            self.config.max_write_time,
            &self.retry,
            move |tx| {
                let store = store.clone();
                let mutations = mutations.clone();
                let supports_batch = supports_batch;
                Box::pin(async move {
                    if supports_batch {
                        store.mutate_many(mutations, tx).await
                    } else {
                        for mutation in mutations {
                            store
                                .mutate(&mutation.key, mutation.additions, mutation.deletions, tx)
                                .await?;
                        }
                        Ok(())
                    }
                })
            },
        )
        .await;

        match result {
            Ok(()) => {
                for key in &order {
                    for (_, sender) in groups.remove(key).unwrap() {
                        sender.delivered();
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "flush failed, envelopes considered lost");
                let err = Arc::new(err);
                for key in &order {
                    for (_, sender) in groups.remove(key).unwrap() {
                        sender.failed(err.clone());
                    }
                }
            }
        }
    }
}

/// The batcher task's main loop (spec §4.D). Runs on a single dedicated
/// worker for the lifetime of the log; exits once the queue is closed
/// (i.e. the log has started closing), after draining everything left.
pub(crate) async fn batcher_loop(log: Arc<Log>, mut queue_rx: mpsc::Receiver<Envelope>) {
    let mut batch: Vec<Envelope> = Vec::new();

    loop {
        if batch.is_empty() {
            match queue_rx.recv().await {
                Some(envelope) => batch.push(envelope),
                None => break,
            }
        } else {
            let oldest_age = batch[0].queued_at.elapsed();
            let wait = log.config.send_delay.saturating_sub(oldest_age);
            match tokio::time::timeout(wait, queue_rx.recv()).await {
                Ok(Some(envelope)) => batch.push(envelope),
                Ok(None) => break,
                Err(_elapsed) => {}
            }
        }

        while batch.len() < log.config.send_batch_size {
            match queue_rx.try_recv() {
                Ok(envelope) => batch.push(envelope),
                Err(_) => break,
            }
        }

        if !batch.is_empty() {
            let oldest_age = batch[0].queued_at.elapsed();
            if oldest_age >= log.config.send_delay || batch.len() >= log.config.send_batch_size {
                let ready = std::mem::take(&mut batch);
                log.flush(ready).await;
            }
        }
    }

    // Cleanup: drain whatever is left in the queue plus the pending batch,
    // flushing in send_batch_size-sized chunks.
    queue_rx.close();
    while let Ok(envelope) = queue_rx.try_recv() {
        batch.push(envelope);
    }
    let chunk_size = log.config.send_batch_size.max(1);
    while !batch.is_empty() {
        let rest = batch.split_off(chunk_size.min(batch.len()));
        log.flush(batch).await;
        batch = rest;
    }
}
