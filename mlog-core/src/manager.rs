//! The log manager — spec §1/§6: "owns serializer, sender identity,
//! partition bit-width, set of read-partition ids, default partition, open-
//! log registry." Out of scope as a concrete system; here as the trait the
//! core consumes, plus `StaticLogManager`, a fixed-config reference
//! implementation for tests and the demo binary.

use std::sync::Arc;

use crate::kvs::{KvStore, TransactionProvider};

/// Capabilities a `Log` needs from its owning manager.
pub trait LogManager: Send + Sync {
    fn sender_id(&self) -> &str;
    fn partition_bit_width(&self) -> u8;
    fn default_partition_id(&self) -> u32;
    fn read_partition_ids(&self) -> &[u32];
    fn store(&self) -> Arc<dyn KvStore>;
    fn transactions(&self) -> Arc<dyn TransactionProvider>;

    /// Notification hook invoked once a log has fully closed.
    fn closed_log(&self, name: &str);
}

/// A manager with a fixed configuration, backed by one shared `KvStore`/
/// `TransactionProvider`. Sufficient for a single open log; a manager that
/// actually tracks an open-log registry is outside the core's concern (spec
/// §1: "the log manager... is an external collaborator").
pub struct StaticLogManager {
    sender_id: String,
    partition_bit_width: u8,
    default_partition_id: u32,
    read_partition_ids: Vec<u32>,
    store: Arc<dyn KvStore>,
    transactions: Arc<dyn TransactionProvider>,
}

impl StaticLogManager {
    pub fn new(
        sender_id: impl Into<String>,
        partition_bit_width: u8,
        default_partition_id: u32,
        read_partition_ids: Vec<u32>,
        store: Arc<dyn KvStore>,
        transactions: Arc<dyn TransactionProvider>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            partition_bit_width,
            default_partition_id,
            read_partition_ids,
            store,
            transactions,
        }
    }
}

impl LogManager for StaticLogManager {
    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn partition_bit_width(&self) -> u8 {
        self.partition_bit_width
    }

    fn default_partition_id(&self) -> u32 {
        self.default_partition_id
    }

    fn read_partition_ids(&self) -> &[u32] {
        &self.read_partition_ids
    }

    fn store(&self) -> Arc<dyn KvStore> {
        self.store.clone()
    }

    fn transactions(&self) -> Arc<dyn TransactionProvider> {
        self.transactions.clone()
    }

    fn closed_log(&self, name: &str) {
        tracing::info!(log = name, "manager notified of log close");
    }
}
