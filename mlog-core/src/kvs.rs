//! The KCV store boundary — spec §1/§6: "out of scope... specified only by
//! the interface the core uses." `KvStore`/`TransactionProvider`/
//! `KvTransaction` are that interface; `MemoryKvStore` is the one reference
//! implementation the test suite and demo binary run against, the same role
//! the teacher's `MemoryStore` plays for `ProcessStore`.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::key::Entry;

/// A single-key mutation: additions (column, value) and column deletions.
#[derive(Clone, Debug, Default)]
pub struct RowMutation {
    pub key: Vec<u8>,
    pub additions: Vec<(Vec<u8>, Vec<u8>)>,
    pub deletions: Vec<Vec<u8>>,
}

/// A column-range read over a single row key, with inclusive-start,
/// exclusive-end semantics and an optional result limit.
#[derive(Clone, Debug)]
pub struct KeySliceQuery {
    pub key: Vec<u8>,
    pub column_start: Vec<u8>,
    pub column_end: Vec<u8>,
    pub limit: Option<usize>,
}

impl KeySliceQuery {
    pub fn new(key: Vec<u8>, column_start: Vec<u8>, column_end: Vec<u8>) -> Self {
        Self {
            key,
            column_start,
            column_end,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A transaction handle acquired from a [`TransactionProvider`]. Every
/// `KvStore` call the harness makes takes one of these; committing or
/// rolling it back ends its lifetime.
#[async_trait]
pub trait KvTransaction: Send {
    async fn commit(self: Box<Self>) -> anyhow::Result<()>;
    async fn rollback(self: Box<Self>) -> anyhow::Result<()>;
}

/// Supplies fresh transactions to the backend operation harness.
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    async fn begin(&self, key_consistent: bool) -> anyhow::Result<Box<dyn KvTransaction>>;
}

/// The generic Key-Column-Value store the log is built on.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<(Vec<u8>, Vec<u8>)>,
        deletions: Vec<Vec<u8>>,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()>;

    async fn mutate_many(
        &self,
        mutations: Vec<RowMutation>,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()>;

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<Vec<Entry>>;

    /// Whether this backend offers a genuine single-transaction multi-key
    /// mutation, or whether the send path should issue one `mutate` per key.
    fn supports_batch_mutation(&self) -> bool;

    fn name(&self) -> &str;

    async fn close(&self) -> anyhow::Result<()>;
}

/// A no-op transaction: `MemoryKvStore` applies each mutation atomically
/// under its own lock at call time, so it has no staged state to commit or
/// discard. This is a deliberate simplification appropriate to a reference
/// test backend — the KCV store's own transactional isolation is explicitly
/// out of scope for this spec (§1).
pub struct MemoryTx;

#[async_trait]
impl KvTransaction for MemoryTx {
    async fn commit(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// In-memory reference `KvStore`, backed by a `BTreeMap` keyed on
/// `(row key, column)` — `Vec<u8>` orders lexicographically, so range
/// slices fall out of `BTreeMap::range` for free.
pub struct MemoryKvStore {
    name: String,
    rows: RwLock<BTreeMap<(Vec<u8>, Vec<u8>), Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

#[async_trait]
impl TransactionProvider for MemoryKvStore {
    async fn begin(&self, _key_consistent: bool) -> anyhow::Result<Box<dyn KvTransaction>> {
        Ok(Box::new(MemoryTx))
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<(Vec<u8>, Vec<u8>)>,
        deletions: Vec<Vec<u8>>,
        _tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.write().await;
        for column in deletions {
            rows.remove(&(key.to_vec(), column));
        }
        for (column, value) in additions {
            rows.insert((key.to_vec(), column), value);
        }
        Ok(())
    }

    async fn mutate_many(
        &self,
        mutations: Vec<RowMutation>,
        _tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()> {
        let mut rows = self.rows.write().await;
        for mutation in mutations {
            for column in mutation.deletions {
                rows.remove(&(mutation.key.clone(), column));
            }
            for (column, value) in mutation.additions {
                rows.insert((mutation.key.clone(), column), value);
            }
        }
        Ok(())
    }

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        _tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<Vec<Entry>> {
        let rows = self.rows.read().await;
        let lower = (query.key.clone(), query.column_start.clone());
        let upper = (query.key.clone(), query.column_end.clone());
        let mut out: Vec<Entry> = rows
            .range(lower..upper)
            .map(|((_, column), value)| Entry {
                column: column.clone(),
                value: value.clone(),
            })
            .collect();
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn supports_batch_mutation(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn close(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// A `KvStore` wrapper that fails the first `n` calls to `get_slice`/
/// `mutate`/`mutate_many` (per instance) with a transient error, then
/// delegates. Used to exercise the backend-operation harness's retry path
/// without depending on a real flaky backend.
pub struct FlakyKvStore {
    inner: Arc<MemoryKvStore>,
    remaining_failures: std::sync::atomic::AtomicUsize,
}

impl FlakyKvStore {
    pub fn new(inner: Arc<MemoryKvStore>, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: std::sync::atomic::AtomicUsize::new(failures),
        }
    }

    fn maybe_fail(&self) -> anyhow::Result<()> {
        use std::sync::atomic::Ordering;
        let mut remaining = self.remaining_failures.load(Ordering::SeqCst);
        loop {
            if remaining == 0 {
                return Ok(());
            }
            match self.remaining_failures.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(anyhow::anyhow!("simulated transient storage failure")),
                Err(actual) => remaining = actual,
            }
        }
    }
}

#[async_trait]
impl TransactionProvider for FlakyKvStore {
    async fn begin(&self, key_consistent: bool) -> anyhow::Result<Box<dyn KvTransaction>> {
        self.inner.begin(key_consistent).await
    }
}

#[async_trait]
impl KvStore for FlakyKvStore {
    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<(Vec<u8>, Vec<u8>)>,
        deletions: Vec<Vec<u8>>,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()> {
        self.maybe_fail()?;
        self.inner.mutate(key, additions, deletions, tx).await
    }

    async fn mutate_many(
        &self,
        mutations: Vec<RowMutation>,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<()> {
        self.maybe_fail()?;
        self.inner.mutate_many(mutations, tx).await
    }

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        tx: &mut dyn KvTransaction,
    ) -> anyhow::Result<Vec<Entry>> {
        self.maybe_fail()?;
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
