//! Setting store — spec §4.C. Reads/writes 8-byte counters in the reserved
//! system partition: the send-side message counter and per-reader cursors.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{LogError, Result};
use crate::harness::{self, RetryPolicy};
use crate::key;
use crate::kvs::{KeySliceQuery, KvStore, TransactionProvider};

/// Reads an 8-byte big-endian counter at `(settingKey(identifier), column)`,
/// returning `default` if absent.
pub async fn read_setting(
    store: &Arc<dyn KvStore>,
    provider: &dyn TransactionProvider,
    key_consistent: bool,
    deadline: Duration,
    retry: &RetryPolicy,
    identifier: &str,
    column: &[u8],
) -> Result<Option<i64>> {
    let row_key = key::setting_key(identifier);
    let column = column.to_vec();
    let store = store.clone();
    let query = KeySliceQuery::new(
        row_key.clone(),
        column.clone(),
        key::successor(&column),
    );
    let entries = harness::execute(provider, key_consistent, deadline, retry, move |tx| {
        let store = store.clone();
        let query = query.clone();
        Box::pin(async move { store.get_slice(&query, tx).await })
    })
    .await?;

    match entries.into_iter().find(|e| e.column == column) {
        None => Ok(None),
        Some(entry) => {
            let bytes: [u8; 8] = entry.value.as_slice().try_into().map_err(|_| {
                LogError::InvalidArgument(format!(
                    "setting {identifier} has value of length {} (expected 8)",
                    entry.value.len()
                ))
            })?;
            Ok(Some(i64::from_be_bytes(bytes)))
        }
    }
}

/// Convenience wrapper returning `default` when the setting is absent.
pub async fn read_setting_or(
    store: &Arc<dyn KvStore>,
    provider: &dyn TransactionProvider,
    key_consistent: bool,
    deadline: Duration,
    retry: &RetryPolicy,
    identifier: &str,
    column: &[u8],
    default: i64,
) -> Result<i64> {
    Ok(
        read_setting(store, provider, key_consistent, deadline, retry, identifier, column)
            .await?
            .unwrap_or(default),
    )
}

/// Upserts an 8-byte big-endian counter at `(settingKey(identifier), column)`.
pub async fn write_setting(
    store: &Arc<dyn KvStore>,
    provider: &dyn TransactionProvider,
    key_consistent: bool,
    deadline: Duration,
    retry: &RetryPolicy,
    identifier: &str,
    column: &[u8],
    value: i64,
) -> Result<()> {
    let row_key = key::setting_key(identifier);
    let column = column.to_vec();
    let value_bytes = value.to_be_bytes().to_vec();
    let store = store.clone();

    harness::execute(provider, key_consistent, deadline, retry, move |tx| {
        let store = store.clone();
        let row_key = row_key.clone();
        let column = column.clone();
        let value_bytes = value_bytes.clone();
        Box::pin(async move {
            store
                .mutate(&row_key, vec![(column, value_bytes)], vec![], tx)
                .await
        })
    })
    .await
}
