//! Backend operation harness — spec §4.B.
//!
//! Wraps a closure that runs against a fresh [`KvTransaction`] with retry on
//! transient storage failure and a hard deadline, so everything above this
//! layer can treat the store as if it never failed transiently.

use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::error::{LogError, Result};
use crate::kvs::{KvTransaction, TransactionProvider};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Backoff schedule between retries. Matches the "exponential or fixed
/// backoff" language of spec §4.B with an exponential default.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }
}

/// Runs `op` against successive fresh transactions until it succeeds or
/// `deadline` elapses, in which case the last error is surfaced as
/// [`LogError::BackendUnavailable`].
pub async fn execute<T, F>(
    provider: &dyn TransactionProvider,
    key_consistent: bool,
    deadline: Duration,
    retry: &RetryPolicy,
    mut op: F,
) -> Result<T>
where
    T: Send,
    F: for<'a> FnMut(&'a mut dyn KvTransaction) -> BoxFuture<'a, T>,
{
    let start = Instant::now();
    let mut backoff = retry.initial_backoff;
    let mut last_err: Option<anyhow::Error> = None;

    loop {
        let elapsed = start.elapsed();
        if elapsed > deadline {
            let source = last_err.unwrap_or_else(|| anyhow::anyhow!("deadline exceeded"));
            return Err(LogError::BackendUnavailable {
                elapsed_micros: elapsed.as_micros() as u64,
                source,
            });
        }

        let mut tx = match provider.begin(key_consistent).await {
            Ok(tx) => tx,
            Err(e) => {
                warn!(error = %e, "backend harness: failed to begin transaction, retrying");
                last_err = Some(e);
                tokio::time::sleep(backoff).await;
                backoff = backoff.mul_f64(retry.multiplier).min(retry.max_backoff);
                continue;
            }
        };

        match op(tx.as_mut()).await {
            Ok(value) => {
                tx.commit().await.map_err(|source| LogError::BackendUnavailable {
                    elapsed_micros: start.elapsed().as_micros() as u64,
                    source,
                })?;
                return Ok(value);
            }
            Err(e) => {
                let _ = tx.rollback().await;
                warn!(error = %e, "backend harness: operation failed, retrying");
                last_err = Some(e);
                tokio::time::sleep(backoff).await;
                backoff = backoff.mul_f64(retry.multiplier).min(retry.max_backoff);
            }
        }
    }
}
