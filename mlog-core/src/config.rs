//! Recognized configuration options — spec §6 table.

use std::time::Duration;

/// Batching is disabled below this send delay (spec §4.D).
pub const MIN_DELIVERY_DELAY: Duration = Duration::from_millis(10);
/// Outgoing queue capacity is `send_batch_size * BATCH_SIZE_MULTIPLIER`.
pub const BATCH_SIZE_MULTIPLIER: usize = 10;
/// Delay before a puller's first scheduled poll.
pub const INITIAL_READER_DELAY: Duration = Duration::from_millis(100);
/// Batcher shutdown drain budget.
pub const CLOSE_DOWN_WAIT: Duration = Duration::from_secs(10);
/// Reader pool shutdown await budget before force-cancelling.
pub const READER_POOL_SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// Mirrors spec §6's configuration table. Fields with no spec-mandated
/// default (`num_buckets`, `send_batch_size`, `send_delay`, `read_threads`,
/// `read_batch_size`, `read_interval`) get convenience defaults suitable for
/// tests and the demo binary only — a real deployment sets these explicitly
/// via whatever configuration loader the surrounding system uses (out of
/// scope here, per spec §1).
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// `max-write-time`: deadline for write-path backend ops. Default 10000ms.
    pub max_write_time: Duration,
    /// `max-read-time`: deadline for read-path backend ops. Default 4000ms.
    pub max_read_time: Duration,
    /// `read-lag-time`: holdback from "live" on polls. Default 500ms;
    /// `maxSendDelay` is added internally to form the effective lag (§4.E).
    pub read_lag_time: Duration,
    /// `key-consistent`: use key-consistent transactions. Default false.
    pub key_consistent: bool,
    /// `num-buckets`: fan-out per timeslice.
    pub num_buckets: u32,
    /// `send-batch-size`: max envelopes per flush; queue capacity is this
    /// times [`BATCH_SIZE_MULTIPLIER`].
    pub send_batch_size: usize,
    /// `send-delay`: target max age of the oldest envelope before flush.
    /// Below [`MIN_DELIVERY_DELAY`], batching is disabled entirely.
    pub send_delay: Duration,
    /// `read-threads`: dispatch concurrency for the reader pool.
    pub read_threads: usize,
    /// `read-batch-size`: per-slice limit when pulling (`maxReadMsg`).
    pub read_batch_size: usize,
    /// `read-interval`: fixed delay between polls per puller.
    pub read_interval: Duration,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_write_time: Duration::from_millis(10_000),
            max_read_time: Duration::from_millis(4_000),
            read_lag_time: Duration::from_millis(500),
            key_consistent: false,
            num_buckets: 4,
            send_batch_size: 100,
            send_delay: Duration::from_millis(50),
            read_threads: 4,
            read_batch_size: 100,
            read_interval: Duration::from_millis(250),
        }
    }
}

/// A reader's starting cursor. An identifier-less marker never persists a
/// cursor (spec §4.E / GLOSSARY).
#[derive(Clone, Debug)]
pub struct ReadMarker {
    pub identifier: Option<String>,
    pub start_time_micros: i64,
}

impl ReadMarker {
    pub fn anonymous(start_time_micros: i64) -> Self {
        Self {
            identifier: None,
            start_time_micros,
        }
    }

    pub fn named(identifier: impl Into<String>, start_time_micros: i64) -> Self {
        Self {
            identifier: Some(identifier.into()),
            start_time_micros,
        }
    }
}
