//! Timestamp source — spec data model intro: "A timestamp source yields
//! monotonically non-decreasing microsecond values."

use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    fn now_micros(&self) -> i64;
}

/// Wall-clock microseconds since the Unix epoch.
#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_micros(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_micros() as i64
    }
}
