//! A durable, partitioned, append-only message log built on a pluggable
//! Key-Column-Value store.
//!
//! [`Log`] is the entry point: open one with [`Log::open`], produce with
//! [`Log::produce`] (or the partition/routing-key variants), and consume by
//! registering a [`MessageReader`] with [`Log::register_reader`].

pub mod clock;
pub mod config;
pub mod error;
pub mod harness;
pub mod key;
pub mod kvs;
pub mod log;
pub mod manager;
pub mod message;
pub mod read;
pub mod send;
pub mod settings;

pub use clock::{Clock, SystemClock};
pub use config::{LogConfig, ReadMarker};
pub use error::{LogError, Result};
pub use kvs::{KeySliceQuery, KvStore, KvTransaction, MemoryKvStore, RowMutation, TransactionProvider};
pub use log::Log;
pub use manager::{LogManager, StaticLogManager};
pub use message::{DeliveryFuture, Message};
pub use read::MessageReader;
