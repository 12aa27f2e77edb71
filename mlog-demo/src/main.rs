use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mlog_core::{
    Clock, Log, LogConfig, LogManager, MemoryKvStore, Message, MessageReader, ReadMarker,
    StaticLogManager, SystemClock,
};
use tracing_subscriber::EnvFilter;

struct PrintingReader {
    name: String,
}

#[async_trait]
impl MessageReader for PrintingReader {
    async fn process(&self, message: &Message) -> anyhow::Result<()> {
        tracing::info!(
            reader = %self.name,
            sender = %message.sender_id,
            timestamp = message.timestamp_micros,
            payload_len = message.payload.len(),
            "delivered"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let sender_id = parse_sender_id();

    tracing::info!("Using MemoryKvStore (no external backend configured)");
    let store = Arc::new(MemoryKvStore::new("mlog-demo"));
    let manager: Arc<dyn LogManager> = Arc::new(StaticLogManager::new(
        sender_id,
        4,
        0,
        vec![0],
        store.clone(),
        store,
    ));

    let config = LogConfig {
        send_delay: Duration::from_millis(50),
        read_interval: Duration::from_millis(100),
        read_lag_time: Duration::from_millis(100),
        ..LogConfig::default()
    };
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let start_time_micros = clock.now_micros();

    let log = Log::open("demo", manager, config, clock).await?;

    // A fresh marker should start from "now", not the epoch: a puller only
    // ever advances one timeslice (100s) per tick, so a marker starting at
    // absolute 0 would need millions of ticks to catch up to the present.
    log.register_reader(
        Arc::new(PrintingReader {
            name: "printer".to_string(),
        }),
        ReadMarker::named("demo-reader", start_time_micros),
    )
    .await?;

    for i in 0..5u32 {
        let future = log.produce(format!("hello #{i}").into_bytes()).await?;
        future.await.map_err(|e| anyhow::anyhow!(e.to_string()))?;
        tracing::info!(i, "produced");
    }

    tokio::time::sleep(Duration::from_millis(700)).await;

    log.close().await?;
    Ok(())
}

/// Parses `--sender-id <id>` from argv, falling back to `SENDER_ID`, then a
/// fixed default.
fn parse_sender_id() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if args[i] == "--sender-id" {
            if let Some(value) = args.get(i + 1) {
                return value.clone();
            }
        }
    }
    std::env::var("SENDER_ID").unwrap_or_else(|_| "demo-sender".to_string())
}
