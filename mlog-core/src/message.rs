//! Wire-level message type and the delivery future.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::LogError;

/// What a [`crate::read::MessageReader`] receives for each dispatched entry.
#[derive(Clone, Debug)]
pub struct Message {
    pub payload: Vec<u8>,
    pub timestamp_micros: i64,
    pub sender_id: String,
}

type DeliveryOutcome = Result<(), Arc<LogError>>;

/// The producer side of a single-shot delivery completion cell (spec §9
/// "Per-message delivery future"): `complete`/`fail` transition it exactly
/// once, matching spec invariant 3.
pub struct DeliverySender(oneshot::Sender<DeliveryOutcome>);

impl DeliverySender {
    pub fn delivered(self) {
        let _ = self.0.send(Ok(()));
    }

    pub fn failed(self, err: Arc<LogError>) {
        let _ = self.0.send(Err(err));
    }
}

/// A future that resolves once its message has been durably flushed (or has
/// failed). A dropped sender (e.g. the batcher panicking) resolves the
/// future as `ClosedLog`, since the message's fate can no longer be known.
pub struct DeliveryFuture(oneshot::Receiver<DeliveryOutcome>);

pub fn delivery_pair() -> (DeliverySender, DeliveryFuture) {
    let (tx, rx) = oneshot::channel();
    (DeliverySender(tx), DeliveryFuture(rx))
}

impl Future for DeliveryFuture {
    type Output = Result<(), Arc<LogError>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.0).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_canceled)) => Poll::Ready(Err(Arc::new(LogError::ClosedLog))),
            Poll::Pending => Poll::Pending,
        }
    }
}
