//! Messages owned by the consumer between receipt and acknowledgment.
//!
//! An [`InFlightMessage`] moves through
//! `Received -> Heartbeating -> {Acknowledged | Abandoned}`. The heartbeat
//! starts when the message is constructed. It stops either in
//! [`InFlightMessage::ack`], right before the backend delete, or when the
//! message is dropped without being acknowledged. The backend's lease then
//! lapses and it redelivers the message.

mod heartbeat;

use heartbeat::LeaseHeartbeat;

use crate::{
    HeartbeatPolicy, RawMessage, ReceiptHandle, Result, signal::ErrorSink, telemetry,
};
use bytes::Bytes;
use core::{fmt, time::Duration};
use futures::future::{BoxFuture, FutureExt};

type AckFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A received, not yet acknowledged message.
///
/// Handed to the subscription handler by value. Calling [`ack`](Self::ack)
/// consumes the message, so it can be acknowledged at most once.
pub struct InFlightMessage {
    body: Bytes,
    group_id: String,
    receipt: ReceiptHandle,
    ack: AckFn,
    heartbeat: LeaseHeartbeat,
    sink: ErrorSink,
}

impl InFlightMessage {
    /// Wraps `raw` and immediately starts its heartbeat.
    ///
    /// - `ack`: deletes the message at the backend.
    /// - `extend`: resets the message's lease to the given timeout.
    pub(crate) fn new<A, AFut, E, EFut>(
        raw: RawMessage,
        ack: A,
        extend: E,
        policy: HeartbeatPolicy,
        sink: ErrorSink,
    ) -> Self
    where
        A: FnOnce() -> AFut + Send + Sync + 'static,
        AFut: Future<Output = Result<()>> + Send + 'static,
        E: Fn(Duration) -> EFut + Send + Sync + 'static,
        EFut: Future<Output = Result<()>> + Send + 'static,
    {
        let heartbeat = LeaseHeartbeat::start(extend, policy, sink.clone());
        Self {
            body: raw.body,
            group_id: raw.group_id,
            receipt: raw.receipt,
            ack: Box::new(move || ack().boxed()),
            heartbeat,
            sink,
        }
    }

    /// The message payload.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The payload as a cheaply cloneable buffer.
    pub fn bytes(&self) -> Bytes {
        self.body.clone()
    }

    /// The ordering key set by the producer. Empty if the backend has none.
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub const fn receipt(&self) -> &ReceiptHandle {
        &self.receipt
    }

    /// Stops the heartbeat, then deletes the message at the backend.
    ///
    /// The heartbeat task has fully exited before the delete is issued, so a
    /// lease extension can never race the acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns the backend's delete error. The error is also reported to the
    /// owning subscription, which then shuts down.
    pub async fn ack(self) -> Result<()> {
        let Self {
            ack,
            mut heartbeat,
            sink,
            ..
        } = self;

        heartbeat.stop().await;

        match ack().await {
            Ok(()) => {
                telemetry::increment_acked();
                Ok(())
            }
            Err(e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Acknowledgment failed: {e}");
                if !e.is_cancellation() {
                    sink.report(e.clone());
                }
                Err(e)
            }
        }
    }
}

impl fmt::Debug for InFlightMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightMessage")
            .field("receipt", &self.receipt)
            .field("group_id", &self.group_id)
            .field("body_len", &self.body.len())
            .field("heartbeat_active", &!self.heartbeat.is_cancelled())
            .finish_non_exhaustive()
    }
}
