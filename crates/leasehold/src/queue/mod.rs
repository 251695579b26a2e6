//! The backend seam.
//!
//! Everything transport specific (wire protocol, authentication, payload
//! offloading) lives behind [`QueueService`]. The consumer core only ever
//! sends, receives, deletes, and extends the lease of messages.

mod memory;

pub use memory::MemoryQueue;

use crate::Result;
use bytes::Bytes;
use core::{fmt, time::Duration};

/// Opaque, backend-issued token identifying one delivery of a message.
///
/// Receipts are only valid for the delivery they came from: once a lease
/// expires and the message is redelivered, the old receipt no longer deletes
/// or extends it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message as returned by [`QueueService::receive_batch`].
#[derive(Clone, Debug)]
pub struct RawMessage {
    pub receipt: ReceiptHandle,
    pub body: Bytes,
    /// Partition/ordering key; empty if the backend has none.
    pub group_id: String,
}

/// Parameters of one long-poll receive.
#[derive(Clone, Copy, Debug)]
pub struct ReceiveRequest<'a> {
    pub queue: &'a str,
    /// Upper bound on messages returned. Always at least 1.
    pub max_messages: usize,
    /// How long to wait for at least one message before returning empty.
    pub wait_time: Duration,
    /// Lease granted to every returned message.
    pub visibility_timeout: Duration,
}

/// Operations the consumer core needs from a queue backend.
///
/// Implementations report failures as [`Error::Transport`], or as
/// [`Error::Cancelled`] when a request was aborted by cancellation.
///
/// Dropping any returned future must be safe: the core abandons in-flight
/// receives and lease extensions on shutdown.
///
/// [`Error::Transport`]: crate::Error::Transport
/// [`Error::Cancelled`]: crate::Error::Cancelled
pub trait QueueService: Send + Sync + 'static {
    /// Enqueues one message tagged with `group_id`.
    fn send(
        &self,
        queue: &str,
        group_id: &str,
        body: Bytes,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Long-polls for up to `request.max_messages` messages.
    fn receive_batch(
        &self,
        request: ReceiveRequest<'_>,
    ) -> impl Future<Output = Result<Vec<RawMessage>>> + Send;

    /// Acknowledges (permanently removes) a delivered message.
    fn delete(&self, queue: &str, receipt: &ReceiptHandle)
    -> impl Future<Output = Result<()>> + Send;

    /// Resets the lease of a delivered message to `timeout` from now.
    fn extend_visibility(
        &self,
        queue: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> impl Future<Output = Result<()>> + Send;
}
