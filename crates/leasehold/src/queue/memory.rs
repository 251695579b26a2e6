//! In-process [`QueueService`] for tests, benches, and single-process use.
//!
//! Mirrors the lease semantics of hosted at-least-once queues: a received
//! message is hidden for its visibility timeout, becomes receivable again
//! when the lease lapses, and gets a fresh receipt on every delivery so that
//! stale receipts can neither delete nor extend it.

use super::{QueueService, RawMessage, ReceiptHandle, ReceiveRequest};
use crate::{Error, Operation, Result};
use bytes::Bytes;
use core::time::Duration;
use parking_lot::Mutex;
use portable_atomic::{AtomicU64, Ordering};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{sync::Notify, time::Instant};

struct Entry {
    id: u64,
    body: Bytes,
    group_id: String,
    visible_at: Instant,
    receipt: Option<ReceiptHandle>,
    deliveries: u32,
}

#[derive(Default)]
struct Counters {
    sends: AtomicU64,
    receives: AtomicU64,
    deletes: AtomicU64,
    extends: AtomicU64,
}

#[derive(Default)]
struct Inner {
    queues: Mutex<HashMap<String, VecDeque<Entry>>>,
    // Woken on every send and every lease change so long polls re-check.
    changed: Notify,
    next_id: AtomicU64,
    next_receipt: AtomicU64,
    counters: Counters,
}

/// Thread-safe in-memory queue backend.
///
/// Clones share the same queues. Time is read from the tokio clock, so tests
/// running with a paused runtime control lease expiry deterministically.
///
/// ## Example
///
/// ```
/// use leasehold::{MemoryQueue, QueueService, ReceiveRequest};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> leasehold::Result<()> {
/// let queue = MemoryQueue::new();
/// queue.send("orders", "customer-1", "created".into()).await?;
///
/// let batch = queue
///     .receive_batch(ReceiveRequest {
///         queue: "orders",
///         max_messages: 10,
///         wait_time: Duration::ZERO,
///         visibility_timeout: Duration::from_secs(30),
///     })
///     .await?;
/// assert_eq!(batch.len(), 1);
/// assert_eq!(batch[0].group_id, "customer-1");
///
/// queue.delete("orders", &batch[0].receipt).await?;
/// assert!(queue.is_empty("orders"));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored in `queue`, visible or not.
    pub fn len(&self, queue: &str) -> usize {
        self.inner.queues.lock().get(queue).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Number of messages in `queue` currently hidden by an unexpired lease.
    pub fn in_flight(&self, queue: &str) -> usize {
        let now = Instant::now();
        self.inner.queues.lock().get(queue).map_or(0, |entries| {
            entries
                .iter()
                .filter(|e| e.receipt.is_some() && e.visible_at > now)
                .count()
        })
    }

    /// Total deliveries of the oldest message carrying `body`, if stored.
    pub fn deliveries_of(&self, queue: &str, body: &[u8]) -> Option<u32> {
        self.inner
            .queues
            .lock()
            .get(queue)?
            .iter()
            .find(|e| e.body.as_ref() == body)
            .map(|e| e.deliveries)
    }

    pub fn send_count(&self) -> u64 {
        self.inner.counters.sends.load(Ordering::Relaxed)
    }

    /// Number of receive calls served, including empty ones.
    pub fn receive_count(&self) -> u64 {
        self.inner.counters.receives.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.inner.counters.deletes.load(Ordering::Relaxed)
    }

    pub fn extend_count(&self) -> u64 {
        self.inner.counters.extends.load(Ordering::Relaxed)
    }

    /// Hands out up to `max` visible messages and leases them.
    ///
    /// Also returns the earliest instant at which a currently hidden message
    /// becomes visible again, so the caller knows when to look again.
    fn take_visible(
        &self,
        queue: &str,
        max: usize,
        visibility_timeout: Duration,
    ) -> (Vec<RawMessage>, Option<Instant>) {
        let now = Instant::now();
        let mut queues = self.inner.queues.lock();
        let Some(entries) = queues.get_mut(queue) else {
            return (Vec::new(), None);
        };

        let mut batch = Vec::new();
        let mut next_visible: Option<Instant> = None;
        for entry in entries.iter_mut() {
            if entry.visible_at > now {
                next_visible =
                    Some(next_visible.map_or(entry.visible_at, |t| t.min(entry.visible_at)));
                continue;
            }
            if batch.len() == max {
                continue;
            }

            let seq = self.inner.next_receipt.fetch_add(1, Ordering::Relaxed);
            let receipt = ReceiptHandle::new(format!("{}-{seq}", entry.id));
            entry.receipt = Some(receipt.clone());
            entry.visible_at = now + visibility_timeout;
            entry.deliveries += 1;

            batch.push(RawMessage {
                receipt,
                body: entry.body.clone(),
                group_id: entry.group_id.clone(),
            });
        }
        (batch, next_visible)
    }

    /// Applies `f` to the entry currently leased under `receipt`.
    fn with_leased<T>(
        &self,
        operation: Operation,
        queue: &str,
        receipt: &ReceiptHandle,
        f: impl FnOnce(&mut VecDeque<Entry>, usize) -> T,
    ) -> Result<T> {
        let mut queues = self.inner.queues.lock();
        let entries = queues
            .get_mut(queue)
            .ok_or_else(|| Error::transport(operation, format!("unknown queue `{queue}`")))?;
        let index = entries
            .iter()
            .position(|e| e.receipt.as_ref() == Some(receipt))
            .ok_or_else(|| {
                Error::transport(operation, format!("receipt `{receipt}` is no longer valid"))
            })?;
        Ok(f(entries, index))
    }
}

impl QueueService for MemoryQueue {
    async fn send(&self, queue: &str, group_id: &str, body: Bytes) -> Result<()> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .queues
            .lock()
            .entry(queue.to_owned())
            .or_default()
            .push_back(Entry {
                id,
                body,
                group_id: group_id.to_owned(),
                visible_at: Instant::now(),
                receipt: None,
                deliveries: 0,
            });
        self.inner.counters.sends.fetch_add(1, Ordering::Relaxed);
        self.inner.changed.notify_waiters();
        Ok(())
    }

    async fn receive_batch(&self, request: ReceiveRequest<'_>) -> Result<Vec<RawMessage>> {
        self.inner.counters.receives.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + request.wait_time;
        let max = request.max_messages.max(1);

        loop {
            // Register interest before looking so a concurrent send cannot
            // slip between the check and the wait.
            let changed = self.inner.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let (batch, next_visible) =
                self.take_visible(request.queue, max, request.visibility_timeout);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }

            let wake_at = next_visible.map_or(deadline, |t| t.min(deadline));
            tokio::select! {
                () = &mut changed => {}
                () = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, queue: &str, receipt: &ReceiptHandle) -> Result<()> {
        self.with_leased(Operation::Delete, queue, receipt, |entries, index| {
            entries.remove(index);
        })?;
        self.inner.counters.deletes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(
        &self,
        queue: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> Result<()> {
        self.with_leased(Operation::ExtendVisibility, queue, receipt, |entries, index| {
            entries[index].visible_at = Instant::now() + timeout;
        })?;
        self.inner.counters.extends.fetch_add(1, Ordering::Relaxed);
        // A zero timeout releases the message immediately.
        self.inner.changed.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(queue: &str, max_messages: usize, visibility_secs: u64) -> ReceiveRequest<'_> {
        ReceiveRequest {
            queue,
            max_messages,
            wait_time: Duration::ZERO,
            visibility_timeout: Duration::from_secs(visibility_secs),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn received_messages_are_hidden_until_the_lease_lapses() {
        let queue = MemoryQueue::new();
        queue.send("q", "g", "a".into()).await.unwrap();

        let first = queue.receive_batch(request("q", 10, 30)).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(queue.in_flight("q"), 1);
        assert!(queue.receive_batch(request("q", 10, 30)).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let second = queue.receive_batch(request("q", 10, 30)).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].receipt, second[0].receipt);
        assert_eq!(queue.deliveries_of("q", b"a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_receipts_are_rejected() {
        let queue = MemoryQueue::new();
        queue.send("q", "", "a".into()).await.unwrap();

        let stale = queue.receive_batch(request("q", 1, 5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = queue.receive_batch(request("q", 1, 5)).await.unwrap();

        let err = queue.delete("q", &stale[0].receipt).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Transport {
                operation: Operation::Delete,
                ..
            }
        ));
        assert_eq!(queue.delete_count(), 0);

        queue.delete("q", &fresh[0].receipt).await.unwrap();
        assert_eq!(queue.delete_count(), 1);
        assert!(queue.is_empty("q"));
    }

    #[tokio::test(start_paused = true)]
    async fn extension_pushes_back_redelivery() {
        let queue = MemoryQueue::new();
        queue.send("q", "", "a".into()).await.unwrap();

        let batch = queue.receive_batch(request("q", 1, 10)).await.unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;
        queue
            .extend_visibility("q", &batch[0].receipt, Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(queue.receive_batch(request("q", 1, 10)).await.unwrap().is_empty());
        assert_eq!(queue.extend_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_respect_the_requested_maximum() {
        let queue = MemoryQueue::new();
        for i in 0..5 {
            queue.send("q", "", format!("m{i}").into()).await.unwrap();
        }
        assert_eq!(queue.receive_batch(request("q", 3, 30)).await.unwrap().len(), 3);
        assert_eq!(queue.receive_batch(request("q", 3, 30)).await.unwrap().len(), 2);
        assert_eq!(queue.in_flight("q"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_wakes_on_send() {
        let queue = MemoryQueue::new();
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            producer.send("q", "", "late".into()).await.unwrap();
        });

        let start = Instant::now();
        let batch = queue
            .receive_batch(ReceiveRequest {
                queue: "q",
                max_messages: 1,
                wait_time: Duration::from_secs(15),
                visibility_timeout: Duration::from_secs(30),
            })
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn long_poll_times_out_empty() {
        let queue = MemoryQueue::new();
        let start = Instant::now();
        let batch = queue
            .receive_batch(ReceiveRequest {
                queue: "q",
                max_messages: 1,
                wait_time: Duration::from_secs(15),
                visibility_timeout: Duration::from_secs(30),
            })
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(start.elapsed() >= Duration::from_secs(15));
    }
}
