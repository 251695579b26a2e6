use crate::{
    Error, InFlightMessage, QueueService, RawMessage, ReceiveRequest, SubscriptionConfig,
    signal::ErrorSink, telemetry,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// A message on its way to a worker, together with the concurrency slot it
/// occupies. The slot is released when the worker drops the delivery.
pub(crate) struct Delivery {
    pub(crate) message: InFlightMessage,
    pub(crate) slot: Slot,
}

/// One occupied concurrency slot.
///
/// The in-flight gauge follows the permit: it goes up when the slot is
/// taken and down when the slot is dropped, including during unwinding.
pub(crate) struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl Slot {
    pub(crate) fn new(permit: OwnedSemaphorePermit) -> Self {
        telemetry::increment_inflight();
        Self { _permit: permit }
    }

    #[cfg(test)]
    pub(crate) fn num_permits(&self) -> usize {
        self._permit.num_permits()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        telemetry::decrement_inflight();
    }
}

/// Feeds received messages into the worker channel.
///
/// Backpressure is a semaphore with one permit per concurrency slot. Before
/// each receive the poller waits for at least one free slot, then claims as
/// many further free slots as the batch size allows and asks the backend for
/// exactly that many messages. Every delivered message carries one permit
/// until its handler returns, so no more than `max_messages` messages can be
/// handed to handlers at once.
pub(crate) struct Poller<Q> {
    pub(crate) service: Arc<Q>,
    pub(crate) config: Arc<SubscriptionConfig>,
    pub(crate) permits: Arc<Semaphore>,
    pub(crate) deliveries: mpsc::Sender<Delivery>,
    pub(crate) sink: ErrorSink,
}

impl<Q: QueueService> Poller<Q> {
    /// Runs until the subscription is cancelled or a receive fails.
    ///
    /// # Behavior
    ///
    /// - Issues no receive once cancellation has been observed; a receive
    ///   in progress is abandoned.
    /// - A receive error is reported as fatal and stops the poller.
    /// - Messages received but not yet delivered when the subscription stops
    ///   are dropped, which stops their heartbeats.
    pub(crate) async fn run(self) {
        let token = self.sink.token().clone();

        #[cfg(feature = "tracing")]
        tracing::debug!("Poller started");

        'poll: loop {
            let Some(mut reserved) = self.reserve(&token).await else {
                break;
            };

            let request = ReceiveRequest {
                queue: &self.config.queue,
                max_messages: reserved.num_permits(),
                wait_time: self.config.wait_time,
                visibility_timeout: self.config.visibility_timeout,
            };

            let received = tokio::select! {
                biased;
                () = token.cancelled() => break,
                received = self.service.receive_batch(request) => received,
            };

            let batch = match received {
                Ok(batch) => batch,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!("Receive failed, stopping poller: {e}");
                    self.sink.report(e);
                    break;
                }
            };

            #[cfg(feature = "tracing")]
            tracing::trace!(
                "Received {} of {} requested messages",
                batch.len(),
                reserved.num_permits()
            );
            telemetry::increment_received(batch.len() as u64);

            for raw in batch {
                let message = self.track(raw);

                let permit = match reserved.split(1) {
                    Some(permit) => permit,
                    // The backend returned more than asked for. The surplus
                    // waits for a free slot, heartbeat already running.
                    None => match self.acquire_one(&token).await {
                        Some(permit) => permit,
                        None => break 'poll,
                    },
                };

                let slot = Slot::new(permit);
                if self.deliveries.send(Delivery { message, slot }).await.is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::debug!("Worker channel closed, stopping poller");
                    break 'poll;
                }
            }
            // Slots reserved for messages that did not arrive are released
            // here when `reserved` drops.
        }

        #[cfg(feature = "tracing")]
        tracing::debug!("Poller stopped");
    }

    /// Waits for one free slot, then greedily claims up to a full batch.
    async fn reserve(&self, token: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        let mut reserved = self.acquire_one(token).await?;

        let extra = self
            .permits
            .available_permits()
            .min(self.config.batch_size.saturating_sub(1));
        if extra > 0 {
            let extra = u32::try_from(extra).unwrap_or(u32::MAX);
            if let Ok(more) = Arc::clone(&self.permits).try_acquire_many_owned(extra) {
                reserved.merge(more);
            }
        }
        Some(reserved)
    }

    async fn acquire_one(&self, token: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            () = token.cancelled() => None,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_e) => {
                    self.sink.report(Error::ChannelError {
                        context: "concurrency semaphore closed".to_string(),
                    });
                    None
                }
            },
        }
    }

    /// Wraps a raw message, binding its ack and lease capabilities to this
    /// queue. The heartbeat starts here.
    fn track(&self, raw: RawMessage) -> InFlightMessage {
        let ack = {
            let service = Arc::clone(&self.service);
            let config = Arc::clone(&self.config);
            let receipt = raw.receipt.clone();
            move || async move { service.delete(&config.queue, &receipt).await }
        };

        let extend = {
            let service = Arc::clone(&self.service);
            let config = Arc::clone(&self.config);
            let receipt = raw.receipt.clone();
            move |timeout: Duration| {
                let service = Arc::clone(&service);
                let config = Arc::clone(&config);
                let receipt = receipt.clone();
                async move {
                    service
                        .extend_visibility(&config.queue, &receipt, timeout)
                        .await
                }
            }
        };

        InFlightMessage::new(
            raw,
            ack,
            extend,
            self.config.heartbeat_policy(),
            self.sink.clone(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryQueue;

    fn poller(
        service: MemoryQueue,
        config: SubscriptionConfig,
    ) -> (Poller<MemoryQueue>, mpsc::Receiver<Delivery>, CancellationToken) {
        let token = CancellationToken::new();
        let (sink, _errors) = ErrorSink::channel(config.max_messages + 1, token.clone());
        let (tx, rx) = mpsc::channel(config.max_messages);
        let poller = Poller {
            service: Arc::new(service),
            permits: Arc::new(Semaphore::new(config.max_messages)),
            config: Arc::new(config),
            deliveries: tx,
            sink,
        };
        (poller, rx, token)
    }

    #[tokio::test(start_paused = true)]
    async fn stops_receiving_at_the_ceiling() {
        let queue = MemoryQueue::new();
        for i in 0..10 {
            queue.send("q", "", format!("m{i}").into()).await.unwrap();
        }

        let config = SubscriptionConfig::new("q", 3).with_wait_time(Duration::from_secs(1));
        let (poller, mut rx, token) = poller(queue.clone(), config);
        let permits = Arc::clone(&poller.permits);
        let task = tokio::spawn(poller.run());

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(rx.recv().await.unwrap());
        }

        // All slots taken: the poller must not fetch anything else.
        let receives = queue.receive_count();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.receive_count(), receives);
        assert_eq!(queue.in_flight("q"), 3);
        assert_eq!(permits.available_permits(), 0);

        // Releasing one slot lets exactly one more message through.
        drop(held.pop());
        held.push(rx.recv().await.unwrap());
        assert_eq!(queue.in_flight("q"), 4);
        assert!(rx.try_recv().is_err());

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn unused_reservations_are_released() {
        let queue = MemoryQueue::new();
        queue.send("q", "", "only".into()).await.unwrap();

        let config = SubscriptionConfig::new("q", 4).with_wait_time(Duration::from_secs(1));
        let (poller, mut rx, token) = poller(queue, config);
        let permits = Arc::clone(&poller.permits);
        let task = tokio::spawn(poller.run());

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.message.body(), b"only");
        assert_eq!(delivery.slot.num_permits(), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        token.cancel();
        task.await.unwrap();

        // Only the delivered message still holds a slot.
        assert_eq!(permits.available_permits(), 3);
        drop(delivery);
        assert_eq!(permits.available_permits(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_a_pending_receive() {
        let queue = MemoryQueue::new();
        let config = SubscriptionConfig::new("q", 1);
        let (poller, _rx, token) = poller(queue.clone(), config);
        let task = tokio::spawn(poller.run());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(queue.receive_count(), 1);

        token.cancel();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(queue.receive_count(), 1);
    }
}
