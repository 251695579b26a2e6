use crate::{HeartbeatPolicy, Result, signal::ErrorSink, telemetry};
use core::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Background task that keeps one message's lease alive.
///
/// Every `policy.interval` the task calls the extension capability with
/// `policy.extension`, which is strictly longer than the interval, so the
/// lease cannot lapse between two heartbeats. The handle owns the task:
///
/// - [`cancel`](Self::cancel) is idempotent and returns immediately.
/// - [`stop`](Self::stop) cancels and waits until the task has exited, after
///   which no extension call can be in progress or issued.
/// - Dropping the handle cancels the task.
///
/// An in-flight extension is abandoned (its future dropped) as soon as the
/// heartbeat is cancelled.
#[derive(Debug)]
pub(crate) struct LeaseHeartbeat {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl LeaseHeartbeat {
    /// Spawns the heartbeat task. Must be called within a tokio runtime.
    ///
    /// Fatal extension failures go to `sink`; failures that only reflect a
    /// cancellation are swallowed.
    pub(crate) fn start<F, Fut>(extend: F, policy: HeartbeatPolicy, sink: ErrorSink) -> Self
    where
        F: Fn(Duration) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // Deliberately not tied to the subscription token: a graceful
        // shutdown lets running handlers finish, and they still need their
        // lease while they do.
        let token = CancellationToken::new();
        let handle = tokio::spawn(heartbeat_loop(extend, policy, token.clone(), sink));
        Self {
            token,
            handle: Some(handle),
        }
    }

    /// Signals the task to stop. Only the first call has an effect.
    pub(crate) fn cancel(&self) {
        self.token.cancel();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancels the task and waits for it to exit.
    pub(crate) async fn stop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(_e) = handle.await {
                #[cfg(feature = "tracing")]
                tracing::warn!("Heartbeat task did not exit cleanly: {_e}");
            }
        }
    }
}

impl Drop for LeaseHeartbeat {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn heartbeat_loop<F, Fut>(
    extend: F,
    policy: HeartbeatPolicy,
    token: CancellationToken,
    sink: ErrorSink,
) where
    F: Fn(Duration) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            () = token.cancelled() => break,
            () = tokio::time::sleep(policy.interval) => {}
        }

        let result = tokio::select! {
            biased;
            () = token.cancelled() => break,
            result = extend(policy.extension) => result,
        };

        match result {
            Ok(()) => {
                telemetry::increment_extensions();
                #[cfg(feature = "tracing")]
                tracing::trace!("Lease extended by {:?}", policy.extension);
            }
            Err(e) if e.is_cancellation() => {
                // Acknowledgment raced the extension; the message is done.
                #[cfg(feature = "tracing")]
                tracing::trace!("Ignoring cancelled lease extension");
            }
            Err(e) => {
                telemetry::increment_lease_failures();
                #[cfg(feature = "tracing")]
                tracing::warn!("Lease extension failed: {e}");
                sink.report(e);
                break;
            }
        }
    }

    #[cfg(feature = "tracing")]
    tracing::trace!("Heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Error, Operation};
    use portable_atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    const POLICY: HeartbeatPolicy = HeartbeatPolicy {
        interval: Duration::from_secs(20),
        extension: Duration::from_secs(30),
    };

    fn sink() -> (ErrorSink, mpsc::Receiver<Error>, CancellationToken) {
        let token = CancellationToken::new();
        let (sink, rx) = ErrorSink::channel(4, token.clone());
        (sink, rx, token)
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        outcome: Result<()>,
    ) -> impl Fn(Duration) -> futures::future::Ready<Result<()>> + Send + Sync + 'static {
        let calls = Arc::clone(calls);
        move |timeout: Duration| {
            assert_eq!(timeout, POLICY.extension);
            calls.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(outcome.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn extends_once_per_interval() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (sink, mut rx, _token) = sink();
        let mut heartbeat = LeaseHeartbeat::start(counting(&calls, Ok(())), POLICY, sink);

        tokio::time::sleep(Duration::from_secs(19)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        heartbeat.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn no_extension_after_stop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (sink, _rx, _token) = sink();
        let mut heartbeat = LeaseHeartbeat::start(counting(&calls, Ok(())), POLICY, sink);

        tokio::time::sleep(Duration::from_secs(25)).await;
        heartbeat.stop().await;
        let seen = calls.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(calls.load(Ordering::SeqCst), seen);
        assert!(heartbeat.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_is_idempotent_and_drop_cancels() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (sink, _rx, _token) = sink();
        let heartbeat = LeaseHeartbeat::start(counting(&calls, Ok(())), POLICY, sink.clone());
        heartbeat.cancel();
        heartbeat.cancel();
        assert!(heartbeat.is_cancelled());

        let dropped = LeaseHeartbeat::start(counting(&calls, Ok(())), POLICY, sink);
        drop(dropped);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_failure_is_reported_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (sink, mut rx, token) = sink();
        let failure = Error::transport(Operation::ExtendVisibility, "throttled");
        let _heartbeat =
            LeaseHeartbeat::start(counting(&calls, Err(failure.clone())), POLICY, sink);

        tokio::time::sleep(Duration::from_secs(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(token.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), failure);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_failures_are_swallowed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (sink, mut rx, token) = sink();
        let mut heartbeat =
            LeaseHeartbeat::start(counting(&calls, Err(Error::Cancelled)), POLICY, sink);

        tokio::time::sleep(Duration::from_secs(45)).await;
        heartbeat.stop().await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!token.is_cancelled());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_abandons_a_pending_extension() {
        let (sink, mut rx, _token) = sink();
        let started = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&started);
        let mut heartbeat = LeaseHeartbeat::start(
            move |_: Duration| {
                seen.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(Error::transport(Operation::ExtendVisibility, "never"))
                }
            },
            POLICY,
            sink,
        );

        tokio::time::sleep(Duration::from_secs(21)).await;
        assert_eq!(started.load(Ordering::SeqCst), 1);

        heartbeat.stop().await;
        assert!(rx.try_recv().is_err());
    }
}
