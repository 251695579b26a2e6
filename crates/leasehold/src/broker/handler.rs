use crate::InFlightMessage;
use tokio_util::sync::CancellationToken;

/// Processes messages delivered by a subscription.
///
/// The handler owns the message and decides whether and when to call
/// [`InFlightMessage::ack`]. Returning without acknowledging abandons the
/// message: its heartbeat stops and the backend redelivers it once the lease
/// lapses. This is how per-message failures are expressed; they never end
/// the subscription.
///
/// `token` is cancelled when the subscription is shutting down, either
/// because the caller cancelled it or because of a fatal error. Handlers are
/// never interrupted, but long-running ones may want to observe it.
///
/// Implemented for every
/// `Fn(CancellationToken, InFlightMessage) -> impl Future<Output = ()>`
/// closure.
pub trait Handler: Send + Sync + 'static {
    fn handle(
        &self,
        token: CancellationToken,
        message: InFlightMessage,
    ) -> impl Future<Output = ()> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(CancellationToken, InFlightMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    fn handle(
        &self,
        token: CancellationToken,
        message: InFlightMessage,
    ) -> impl Future<Output = ()> + Send {
        self(token, message)
    }
}
