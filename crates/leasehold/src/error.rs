//! Error types for the consumer core.
//!
//! This module defines the central `Error` enum, which captures every fatal
//! and recoverable case that can surface from a subscription or from a
//! [`QueueService`](crate::QueueService) call.
//!
//! ## Error Cases
//! - `Transport`: A backend request (send, receive, delete, extend) failed.
//!   Fatal to the enclosing subscription.
//! - `Cancelled`: An operation was aborted because its scope was cancelled.
//!   Heartbeats swallow this case.
//! - `InvalidConfig`: A [`SubscriptionConfig`](crate::SubscriptionConfig)
//!   failed validation.
//! - `ChannelError`: An internal hand-off between tasks failed.
//! - `WorkerPanicked`: A worker task did not run to completion.

use core::fmt;

pub type Result<T> = core::result::Result<T, Error>;

/// The backend operation a [`Error::Transport`] originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Send,
    Receive,
    Delete,
    ExtendVisibility,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Send => write!(f, "send"),
            Operation::Receive => write!(f, "receive"),
            Operation::Delete => write!(f, "delete"),
            Operation::ExtendVisibility => write!(f, "extend visibility"),
        }
    }
}

/// Unified error type for the consumer core.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// A request to the queue backend failed.
    #[error("Transport error during {operation}: {reason}")]
    Transport { operation: Operation, reason: String },

    /// The operation was aborted because its scope was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The subscription configuration was rejected.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    /// Internal channel send/receive failure (e.g., closed channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },

    /// A worker task panicked or was aborted before finishing.
    #[error("Worker failed: {context}")]
    WorkerPanicked { context: String },
}

impl Error {
    /// Shorthand for a [`Error::Transport`] failure.
    pub fn transport(operation: Operation, reason: impl Into<String>) -> Self {
        Self::Transport {
            operation,
            reason: reason.into(),
        }
    }

    /// Returns `true` when the error only reflects a cancelled scope and is
    /// therefore not an operational fault.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cancelled_is_a_cancellation() {
        assert!(Error::Cancelled.is_cancellation());
        assert!(!Error::transport(Operation::ExtendVisibility, "boom").is_cancellation());
        assert!(
            !Error::ChannelError {
                context: "closed".into()
            }
            .is_cancellation()
        );
    }

    #[test]
    fn transport_display_names_the_operation() {
        let err = Error::transport(Operation::Receive, "connection reset");
        assert_eq!(
            err.to_string(),
            "Transport error during receive: connection reset"
        );
    }
}
