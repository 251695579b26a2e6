//! # Metrics
//!
//! Consumer-side instruments, exported through whatever OpenTelemetry meter
//! provider the application installs globally. With the `metrics` feature
//! disabled every function here compiles to a no-op.
//!
//! | Instrument             | Kind           | Meaning                                   |
//! |------------------------|----------------|-------------------------------------------|
//! | `messages_received`    | counter        | messages handed over by the backend       |
//! | `messages_acked`       | counter        | successful acknowledgments                |
//! | `messages_inflight`    | up/down        | messages between receipt and handler exit |
//! | `lease_extensions`     | counter        | successful heartbeats                     |
//! | `lease_failures`       | counter        | heartbeats that failed fatally            |
//! | `subscription_errors`  | counter        | subscriptions ended by a fatal error      |
//! | `handler_duration`     | histogram (ms) | wall time of one handler invocation       |

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(feature = "metrics")]
struct Instruments {
    received: Counter<u64>,
    acked: Counter<u64>,
    inflight: UpDownCounter<i64>,
    extensions: Counter<u64>,
    lease_failures: Counter<u64>,
    subscription_errors: Counter<u64>,
    handler_duration_ms: Histogram<f64>,
}

#[cfg(feature = "metrics")]
static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

// Built on first use so the application has a chance to install its meter
// provider before any subscription starts.
#[cfg(feature = "metrics")]
fn instruments() -> &'static Instruments {
    INSTRUMENTS.get_or_init(|| {
        let meter = opentelemetry::global::meter("leasehold");
        Instruments {
            received: meter
                .u64_counter("messages_received")
                .with_description("Messages received from the backend")
                .build(),
            acked: meter
                .u64_counter("messages_acked")
                .with_description("Messages acknowledged by handlers")
                .build(),
            inflight: meter
                .i64_up_down_counter("messages_inflight")
                .with_description("Messages received but not yet released by a handler")
                .build(),
            extensions: meter
                .u64_counter("lease_extensions")
                .with_description("Successful lease extensions")
                .build(),
            lease_failures: meter
                .u64_counter("lease_failures")
                .with_description("Lease extensions that failed fatally")
                .build(),
            subscription_errors: meter
                .u64_counter("subscription_errors")
                .with_description("Subscriptions terminated by a fatal error")
                .build(),
            handler_duration_ms: meter
                .f64_histogram("handler_duration")
                .with_unit("ms")
                .with_description("Handler invocation duration")
                .build(),
        }
    })
}

#[cfg(feature = "metrics")]
pub fn increment_received(count: u64) {
    instruments().received.add(count, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_received(_count: u64) {}

#[cfg(feature = "metrics")]
pub fn increment_acked() {
    instruments().acked.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_acked() {}

#[cfg(feature = "metrics")]
pub fn increment_inflight() {
    instruments().inflight.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_inflight() {}

#[cfg(feature = "metrics")]
pub fn decrement_inflight() {
    instruments().inflight.add(-1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn decrement_inflight() {}

#[cfg(feature = "metrics")]
pub fn increment_extensions() {
    instruments().extensions.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_extensions() {}

#[cfg(feature = "metrics")]
pub fn increment_lease_failures() {
    instruments().lease_failures.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_lease_failures() {}

#[cfg(feature = "metrics")]
pub fn increment_subscription_errors() {
    instruments().subscription_errors.add(1, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn increment_subscription_errors() {}

#[cfg(feature = "metrics")]
pub fn record_handler_duration(duration_ms: f64) {
    instruments().handler_duration_ms.record(duration_ms, &[]);
}

#[cfg(not(feature = "metrics"))]
pub fn record_handler_duration(_duration_ms: f64) {}
