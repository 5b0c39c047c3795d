//! Metric recording points. Compiled to nothing without the `metrics` feature.

use std::time::Duration;

#[cfg(feature = "metrics")]
use gatelink_metrics::{
    counter,
    definitions::{client, connection, events, labels},
    gauge, histogram,
};

pub(crate) fn request_sent(method: &str) {
    #[cfg(feature = "metrics")]
    counter!(client::REQUESTS_TOTAL, labels::METHOD => method.to_string()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = method;
}

pub(crate) fn response_matched(method: &str, ok: bool, elapsed: Duration) {
    #[cfg(feature = "metrics")]
    {
        let outcome = if ok { "ok" } else { "error" };
        counter!(
            client::RESPONSES_TOTAL,
            labels::METHOD => method.to_string(),
            labels::OUTCOME => outcome
        )
        .increment(1);
        histogram!(client::REQUEST_DURATION_SECONDS, labels::METHOD => method.to_string())
            .record(elapsed.as_secs_f64());
    }
    #[cfg(not(feature = "metrics"))]
    let _ = (method, ok, elapsed);
}

pub(crate) fn request_timed_out(method: &str) {
    #[cfg(feature = "metrics")]
    counter!(client::TIMEOUTS_TOTAL, labels::METHOD => method.to_string()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = method;
}

pub(crate) fn disconnect_rejections(count: usize) {
    #[cfg(feature = "metrics")]
    counter!(client::DISCONNECT_REJECTIONS_TOTAL).increment(count as u64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

pub(crate) fn unmatched_response() {
    #[cfg(feature = "metrics")]
    counter!(client::UNMATCHED_RESPONSES_TOTAL).increment(1);
}

pub(crate) fn pending_requests(count: usize) {
    #[cfg(feature = "metrics")]
    gauge!(client::PENDING_REQUESTS).set(count as f64);
    #[cfg(not(feature = "metrics"))]
    let _ = count;
}

pub(crate) fn reconnect_attempt() {
    #[cfg(feature = "metrics")]
    counter!(connection::RECONNECT_ATTEMPTS_TOTAL).increment(1);
}

pub(crate) fn epoch_started() {
    #[cfg(feature = "metrics")]
    counter!(connection::EPOCHS_TOTAL).increment(1);
}

pub(crate) fn degraded() {
    #[cfg(feature = "metrics")]
    counter!(connection::DEGRADED_TOTAL).increment(1);
}

pub(crate) fn decode_error() {
    #[cfg(feature = "metrics")]
    counter!(connection::DECODE_ERRORS_TOTAL).increment(1);
}

pub(crate) fn event_dispatched(event: &str) {
    #[cfg(feature = "metrics")]
    counter!(events::DISPATCHED_TOTAL, labels::EVENT => event.to_string()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = event;
}

pub(crate) fn handler_panicked(event: &str) {
    #[cfg(feature = "metrics")]
    counter!(events::HANDLER_PANICS_TOTAL, labels::EVENT => event.to_string()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = event;
}

pub(crate) fn seq_gap() {
    #[cfg(feature = "metrics")]
    counter!(events::SEQ_GAPS_TOTAL).increment(1);
}
