//! Metric definitions for the gateway client.
//!
//! Everything records through the `metrics` facade, so recording is a no-op
//! until a recorder is installed. The `prometheus` feature adds
//! [`install_prometheus`] for an HTTP scrape endpoint.

pub use metrics::{counter, gauge, histogram};

/// Metric names. Kept in one place so dashboards and code agree.
pub mod definitions {
    pub mod client {
        pub const REQUESTS_TOTAL: &str = "gatelink_client_requests_total";
        pub const RESPONSES_TOTAL: &str = "gatelink_client_responses_total";
        pub const REQUEST_DURATION_SECONDS: &str = "gatelink_client_request_duration_seconds";
        pub const TIMEOUTS_TOTAL: &str = "gatelink_client_timeouts_total";
        pub const DISCONNECT_REJECTIONS_TOTAL: &str = "gatelink_client_disconnect_rejections_total";
        pub const UNMATCHED_RESPONSES_TOTAL: &str = "gatelink_client_unmatched_responses_total";
        pub const PENDING_REQUESTS: &str = "gatelink_client_pending_requests";
    }

    pub mod connection {
        pub const RECONNECT_ATTEMPTS_TOTAL: &str = "gatelink_connection_reconnect_attempts_total";
        pub const EPOCHS_TOTAL: &str = "gatelink_connection_epochs_total";
        pub const DEGRADED_TOTAL: &str = "gatelink_connection_degraded_total";
        pub const DECODE_ERRORS_TOTAL: &str = "gatelink_connection_decode_errors_total";
    }

    pub mod events {
        pub const DISPATCHED_TOTAL: &str = "gatelink_events_dispatched_total";
        pub const HANDLER_PANICS_TOTAL: &str = "gatelink_events_handler_panics_total";
        pub const SEQ_GAPS_TOTAL: &str = "gatelink_events_seq_gaps_total";
    }

    pub mod labels {
        pub const METHOD: &str = "method";
        pub const EVENT: &str = "event";
        pub const OUTCOME: &str = "outcome";
    }
}

/// Register descriptions with the installed recorder.
pub fn describe() {
    use {
        definitions::{client, connection, events},
        metrics::{Unit, describe_counter, describe_gauge, describe_histogram},
    };

    describe_counter!(client::REQUESTS_TOTAL, "Requests written to the gateway");
    describe_counter!(client::RESPONSES_TOTAL, "Responses matched to a pending request");
    describe_histogram!(
        client::REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Time from send to matched response"
    );
    describe_counter!(client::TIMEOUTS_TOTAL, "Requests rejected with TIMEOUT");
    describe_counter!(
        client::DISCONNECT_REJECTIONS_TOTAL,
        "Requests rejected with DISCONNECTED"
    );
    describe_counter!(
        client::UNMATCHED_RESPONSES_TOTAL,
        "Responses discarded because no request was pending"
    );
    describe_gauge!(client::PENDING_REQUESTS, "Requests awaiting a response");
    describe_counter!(
        connection::RECONNECT_ATTEMPTS_TOTAL,
        "Connection attempts after the first"
    );
    describe_counter!(connection::EPOCHS_TOTAL, "Successful handshakes");
    describe_counter!(
        connection::DEGRADED_TOTAL,
        "Transitions to degraded after missed heartbeats"
    );
    describe_counter!(connection::DECODE_ERRORS_TOTAL, "Inbound frames that failed to decode");
    describe_counter!(events::DISPATCHED_TOTAL, "Events delivered to the dispatcher");
    describe_counter!(events::HANDLER_PANICS_TOTAL, "Event handlers that panicked");
    describe_counter!(events::SEQ_GAPS_TOTAL, "Detected gaps in event sequence numbers");
}

/// Install a Prometheus recorder serving `/metrics` on `addr`.
#[cfg(feature = "prometheus")]
pub fn install_prometheus(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    describe();
    tracing::info!(%addr, "prometheus exporter listening");
    Ok(())
}
