//! Client metrics, emitted through the `metrics` facade. The host picks
//! the recorder/exporter.

use std::sync::LazyLock;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(|| {
    describe_counter!(
        "connection_state_change",
        "Connection lifecycle transitions, tagged by the new state",
    );

    describe_gauge!("subscription_count", "Number of registered subscriptions");

    describe_histogram!(
        "command",
        "Command round-trip latency in milliseconds, tagged by method and result",
    );

    describe_counter!("message_received", "Inbound transport frames");

    describe_counter!(
        "push_received",
        "Server pushes routed to subscriptions, tagged by push type",
    );

    describe_counter!("websocket_error", "Transport-level errors");

    Metrics
});

pub struct Metrics;

impl Metrics {
    pub fn connection_state_change(&self, state: &str) {
        counter!("connection_state_change", "state" => state.to_string()).increment(1);
    }

    pub fn subscription_count(&self, count: usize) {
        gauge!("subscription_count").set(count as f64);
    }

    pub fn command(&self, method: &'static str, success: bool, elapsed_ms: f64) {
        let result = if success { "success" } else { "failure" };
        histogram!("command", "method" => method, "result" => result).record(elapsed_ms);
    }

    pub fn message_received(&self) {
        counter!("message_received").increment(1);
    }

    pub fn push_received(&self, push_type: &'static str) {
        counter!("push_received", "push_type" => push_type).increment(1);
    }

    pub fn websocket_error(&self) {
        counter!("websocket_error").increment(1);
    }
}
