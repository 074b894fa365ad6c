//! Metrics hooks.
//!
//! Counters are emitted as `tracing` events inside a span named after the
//! event; exporters belong in the binary layer.

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::DEBUG, "gpujoin", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::debug!(%event, %k, %v, "metric");
    }
}
