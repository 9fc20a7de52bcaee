//! Routing-path telemetry instruments and recording helpers.

use super::Tier;
use opentelemetry::global;
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::KeyValue;
use std::sync::OnceLock;
use std::time::Duration;

struct RoutingInstruments {
    requests: Counter<u64>,
    request_duration_seconds: Histogram<f64>,
    attempts_per_request: Histogram<u64>,
    tier_selections: Counter<u64>,
    dispatch_failures: Counter<u64>,
    backoff_seconds: Histogram<f64>,
    cache_lookups: Counter<u64>,
    cache_pruned: Counter<u64>,
    late_replies_discarded: Counter<u64>,
}

fn instruments() -> &'static RoutingInstruments {
    static INSTRUMENTS: OnceLock<RoutingInstruments> = OnceLock::new();
    INSTRUMENTS.get_or_init(|| {
        let meter = global::meter("replica_router.routing");
        RoutingInstruments {
            requests: meter
                .u64_counter("replica_router.requests")
                .with_description("Routed requests by terminal outcome")
                .init(),
            request_duration_seconds: meter
                .f64_histogram("replica_router.request.duration")
                .with_description("Time from submit to terminal outcome")
                .with_unit("s")
                .init(),
            attempts_per_request: meter
                .u64_histogram("replica_router.request.attempts")
                .with_description("Dispatch attempts per routed request")
                .init(),
            tier_selections: meter
                .u64_counter("replica_router.tier.selections")
                .with_description("Replica selections by tier")
                .init(),
            dispatch_failures: meter
                .u64_counter("replica_router.dispatch.failures")
                .with_description("Recoverable dispatch failures by class")
                .init(),
            backoff_seconds: meter
                .f64_histogram("replica_router.backoff")
                .with_description("Backoff delays before retrying selection")
                .with_unit("s")
                .init(),
            cache_lookups: meter
                .u64_counter("replica_router.queue_len_cache.lookups")
                .with_description("Queue-length lookups for chosen replicas by result")
                .init(),
            cache_pruned: meter
                .u64_counter("replica_router.queue_len_cache.pruned")
                .with_description("Entries removed for replicas that left the active set")
                .init(),
            late_replies_discarded: meter
                .u64_counter("replica_router.late_replies_discarded")
                .with_description("Replies that arrived after their attempt was abandoned")
                .init(),
        }
    })
}

pub fn record_outcome(outcome: &'static str, error_class: Option<&'static str>, attempts: u32, elapsed: Duration) {
    let i = instruments();
    let mut attrs = vec![KeyValue::new("outcome", outcome)];
    if let Some(error_class) = error_class {
        attrs.push(KeyValue::new("error.class", error_class));
    }

    i.requests.add(1, &attrs);
    i.request_duration_seconds.record(elapsed.as_secs_f64(), &attrs);
    i.attempts_per_request.record(u64::from(attempts), &attrs);
}

pub fn record_selection(tier: Tier, queue_len: Option<u32>) {
    let i = instruments();
    i.tier_selections
        .add(1, &[KeyValue::new("tier", tier.as_str())]);
    let result = if queue_len.is_some() { "hit" } else { "miss" };
    i.cache_lookups.add(1, &[KeyValue::new("result", result)]);
}

pub fn record_dispatch_failure(error_class: &'static str) {
    instruments()
        .dispatch_failures
        .add(1, &[KeyValue::new("error.class", error_class)]);
}

pub fn record_backoff(delay: Duration) {
    instruments().backoff_seconds.record(delay.as_secs_f64(), &[]);
}

pub fn record_pruned(removed: usize) {
    if removed > 0 {
        instruments().cache_pruned.add(removed as u64, &[]);
    }
}

pub fn record_late_reply_discarded() {
    instruments().late_replies_discarded.add(1, &[]);
}
