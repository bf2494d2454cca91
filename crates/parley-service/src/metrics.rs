//! Service instrumentation.
//!
//! The exporter is installed by the server; without one these calls are
//! no-ops.

use metrics::counter;

/// Metric names.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "parley_cache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "parley_cache_misses_total";
    pub const BACKGROUND_FAILURES_TOTAL: &str = "parley_background_failures_total";
    pub const BACKGROUND_DROPPED_TOTAL: &str = "parley_background_dropped_total";
    pub const MESSAGES_STORED_TOTAL: &str = "parley_messages_stored_total";
    pub const EVENTS_PUBLISHED_TOTAL: &str = "parley_events_published_total";
    pub const PUSH_REQUESTS_TOTAL: &str = "parley_push_requests_total";
}

pub fn record_cache_hit(kind: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "kind" => kind).increment(1);
}

pub fn record_cache_miss(kind: &'static str) {
    counter!(names::CACHE_MISSES_TOTAL, "kind" => kind).increment(1);
}

/// A best-effort side effect failed and was swallowed.
pub fn record_background_failure(stage: &'static str) {
    counter!(names::BACKGROUND_FAILURES_TOTAL, "stage" => stage).increment(1);
}

pub fn record_background_dropped(task: &'static str) {
    counter!(names::BACKGROUND_DROPPED_TOTAL, "task" => task).increment(1);
}

pub fn record_message_stored(system: bool) {
    let kind = if system { "system" } else { "user" };
    counter!(names::MESSAGES_STORED_TOTAL, "kind" => kind).increment(1);
}

pub fn record_event(kind: &'static str, deliveries: usize) {
    counter!(names::EVENTS_PUBLISHED_TOTAL, "type" => kind).increment(1);
    if deliveries == 0 {
        tracing::trace!(kind, "event had no live subscribers");
    }
}

pub fn record_push() {
    counter!(names::PUSH_REQUESTS_TOTAL).increment(1);
}
