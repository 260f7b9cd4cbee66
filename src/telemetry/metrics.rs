//! Metrics recorded through the `metrics` facade.
//!
//! No exporter is installed here; the embedding application picks one.

use metrics::{counter, gauge};

pub fn record_dispatch() {
    counter!("fetch_scheduler_requests_dispatched_total").increment(1);
}

/// `outcome` is one of `ok`, `failed`, `aborted`, `network_failure`.
pub fn record_settlement(outcome: &'static str) {
    counter!("fetch_scheduler_requests_settled_total", "outcome" => outcome).increment(1);
}

pub fn record_aborts(count: usize) {
    counter!("fetch_scheduler_requests_aborted_total").increment(count as u64);
}

pub fn record_queue_depth(in_flight: usize, queued: usize) {
    gauge!("fetch_scheduler_requests_in_flight").set(in_flight as f64);
    gauge!("fetch_scheduler_requests_queued").set(queued as f64);
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("fetch_scheduler_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_slow_transition(slow: bool) {
    let state = if slow { "slow" } else { "recovered" };
    counter!("fetch_scheduler_slow_transitions_total", "state" => state).increment(1);
}
