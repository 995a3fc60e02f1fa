//! Gateway metric definitions.
//!
//! Counters carry a `_total` suffix, duration histograms `_seconds`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Register every gateway metric with its description.
pub fn register_core_metrics() {
    // Sync
    describe_counter!(
        "cmon_sync_items_total",
        "Work items processed by the cache update worker (by source, outcome)"
    );
    describe_histogram!(
        "cmon_bootstrap_duration_seconds",
        "Time taken to page through the inventory"
    );
    describe_histogram!(
        "cmon_poll_duration_seconds",
        "Time taken by one host directory poll round"
    );
    describe_counter!("cmon_feed_signals_total", "Changefeed signals received (by kind)");

    // Cache
    describe_gauge!("cmon_cache_vms", "VMs currently cached");
    describe_gauge!("cmon_cache_owners", "Owners with at least one cached VM");
    describe_gauge!("cmon_cache_hosts", "Hosts with a resolved admin address");

    // Resolver
    describe_counter!(
        "cmon_resolver_failures_total",
        "Admin address resolutions that gave up (by reason)"
    );

    // Proxy
    describe_counter!(
        "cmon_proxy_requests_total",
        "Metrics requests routed (by target kind, outcome)"
    );
    describe_counter!(
        "cmon_proxy_host_evictions_total",
        "Hosts evicted after agent connection failures"
    );
}

/// Count one processed work item.
pub fn record_sync_item(source: &str, outcome: &str) {
    counter!(
        "cmon_sync_items_total",
        "source" => source.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_feed_signal(kind: &'static str) {
    counter!("cmon_feed_signals_total", "kind" => kind).increment(1);
}

pub fn record_bootstrap(duration_secs: f64) {
    histogram!("cmon_bootstrap_duration_seconds").record(duration_secs);
}

pub fn record_poll(duration_secs: f64) {
    histogram!("cmon_poll_duration_seconds").record(duration_secs);
}

pub fn set_cache_sizes(vms: usize, owners: usize) {
    gauge!("cmon_cache_vms").set(vms as f64);
    gauge!("cmon_cache_owners").set(owners as f64);
}

pub fn set_host_count(hosts: usize) {
    gauge!("cmon_cache_hosts").set(hosts as f64);
}

pub fn record_resolver_failure(reason: &'static str) {
    counter!("cmon_resolver_failures_total", "reason" => reason).increment(1);
}

pub fn record_proxy_request(target: &'static str, outcome: &'static str) {
    counter!("cmon_proxy_requests_total", "target" => target, "outcome" => outcome).increment(1);
}

pub fn record_host_eviction() {
    counter!("cmon_proxy_host_evictions_total").increment(1);
}
