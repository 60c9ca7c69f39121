use anyhow::Context;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Initialize Prometheus metrics exporter
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;

    init_metric_descriptions();

    Ok(handle)
}

/// Initialize metric descriptions (can be called multiple times safely)
fn init_metric_descriptions() {
    describe_counter!("tasks_published_total", "Tasks handed to the queue");
    describe_counter!("bytes_published_total", "Task body bytes handed to the queue");
    describe_counter!(
        "tasks_processed_total",
        "Tasks processed by the worker, by outcome"
    );
    describe_histogram!(
        "task_processing_duration_seconds",
        "Task handler duration in seconds"
    );
    describe_counter!("hits_received_total", "Hits accepted by the receiver buffer");
    describe_counter!("hits_closed_total", "Hits handed to the session closer");
    describe_counter!("sessions_closed_total", "Sessions handed to the session closer");
    describe_counter!("buckets_fired_total", "Timing wheel buckets fired");
    describe_counter!("protosessions_evicted_total", "Proto-sessions evicted by identifier conflicts");
    describe_counter!("evicted_hits_requeued_total", "Hits requeued from evicted proto-sessions");
    describe_counter!(
        "identifier_conflicts_total",
        "Hits rerouted to an existing proto-session owner"
    );
    describe_gauge!(
        "queue_poll_interval_seconds",
        "Current object store polling interval"
    );
    describe_counter!("pings_published_total", "Idle pings emitted by schedulers");
    describe_gauge!("sessionizer_info", "Version and build information");

    gauge!("sessionizer_info", "version" => env!("CARGO_PKG_VERSION")).set(1.0);
}

/// Record a publish through the monitoring publisher
pub fn record_publish(task_type: &str, body_len: usize) {
    counter!("tasks_published_total", "task_type" => task_type.to_string()).increment(1);
    counter!("bytes_published_total", "task_type" => task_type.to_string())
        .increment(body_len as u64);
}

/// Record a processed task
pub fn record_task_processed(task_type: &str, outcome: &str, duration: Duration) {
    counter!(
        "tasks_processed_total",
        "task_type" => task_type.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    histogram!(
        "task_processing_duration_seconds",
        "task_type" => task_type.to_string(),
    )
    .record(duration.as_secs_f64());
}

pub fn record_hits_received(count: usize) {
    counter!("hits_received_total").increment(count as u64);
}

pub fn record_sessions_closed(sessions: usize, hits: usize) {
    counter!("sessions_closed_total").increment(sessions as u64);
    counter!("hits_closed_total").increment(hits as u64);
}

pub fn record_bucket_fired() {
    counter!("buckets_fired_total").increment(1);
}

pub fn record_identifier_conflicts(identifier_type: &str, count: usize) {
    counter!(
        "identifier_conflicts_total",
        "identifier_type" => identifier_type.to_string(),
    )
    .increment(count as u64);
}

pub fn record_protosessions_evicted(count: usize, hits: usize) {
    counter!("protosessions_evicted_total").increment(count as u64);
    counter!("evicted_hits_requeued_total").increment(hits as u64);
}

pub fn record_poll_interval(backend: &str, interval: Duration) {
    gauge!("queue_poll_interval_seconds", "backend" => backend.to_string())
        .set(interval.as_secs_f64());
}

pub fn record_ping(scheduler: &str) {
    counter!("pings_published_total", "scheduler" => scheduler.to_string()).increment(1);
}
