use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

/// Structured JSON logging, filtered by `RUST_LOG` (default `info`).
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();
}

/// Install the Prometheus recorder and register application metrics.
pub fn install_metrics() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe_metrics();
    Ok(handle)
}

pub fn describe_metrics() {
    metrics::describe_counter!("jobs_submitted_total", "Jobs accepted by the gateway");
    metrics::describe_counter!("jobs_completed_total", "Jobs completed by workers");
    metrics::describe_counter!("jobs_failed_total", "Jobs that ended in FAILED");
    metrics::describe_counter!("jobs_retried_total", "Attempts returned to the queue for retry");
    metrics::describe_counter!(
        "jobs_abandoned_total",
        "Deliveries handed back because another worker held the job"
    );
    metrics::describe_histogram!(
        "job_processing_seconds",
        "Wall-clock time of a successful processing attempt"
    );
    metrics::describe_gauge!("queue_visible", "Messages waiting in the queue");
    metrics::describe_gauge!("queue_in_flight", "Messages delivered but not acknowledged");
    metrics::describe_gauge!("pool_target_replicas", "Replica count requested by the controller");
    metrics::describe_gauge!("jobs_by_state", "Registry rows per job state");
}
