use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use fanin_common::error::Result;
use fanin_common::time;
use fanin_common::types::GaugeMode;
use tracing::{debug, warn};

use crate::handle::ValueHandle;
use crate::registry::{Metric, MetricsRegistry};
use crate::types::DEFAULT_BUCKETS;

/// Instrumentation hooks a worker calls around its request handling.
///
/// Implementations never fail the caller: storage errors are logged and
/// dropped.
#[async_trait]
pub trait MetricsRecorder: Send + Sync {
    async fn request_started(&self);

    async fn request_finished(&self, method: &str, status: u16, duration: Duration);

    async fn record_error(&self, method: &str, status: u16);

    async fn worker_started(&self);

    /// Drops this process's contribution ahead of a graceful exit.
    async fn worker_exiting(&self);
}

pub struct WorkerMetrics {
    registry: Arc<MetricsRegistry>,
    requests_total: Arc<Metric>,
    request_duration_seconds: Arc<Metric>,
    errors_total: Arc<Metric>,
    requests_in_flight: Arc<Metric>,
    last_start_time: Arc<Metric>,
}

impl WorkerMetrics {
    pub fn register(registry: Arc<MetricsRegistry>) -> Result<Self> {
        let requests_total = registry.counter(
            "fanin_worker_requests_total",
            "Total number of requests handled by workers",
            &["method", "status"],
        )?;

        let request_duration_seconds = registry.histogram(
            "fanin_worker_request_duration_seconds",
            "Duration of worker requests in seconds",
            &["method", "status"],
            DEFAULT_BUCKETS,
        )?;

        let errors_total = registry.counter(
            "fanin_worker_errors_total",
            "Total number of worker requests that ended in a server error",
            &["method", "status"],
        )?;

        let requests_in_flight = registry.gauge(
            "fanin_worker_requests_in_flight",
            "Requests currently being handled by running workers",
            &[],
            GaugeMode::LiveSum,
        )?;

        let last_start_time = registry.gauge(
            "fanin_worker_last_start_time_seconds",
            "Unix time at which the most recent worker started",
            &[],
            GaugeMode::Max,
        )?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            errors_total,
            requests_in_flight,
            last_start_time,
        })
    }
}

/// Resolves the handle for `labels`, logging instead of failing.
fn series(metric: &Metric, labels: &[&str]) -> Option<ValueHandle> {
    metric
        .with_labels(labels)
        .inspect_err(|err| {
            warn!(
                metric = %metric.descriptor().name,
                kind = err.kind_label(),
                error = %err,
                "cannot resolve metric series"
            );
        })
        .ok()
}

#[async_trait]
impl MetricsRecorder for WorkerMetrics {
    async fn request_started(&self) {
        if let Some(handle) = series(&self.requests_in_flight, &[]) {
            let _ = handle.inc().await;
        }
    }

    async fn request_finished(&self, method: &str, status: u16, duration: Duration) {
        let status_value = status.to_string();
        let labels = [method, status_value.as_str()];

        if let Some(handle) = series(&self.requests_in_flight, &[]) {
            let _ = handle.decrement(1.0).await;
        }
        if let Some(handle) = series(&self.requests_total, &labels) {
            let _ = handle.inc().await;
        }
        if let Some(handle) = series(&self.request_duration_seconds, &labels) {
            let _ = handle.observe(duration.as_secs_f64()).await;
        }

        if status >= 500 {
            self.record_error(method, status).await;
        }
    }

    async fn record_error(&self, method: &str, status: u16) {
        let status_value = status.to_string();
        if let Some(handle) = series(&self.errors_total, &[method, &status_value]) {
            let _ = handle.inc().await;
        }
    }

    async fn worker_started(&self) {
        if let Some(handle) = series(&self.last_start_time, &[]) {
            let _ = handle.set(time::now_unix_seconds()).await;
        }
    }

    async fn worker_exiting(&self) {
        let store = self.registry.store();
        match store.release().await {
            Ok(removed) => debug!(
                backend = store.kind().as_str(),
                removed, "released worker metrics"
            ),
            Err(err) => warn!(
                backend = store.kind().as_str(),
                error = %err,
                "failed to release worker metrics"
            ),
        }
    }
}
