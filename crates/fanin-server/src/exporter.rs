use std::{sync::Arc, time::Duration};

use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use fanin_metrics::{Collector, render::CONTENT_TYPE};
use fanin_storage::{MetricStore, ProcessTable, cleanup};
use serde::Serialize;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub struct ExporterState {
    pub collector: Collector,
    pub store: Arc<dyn MetricStore>,
}

pub fn exporter_router(state: Arc<ExporterState>) -> Router {
    Router::new()
        .route("/metrics", get(prometheus_metrics))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn prometheus_metrics(State(state): State<Arc<ExporterState>>) -> impl IntoResponse {
    let payload = state.collector.render().await;

    let mut response = Response::new(Body::from(payload));
    *response.status_mut() = StatusCode::OK;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE));

    response
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
    process: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

pub async fn health(State(state): State<Arc<ExporterState>>) -> impl IntoResponse {
    let backend = state.store.kind().as_str();
    let process = state.store.process().token();

    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok",
                backend,
                process,
                error: None,
            }),
        ),
        Err(err) => {
            warn!(backend, error = %err, "metrics backend failed health check");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "unavailable",
                    backend,
                    process,
                    error: Some(err.to_string()),
                }),
            )
        }
    }
}

/// Periodically reclaims what dead processes left behind.
pub fn spawn_reaper(
    store: Arc<dyn MetricStore>,
    processes: Arc<dyn ProcessTable>,
    every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let report = cleanup::reap_stale(store.as_ref(), processes.as_ref()).await;
            if report.reclaimed.is_empty() && report.failed == 0 {
                debug!(backend = store.kind().as_str(), "no dead process metrics to reclaim");
            } else {
                info!(
                    backend = store.kind().as_str(),
                    reclaimed = report.reclaimed.len(),
                    failed = report.failed,
                    "dead process sweep finished"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use fanin_common::types::{GaugeMode, ProcessRecord};
    use fanin_metrics::{CollectorConfig, MetricsRegistry};
    use fanin_storage::StaticProcessTable;
    use fanin_storage::file::FileStore;

    use super::*;

    #[tokio::test]
    async fn metrics_endpoint_renders_aggregated_text() {
        let dir = tempfile::tempdir().expect("tempdir");
        let worker = ProcessRecord::new(20, 5);
        let exporter = ProcessRecord::new(21, 5);

        let worker_store = FileStore::new(dir.path().to_path_buf(), worker)
            .await
            .expect("worker store");
        let registry = MetricsRegistry::new(Arc::new(worker_store));
        registry
            .gauge("queue_depth", "Pending jobs", &[], GaugeMode::Max)
            .expect("gauge")
            .with_labels(&[])
            .expect("handle")
            .set(4.0)
            .await
            .expect("set");

        let store: Arc<dyn MetricStore> = Arc::new(
            FileStore::new(dir.path().to_path_buf(), exporter)
                .await
                .expect("exporter store"),
        );
        let state = Arc::new(ExporterState {
            collector: Collector::new(
                vec![Arc::clone(&store)],
                Arc::new(StaticProcessTable::new([worker, exporter])),
                CollectorConfig::default(),
            ),
            store,
        });

        let response = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE),
            Some(&HeaderValue::from_static(CONTENT_TYPE))
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8(body.to_vec()).expect("utf8");
        assert!(text.contains("# TYPE queue_depth gauge\nqueue_depth 4\n"));
        assert!(text.contains("fanin_storage_up{backend=\"file\"} 1\n"));
    }

    #[tokio::test]
    async fn health_reports_an_unreachable_backend() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("metrics");
        let exporter = ProcessRecord::new(40, 1);
        let store: Arc<dyn MetricStore> = Arc::new(
            FileStore::new(root.clone(), exporter)
                .await
                .expect("exporter store"),
        );
        let state = Arc::new(ExporterState {
            collector: Collector::new(
                vec![Arc::clone(&store)],
                Arc::new(StaticProcessTable::new([exporter])),
                CollectorConfig::default(),
            ),
            store,
        });

        let response = health(State(Arc::clone(&state))).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        std::fs::remove_dir_all(&root).expect("remove dir");
        let response = health(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let payload: serde_json::Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(payload["status"], "unavailable");
        assert_eq!(payload["backend"], "file");
        assert!(payload["error"].as_str().is_some_and(|error| error.contains("unreachable")));
    }

    #[tokio::test]
    async fn reaper_reclaims_dead_regions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dead = ProcessRecord::new(30, 1);
        let exporter = ProcessRecord::new(31, 1);

        let dead_store = FileStore::new(dir.path().to_path_buf(), dead)
            .await
            .expect("dead store");
        MetricsRegistry::new(Arc::new(dead_store))
            .counter("jobs_total", "", &[])
            .expect("counter")
            .with_labels(&[])
            .expect("handle")
            .inc()
            .await
            .expect("inc");
        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 1);

        let store: Arc<dyn MetricStore> = Arc::new(
            FileStore::new(dir.path().to_path_buf(), exporter)
                .await
                .expect("exporter store"),
        );
        let reaper = spawn_reaper(
            store,
            Arc::new(StaticProcessTable::new([exporter])),
            Duration::from_millis(10),
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
        reaper.abort();

        assert_eq!(std::fs::read_dir(dir.path()).expect("read dir").count(), 0);
    }
}
