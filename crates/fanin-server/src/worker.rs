use std::{sync::Arc, time::Duration, time::Instant};

use axum::{
    Router,
    extract::{Query, Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
};
use fanin_metrics::MetricsRecorder;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

/// Longest artificial delay `/work` accepts.
const MAX_WORK: Duration = Duration::from_secs(10);

pub struct WorkerState {
    pub recorder: Arc<dyn MetricsRecorder>,
}

pub fn worker_router(state: Arc<WorkerState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/work", get(work))
        .route("/fail", get(fail))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            track_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn track_requests(
    State(state): State<Arc<WorkerState>>,
    request: Request,
    next: Next,
) -> Response {
    let started_at = Instant::now();
    let method = request.method().as_str().to_string();

    state.recorder.request_started().await;
    let response = next.run(request).await;
    let status = response.status().as_u16();
    state
        .recorder
        .request_finished(&method, status, started_at.elapsed())
        .await;

    response
}

async fn index() -> impl IntoResponse {
    "fanin demo worker\n"
}

#[derive(Debug, Deserialize)]
pub struct WorkQuery {
    #[serde(default)]
    ms: u64,
}

async fn work(Query(query): Query<WorkQuery>) -> impl IntoResponse {
    let delay = Duration::from_millis(query.ms).min(MAX_WORK);
    tokio::time::sleep(delay).await;
    (StatusCode::OK, format!("worked for {}ms\n", delay.as_millis()))
}

async fn fail() -> impl IntoResponse {
    (StatusCode::INTERNAL_SERVER_ERROR, "simulated failure\n")
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[derive(Default)]
    struct RecordingRecorder {
        events: Mutex<Vec<String>>,
    }

    impl RecordingRecorder {
        fn push(&self, event: String) {
            self.events.lock().expect("events lock").push(event);
        }
    }

    #[async_trait]
    impl MetricsRecorder for RecordingRecorder {
        async fn request_started(&self) {
            self.push("started".to_string());
        }

        async fn request_finished(&self, method: &str, status: u16, _duration: Duration) {
            self.push(format!("finished {method} {status}"));
        }

        async fn record_error(&self, method: &str, status: u16) {
            self.push(format!("error {method} {status}"));
        }

        async fn worker_started(&self) {}

        async fn worker_exiting(&self) {}
    }

    #[tokio::test]
    async fn middleware_reports_method_and_status() {
        let recorder = Arc::new(RecordingRecorder::default());
        let state = Arc::new(WorkerState {
            recorder: recorder.clone(),
        });

        let app_returning = |status: StatusCode| {
            Router::new()
                .route("/", get(move || async move { status }))
                .route_layer(middleware::from_fn_with_state(
                    Arc::clone(&state),
                    track_requests,
                ))
                .with_state(Arc::clone(&state))
        };

        for status in [StatusCode::OK, StatusCode::INTERNAL_SERVER_ERROR] {
            let app = app_returning(status);
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                .await
                .expect("bind");
            let addr = listener.local_addr().expect("addr");
            let server = tokio::spawn(async move {
                axum::serve(listener, app).await.expect("serve");
            });

            let mut stream = tokio::net::TcpStream::connect(addr).await.expect("connect");
            stream
                .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .expect("write");
            let mut reply = Vec::new();
            stream.read_to_end(&mut reply).await.expect("read");
            server.abort();
        }

        let events = recorder.events.lock().expect("events lock").clone();
        assert_eq!(
            events,
            vec![
                "started".to_string(),
                "finished GET 200".to_string(),
                "started".to_string(),
                "finished GET 500".to_string(),
            ]
        );
    }
}
