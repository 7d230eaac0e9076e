//! Diagnostic HTTP surface: health, the current forest as JSON, a live SSE
//! stream of forest changes, prometheus metrics, and the admission
//! validation endpoint for hierarchy edits.

use axum::{
    Router,
    extract::State as AxumState,
    http::StatusCode,
    response::{
        IntoResponse, Json, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, stream};
use serde::Serialize;
use std::convert::Infallible;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;

use crate::forest::{NamespaceView, SharedForest};
use crate::hierarchy::validator;
use crate::metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub forest: SharedForest,
    pub updates: broadcast::Sender<Vec<NamespaceView>>,
    pub metrics: Metrics,
}

#[derive(Serialize)]
struct HealthCheck {
    message: String,
    namespaces: usize,
}

pub async fn new_router(app_state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/state", get(state))
        .route("/state/stream", get(state_stream))
        .route("/metrics", get(metrics))
        .route("/validate", post(validate))
        .with_state(app_state)
}

async fn healthz(AxumState(app_state): AxumState<AppState>) -> Json<HealthCheck> {
    let forest = app_state.forest.lock().await;
    Json(HealthCheck {
        message: "ok".into(),
        namespaces: forest.names().len(),
    })
}

async fn state(AxumState(app_state): AxumState<AppState>) -> Json<Vec<NamespaceView>> {
    let forest = app_state.forest.lock().await;
    Json(forest.snapshot())
}

async fn metrics(AxumState(app_state): AxumState<AppState>) -> String {
    app_state.metrics.render()
}

async fn state_stream(
    AxumState(app_state): AxumState<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = app_state.updates.subscribe();

    let initial_state = {
        let forest = app_state.forest.lock().await;
        forest.snapshot()
    };
    let initial_json = serde_json::to_string(&initial_state).unwrap_or_else(|_| "[]".to_string());
    let initial_event = stream::once(async { Ok(Event::default().data(initial_json)) });

    let forest = app_state.forest.clone();
    let update_stream = async_stream::stream! {
        let mut rx = rx;
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => yield Ok(Event::default().data(json)),
                        Err(err) => {
                            tracing::warn!("failed to serialize forest snapshot: {}", err);
                            yield Ok(Event::default().data("{\"error\":\"serialization_failed\"}"));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("stream lagged by {} snapshots, sending current state", n);
                    let snapshot = {
                        let forest = forest.lock().await;
                        forest.snapshot()
                    };
                    match serde_json::to_string(&snapshot) {
                        Ok(json) => yield Ok(Event::default().data(json)),
                        Err(err) => {
                            tracing::warn!("failed to serialize current state after lag: {}", err);
                            yield Ok(Event::default().data("{\"error\":\"serialization_failed\"}"));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::error!("broadcast channel closed, ending SSE stream");
                    break;
                }
            }
        }
    };

    let combined_stream = initial_event.chain(update_stream);
    Sse::new(combined_stream).keep_alive(KeepAlive::default())
}

/// Admission review for hierarchy edits. Only the decision logic lives here;
/// TLS termination is expected in front of the process.
async fn validate(
    AxumState(app_state): AxumState<AppState>,
    Json(review): Json<serde_json::Value>,
) -> Response {
    let request = match review.get("request") {
        Some(r) => r,
        None => return (StatusCode::BAD_REQUEST, "not an AdmissionReview").into_response(),
    };
    let uid = request
        .get("uid")
        .and_then(|u| u.as_str())
        .unwrap_or_default()
        .to_string();
    let namespace = request
        .get("namespace")
        .and_then(|n| n.as_str())
        .unwrap_or_default()
        .to_string();
    let parent = request
        .pointer("/object/spec/parent")
        .and_then(|p| p.as_str())
        .map(String::from);

    let verdict = {
        let forest = app_state.forest.lock().await;
        validator::validate_parent_change(&forest, &namespace, parent.as_deref())
    };

    let response = match verdict {
        Ok(()) => serde_json::json!({ "uid": uid, "allowed": true }),
        Err(violation) => serde_json::json!({
            "uid": uid,
            "allowed": false,
            "status": { "message": violation.to_string() },
        }),
    };
    Json(serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": response,
    }))
    .into_response()
}
