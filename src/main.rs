mod batches;
mod cascade;
mod ebay;
mod hsuf;
mod http;
mod idempotency;
mod llm;
mod metrics;
mod models;
mod supabase;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use batches::{BatchError, BatchRegistry};
use cascade::{CascadeError, RetryDisposition, config::CascadeConfig, executor::Collaborators};
use idempotency::{IdempotencyStore, Reservation};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, BatchCreated, BatchRequest, BatchView, ItemId, ProgressRecord};
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "hermes.api", "server crashed: {err:#}");
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let config = CascadeConfig::load()?;
    config.validate().map_err(|err| eyre::eyre!(err))?;
    info!(
        target = "hermes.api",
        stage1 = config.concurrency_limits.stage1,
        stage2 = config.concurrency_limits.stage2,
        stage3 = config.concurrency_limits.stage3,
        wave_delay_ms = config.wave_delay_ms,
        pricing_enabled = config.stage2_enabled,
        "cascade configured"
    );

    let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
    let state = AppState {
        batches: BatchRegistry::new(config, Collaborators::from_env()),
        idempotency: IdempotencyStore::from_env(),
        prometheus_handle,
    };

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "hermes.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app(state).into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    batches: BatchRegistry,
    idempotency: IdempotencyStore,
    prometheus_handle: PrometheusHandle,
}

fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/batches", post(create_batch))
        .route("/batches/{batch_id}", get(get_batch))
        .route("/batches/{batch_id}/cancel", post(cancel_batch))
        .route("/batches/{batch_id}/items/{item_id}", get(get_item))
        .route("/batches/{batch_id}/items/{item_id}/retry", post(retry_item))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "hermes-cascade",
    }))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    (
        [("Content-Type", "text/plain; version=0.0.4")],
        state.prometheus_handle.render(),
    )
        .into_response()
}

/// Submit a batch and start the cascade.
///
/// - Method: `POST`
/// - Path: `/batches`
/// - Body: `BatchRequest` (`items[]` with optional client ids, optional `config` overrides)
/// - Header: optional `Idempotency-Key`; a repeated key returns the original batch,
///   and `409` while the first request with that key is still submitting
/// - Response: `202` with `BatchCreated`
async fn create_batch(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BatchRequest>,
) -> Result<(StatusCode, Json<BatchCreated>), AppError> {
    crate::metrics::inc_requests("/batches");
    let key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    if let Some(key) = &key {
        match state.idempotency.reserve(key).await {
            Reservation::Acquired => {}
            Reservation::Replay(existing) => {
                info!(target = "hermes.api", batch_id = %existing.batch_id, "idempotent replay");
                return Ok((StatusCode::OK, Json(existing)));
            }
            Reservation::InFlight => return Err(AppError::IdempotencyInFlight),
        }
    }

    let created = match state.batches.submit(request).await {
        Ok(created) => created,
        Err(err) => {
            if let Some(key) = &key {
                state.idempotency.release(key).await;
            }
            return Err(err.into());
        }
    };
    if let Some(key) = &key {
        state.idempotency.complete(key, &created).await;
    }
    info!(
        target = "hermes.api",
        batch_id = %created.batch_id,
        items = created.item_ids.len(),
        "batch accepted"
    );
    Ok((StatusCode::ACCEPTED, Json(created)))
}

/// Progress of every item in a batch, in submission order.
async fn get_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchView>, AppError> {
    crate::metrics::inc_requests("/batches/{batch_id}");
    Ok(Json(state.batches.view(batch_id).await?))
}

async fn get_item(
    State(state): State<AppState>,
    Path((batch_id, item_id)): Path<(Uuid, ItemId)>,
) -> Result<Json<ProgressRecord>, AppError> {
    crate::metrics::inc_requests("/batches/{batch_id}/items/{item_id}");
    let orchestrator = state.batches.get(batch_id).await?;
    let record = orchestrator
        .get(item_id)
        .await
        .ok_or(CascadeError::UnknownItem(item_id))?;
    Ok(Json(record))
}

#[derive(Debug, Serialize)]
struct RetryResponse {
    item_id: ItemId,
    disposition: RetryDisposition,
}

/// Re-run an errored item from analysis. Finished items are left as they are.
async fn retry_item(
    State(state): State<AppState>,
    Path((batch_id, item_id)): Path<(Uuid, ItemId)>,
) -> Result<Json<RetryResponse>, AppError> {
    crate::metrics::inc_requests("/batches/{batch_id}/items/{item_id}/retry");
    let orchestrator = state.batches.get(batch_id).await?;
    let disposition = orchestrator.retry(item_id).await?;
    info!(
        target = "hermes.api",
        batch_id = %batch_id,
        item_id = %item_id,
        disposition = ?disposition,
        "retry requested"
    );
    Ok(Json(RetryResponse {
        item_id,
        disposition,
    }))
}

/// Stop launching new waves. In-flight calls still finish.
async fn cancel_batch(
    State(state): State<AppState>,
    Path(batch_id): Path<Uuid>,
) -> Result<Json<BatchView>, AppError> {
    crate::metrics::inc_requests("/batches/{batch_id}/cancel");
    state.batches.get(batch_id).await?.cancel().await;
    Ok(Json(state.batches.view(batch_id).await?))
}

#[derive(Debug)]
enum AppError {
    Batch(BatchError),
    IdempotencyInFlight,
}

impl From<BatchError> for AppError {
    fn from(value: BatchError) -> Self {
        Self::Batch(value)
    }
}

impl From<CascadeError> for AppError {
    fn from(value: CascadeError) -> Self {
        Self::Batch(BatchError::Cascade(value))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Batch(err) => {
                let (status, code) = match &err {
                    BatchError::UnknownBatch(_) => (StatusCode::NOT_FOUND, "unknown_batch"),
                    BatchError::InvalidPayload { .. } => (StatusCode::BAD_REQUEST, "invalid_payload"),
                    BatchError::Cascade(cascade) => match cascade {
                        CascadeError::UnknownItem(_) => (StatusCode::NOT_FOUND, "unknown_item"),
                        CascadeError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
                        CascadeError::Cancelled => (StatusCode::CONFLICT, "cancelled"),
                        CascadeError::DuplicateItem(_) => (StatusCode::CONFLICT, "duplicate_item"),
                        CascadeError::EmptyBatch => (StatusCode::BAD_REQUEST, "empty_batch"),
                        CascadeError::BatchTooLarge { .. } => {
                            (StatusCode::BAD_REQUEST, "batch_too_large")
                        }
                        CascadeError::InvalidConfig(_) => (StatusCode::BAD_REQUEST, "invalid_config"),
                        CascadeError::InvalidTransition { .. } => {
                            (StatusCode::INTERNAL_SERVER_ERROR, "invalid_transition")
                        }
                    },
                };
                let payload = ApiError {
                    error: code.to_string(),
                    detail: Some(err.to_string()),
                };
                (status, Json(payload)).into_response()
            }
            AppError::IdempotencyInFlight => {
                let payload = ApiError {
                    error: "idempotency_in_flight".into(),
                    detail: Some("a request with this Idempotency-Key is still being submitted".into()),
                };
                (StatusCode::CONFLICT, Json(payload)).into_response()
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use cascade::testing::{ScriptedAnalysis, ScriptedPersistence, ScriptedPricing, collaborators};
    use serde_json::Value;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state_with(analysis: ScriptedAnalysis) -> AppState {
        let config = CascadeConfig {
            wave_delay_ms: 1,
            ..CascadeConfig::default()
        };
        AppState {
            batches: BatchRegistry::new(
                config,
                collaborators(
                    analysis,
                    ScriptedPricing::default(),
                    ScriptedPersistence::default(),
                ),
            ),
            idempotency: IdempotencyStore::new(None, 60),
            prometheus_handle: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        call_with_headers(state, method, uri, body, &[]).await
    }

    async fn call_with_headers(
        state: &AppState,
        method: &str,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_idle(state: &AppState, batch_id: &str) {
        let id = Uuid::parse_str(batch_id).unwrap();
        let orchestrator = state.batches.get(id).await.unwrap();
        tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_idle())
            .await
            .unwrap();
    }

    fn batch_body() -> Value {
        json!({
            "items": [
                {"payload": {"sku": "MUG-1", "images": ["https://img.example.com/mug.jpg"]}},
                {"payload": {"sku": "MUG-2", "images": ["https://img.example.com/mug2.jpg"]}}
            ]
        })
    }

    #[tokio::test]
    async fn health_ok() {
        let state = state_with(ScriptedAnalysis::default());
        let (status, body) = call(&state, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn batch_lifecycle_over_http() {
        let state = state_with(ScriptedAnalysis::default());
        let (status, created) = call(&state, "POST", "/batches", Some(batch_body())).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let batch_id = created["batch_id"].as_str().unwrap().to_string();
        assert_eq!(created["item_ids"].as_array().unwrap().len(), 2);

        wait_idle(&state, &batch_id).await;
        let (status, view) = call(&state, "GET", &format!("/batches/{batch_id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["running"], false);
        let items = view["items"].as_array().unwrap();
        assert_eq!(items.len(), 2);
        for item in items {
            assert_eq!(item["stage"], json!({"state": "done"}));
            assert_eq!(item["progress"], 100);
            assert_eq!(item["stage_statuses"]["stage2"], "completed");
        }

        let item_id = created["item_ids"][0].as_str().unwrap();
        let (status, record) = call(
            &state,
            "GET",
            &format!("/batches/{batch_id}/items/{item_id}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["item_id"], item_id);
        assert_eq!(record["payload"]["sku"], "MUG-1");

        let (status, retried) = call(
            &state,
            "POST",
            &format!("/batches/{batch_id}/items/{item_id}/retry"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(retried["disposition"], "already_done");
    }

    #[tokio::test]
    async fn failed_item_can_be_retried_over_http() {
        let state = state_with(ScriptedAnalysis::default().fail_once_for("MUG-2", "vision timeout"));
        let (_, created) = call(&state, "POST", "/batches", Some(batch_body())).await;
        let batch_id = created["batch_id"].as_str().unwrap().to_string();
        let item_id = created["item_ids"][1].as_str().unwrap().to_string();
        wait_idle(&state, &batch_id).await;

        let uri = format!("/batches/{batch_id}/items/{item_id}");
        let (_, record) = call(&state, "GET", &uri, None).await;
        assert_eq!(record["stage"], json!({"state": "error"}));
        assert_eq!(record["last_error"], "vision timeout");

        let (status, retried) = call(&state, "POST", &format!("{uri}/retry"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(retried["disposition"], "requeued");

        wait_idle(&state, &batch_id).await;
        let (_, record) = call(&state, "GET", &uri, None).await;
        assert_eq!(record["stage"], json!({"state": "done"}));
        assert!(record.get("last_error").is_none());
    }

    #[tokio::test]
    async fn idempotency_key_replays_original_batch() {
        let state = state_with(ScriptedAnalysis::default());
        let headers = [("Idempotency-Key", "batch-42")];
        let (first_status, first) =
            call_with_headers(&state, "POST", "/batches", Some(batch_body()), &headers).await;
        let (second_status, second) =
            call_with_headers(&state, "POST", "/batches", Some(batch_body()), &headers).await;
        assert_eq!(first_status, StatusCode::ACCEPTED);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first["batch_id"], second["batch_id"]);
    }

    #[tokio::test]
    async fn idempotency_key_in_flight_conflicts_and_failed_submit_frees_it() {
        let state = state_with(ScriptedAnalysis::default());
        assert_eq!(state.idempotency.reserve("held").await, Reservation::Acquired);
        let (status, body) = call_with_headers(
            &state,
            "POST",
            "/batches",
            Some(batch_body()),
            &[("Idempotency-Key", "held")],
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "idempotency_in_flight");

        let headers = [("Idempotency-Key", "fresh")];
        let (status, _) = call_with_headers(
            &state,
            "POST",
            "/batches",
            Some(json!({"items": []})),
            &headers,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) =
            call_with_headers(&state, "POST", "/batches", Some(batch_body()), &headers).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let state = state_with(ScriptedAnalysis::default().with_latency(Duration::from_millis(300)));
        let (status, body) = call(&state, "POST", "/batches", Some(json!({"items": []}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "empty_batch");

        let unknown = Uuid::new_v4();
        let (status, body) = call(&state, "GET", &format!("/batches/{unknown}"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_batch");

        let (_, created) = call(&state, "POST", "/batches", Some(batch_body())).await;
        let batch_id = created["batch_id"].as_str().unwrap().to_string();
        let item_id = created["item_ids"][0].as_str().unwrap().to_string();

        let (status, body) = call(
            &state,
            "POST",
            &format!("/batches/{batch_id}/items/{item_id}/retry"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "invalid_state");

        let (status, body) = call(
            &state,
            "GET",
            &format!("/batches/{batch_id}/items/{unknown}"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "unknown_item");

        let (status, view) = call(&state, "POST", &format!("/batches/{batch_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["cancelled"], true);
        wait_idle(&state, &batch_id).await;

        let (status, body) = call(
            &state,
            "POST",
            &format!("/batches/{batch_id}/items/{item_id}/retry"),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "cancelled");
    }

    #[tokio::test]
    async fn metrics_renders_text() {
        let state = state_with(ScriptedAnalysis::default());
        let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let response = app(state).oneshot(request).await.unwrap();
        assert!(
            response.status() == StatusCode::OK || response.status() == StatusCode::UNAUTHORIZED
        );
    }
}
