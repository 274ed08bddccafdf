//! HTTP API: ingestion, query, rule and alert management, health and metrics

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use pipeline_lib::{
    alerting::{Alert, AlertState, Rule, RuleError},
    anomaly::{correlate, forecast},
    export::{AggregateQuery, AnomalyQuery},
    health::{ComponentStatus, HealthRegistry},
    models::SampleBatch,
    observability::PipelineMetrics,
    proto, PipelineError, PipelineHandle,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tracing::{info, warn};

pub const PROTOBUF_CONTENT_TYPE: &str = "application/x-protobuf";

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: PipelineHandle,
    pub health_registry: HealthRegistry,
    pub metrics: PipelineMetrics,
}

impl AppState {
    pub fn new(pipeline: PipelineHandle, metrics: PipelineMetrics) -> Self {
        Self {
            health_registry: pipeline.health().clone(),
            pipeline,
            metrics,
        }
    }
}

/// Error body returned by every `/api/v1` endpoint
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::AlertNotFound(_) => ApiError::NotFound(message),
            PipelineError::Transition(_) => ApiError::Conflict(message),
            PipelineError::Config(_) => ApiError::BadRequest(message),
            PipelineError::PartitionUnavailable(_)
            | PipelineError::Backpressure(_)
            | PipelineError::Checkpoint(_) => ApiError::Unavailable(message),
        }
    }
}

impl From<RuleError> for ApiError {
    fn from(err: RuleError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Accepts `{"samples": [...]}` JSON or a protobuf `SampleBatch`
async fn ingest(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let is_protobuf = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with(PROTOBUF_CONTENT_TYPE))
        .unwrap_or(false);

    let batch = if is_protobuf {
        proto::decode_batch(&body).map_err(|e| {
            state.metrics.inc_dropped("decode");
            ApiError::BadRequest(e.to_string())
        })?
    } else {
        serde_json::from_slice::<SampleBatch>(&body).map_err(|e| {
            state.metrics.inc_dropped("decode");
            ApiError::BadRequest(format!("invalid batch: {}", e))
        })?
    };

    let report = state.pipeline.ingest(batch.samples).await;
    Ok(Json(report))
}

async fn list_aggregates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AggregateQuery>,
) -> impl IntoResponse {
    Json(state.pipeline.export().aggregates(&query))
}

async fn list_anomalies(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AnomalyQuery>,
) -> impl IntoResponse {
    Json(state.pipeline.export().anomalies(&query))
}

/// Live closed windows and flagged anomalies as server-sent events
async fn stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = BroadcastStream::new(state.pipeline.export().subscribe()).filter_map(|item| {
        match item {
            Ok(event) => Event::default().event(event.name()).json_data(&event).ok().map(Ok),
            Err(lagged) => {
                warn!(error = %lagged, "Stream subscriber lagged");
                None
            }
        }
    });
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn list_rules(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.pipeline.rules().list())
}

async fn get_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Rule>, ApiError> {
    state
        .pipeline
        .rules()
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("rule {} not found", id)))
}

async fn create_rule(
    State(state): State<Arc<AppState>>,
    Json(rule): Json<Rule>,
) -> Result<impl IntoResponse, ApiError> {
    let id = rule.id.clone();
    let status = match state.pipeline.rules().upsert(rule.clone())? {
        Some(_) => StatusCode::OK,
        None => StatusCode::CREATED,
    };
    info!(rule_id = %id, "Rule saved");
    Ok((status, Json(rule)))
}

async fn update_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(rule): Json<Rule>,
) -> Result<impl IntoResponse, ApiError> {
    if rule.id != id {
        return Err(ApiError::BadRequest(format!(
            "rule id {} does not match path {}",
            rule.id, id
        )));
    }
    create_rule(State(state), Json(rule)).await
}

async fn delete_rule(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.pipeline.rules().remove(&id) {
        Some(_) => {
            info!(rule_id = %id, "Rule deleted");
            Ok(StatusCode::NO_CONTENT)
        }
        None => Err(ApiError::NotFound(format!("rule {} not found", id))),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AlertsQuery {
    pub state: Option<AlertState>,
}

async fn list_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertsQuery>,
) -> impl IntoResponse {
    Json(state.pipeline.alerts().list(query.state))
}

async fn get_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Alert>, ApiError> {
    match state.pipeline.alerts().get(&id) {
        Some(alert) => Ok(Json(alert)),
        None => Err(PipelineError::AlertNotFound(id).into()),
    }
}

async fn acknowledge_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.acknowledge(&id).await?))
}

async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.pipeline.resolve(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CorrelationQuery {
    pub a: String,
    pub b: String,
}

async fn correlation(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CorrelationQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let export = state.pipeline.export();
    let a = export.history(&query.a);
    let b = export.history(&query.b);
    correlate(&a, &b).map(Json).ok_or_else(|| {
        ApiError::NotFound(format!(
            "not enough aligned windows for {} and {}",
            query.a, query.b
        ))
    })
}

#[derive(Debug, Deserialize)]
pub struct ForecastQuery {
    pub key: String,
    #[serde(default = "default_horizon_secs")]
    pub horizon_secs: f64,
}

fn default_horizon_secs() -> f64 {
    300.0
}

async fn forecast_key(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ForecastQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state.pipeline.export().history(&query.key);
    forecast(&history, query.horizon_secs)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("not enough history for {}", query.key)))
}

async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let pipeline = &state.pipeline;
    Json(json!({
        "partitions": pipeline.partitions(),
        "queue_depths": pipeline.queue_depths(),
        "rules": pipeline.rules().len(),
        "alerts": pipeline.alerts().len(),
        "windows_published": pipeline.export().published(),
        "keys": pipeline.export().keys().len(),
    }))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/ingest", post(ingest))
        .route("/api/v1/aggregates", get(list_aggregates))
        .route("/api/v1/anomalies", get(list_anomalies))
        .route("/api/v1/stream", get(stream))
        .route("/api/v1/rules", get(list_rules).post(create_rule))
        .route(
            "/api/v1/rules/:id",
            get(get_rule).put(update_rule).delete(delete_rule),
        )
        .route("/api/v1/alerts", get(list_alerts))
        .route("/api/v1/alerts/:id", get(get_alert))
        .route("/api/v1/alerts/:id/ack", post(acknowledge_alert))
        .route("/api/v1/alerts/:id/resolve", post(resolve_alert))
        .route("/api/v1/analysis/correlation", get(correlation))
        .route("/api/v1/analysis/forecast", get(forecast_key))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
