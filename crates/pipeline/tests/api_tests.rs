//! Integration tests for the pipeline API endpoints

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use pipeline_lib::{
    alerting::{
        Alert, Comparison, Condition, LogSink, NotificationSink, Rule, RuleRegistry, RuleTarget,
        Severity, ThresholdField,
    },
    health::{components, HealthRegistry},
    models::{MetricSample, PartitionKey, SampleBatch},
    observability::PipelineMetrics,
    pipeline::WorkerConfig,
    proto,
    window::{WindowConfig, WindowSpec},
    Pipeline, PipelineConfig,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use telemetry_pipeline::api::{create_router, AppState, PROTOBUF_CONTENT_TYPE};
use tower::ServiceExt;

fn cpu_rule() -> Rule {
    Rule {
        id: "cpu-high".to_string(),
        name: "HighCpu".to_string(),
        target: RuleTarget {
            metric: "cpu".to_string(),
            labels: Default::default(),
        },
        condition: Condition::Threshold {
            field: ThresholdField::Mean,
            op: Comparison::Gt,
            value: 50.0,
        },
        severity: Severity::Critical,
        for_secs: 0,
        cooldown_secs: 0,
        sinks: vec!["log".to_string()],
        escalation: Vec::new(),
        enabled: true,
    }
}

async fn setup_test_app() -> (Router, Pipeline) {
    let config = PipelineConfig {
        partitions: 2,
        worker: WorkerConfig {
            window: WindowConfig {
                default_spec: WindowSpec::Sliding {
                    size_ms: 10_000,
                    slide_ms: 10_000,
                },
                ..Default::default()
            },
            checkpoint: None,
            ..Default::default()
        },
        tick_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let rules = Arc::new(RuleRegistry::with_rules(vec![cpu_rule()]).unwrap());
    let sinks: Vec<Arc<dyn NotificationSink>> = vec![Arc::new(LogSink::new("log"))];
    let pipeline = Pipeline::start(config, rules, sinks, HealthRegistry::new())
        .await
        .unwrap();

    let state = Arc::new(AppState::new(pipeline.handle(), PipelineMetrics::new()));
    (create_router(state), pipeline)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, value)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(method: &str, uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn recent_base() -> i64 {
    (chrono::Utc::now().timestamp_millis() - 600_000) / 10_000 * 10_000
}

#[tokio::test]
async fn test_healthz_and_readyz_after_start() {
    let (app, pipeline) = setup_test_app().await;

    let (status, health) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");

    let (status, readiness) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded_and_503_when_unhealthy() {
    let (app, pipeline) = setup_test_app().await;
    let health = pipeline.handle().health().clone();

    health.set_degraded(components::DISPATCHER, "circuit open").await;
    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");

    health.set_unhealthy(components::PARTITIONS, "partition 1 exhausted restarts").await;
    let (status, body) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "unhealthy");

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_readyz_returns_503_after_shutdown() {
    let (app, pipeline) = setup_test_app().await;
    pipeline.shutdown("test").await;

    let (status, _) = send(&app, get("/readyz")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_pipeline_metrics() {
    let (app, pipeline) = setup_test_app().await;

    let response = app.clone().oneshot(get("/metrics")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("pipeline_samples_accepted_total"));

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_ingest_json_reports_rejected_samples() {
    let (app, pipeline) = setup_test_app().await;
    let base = recent_base();

    let batch = json!({
        "samples": [
            {"timestamp_ms": base, "name": "cpu", "value": 10.0, "labels": {"host": "a"}},
            {"timestamp_ms": base + 1000, "name": "cpu", "value": 12.0, "labels": {"host": "a"}},
            {"timestamp_ms": base + 2000, "name": "", "value": 1.0}
        ]
    });
    let (status, report) = send(&app, post_json("POST", "/api/v1/ingest", &batch)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["accepted"], 2);
    assert_eq!(report["rejected"], 1);
    assert_eq!(report["errors"][0]["index"], 2);

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_ingest_rejects_malformed_bodies() {
    let (app, pipeline) = setup_test_app().await;

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/ingest")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid batch"));

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/ingest")
        .header(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
        .body(Body::from(vec![0xff, 0xff, 0xff]))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_ingest_protobuf_batch() {
    let (app, pipeline) = setup_test_app().await;
    let base = recent_base();

    let batch = SampleBatch {
        samples: (0..5)
            .map(|i| MetricSample::new("mem", base + i * 1000, 512.0).with_label("host", "b"))
            .collect(),
    };
    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/ingest")
        .header(header::CONTENT_TYPE, PROTOBUF_CONTENT_TYPE)
        .body(Body::from(proto::encode_batch(&batch)))
        .unwrap();
    let (status, report) = send(&app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["accepted"], 5);
    assert_eq!(report["rejected"], 0);

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_rule_crud() {
    let (app, pipeline) = setup_test_app().await;

    let rule = json!({
        "id": "latency-high",
        "target": {"metric": "latency"},
        "condition": {"type": "threshold", "field": "p99", "op": "gt", "value": 300.0},
        "for_secs": 60,
        "sinks": ["log"]
    });
    let (status, created) = send(&app, post_json("POST", "/api/v1/rules", &rule)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["severity"], "warning");

    let (status, _) = send(&app, post_json("POST", "/api/v1/rules", &rule)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, fetched) = send(&app, get("/api/v1/rules/latency-high")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["for_secs"], 60);

    let (status, list) = send(&app, get("/api/v1/rules")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(list.as_array().unwrap().len(), 2);

    let (status, _) = send(&app, post_json("PUT", "/api/v1/rules/other-id", &rule)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mut no_sinks = rule.clone();
    no_sinks["sinks"] = json!([]);
    let (status, body) = send(&app, post_json("PUT", "/api/v1/rules/latency-high", &no_sinks)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("sink"));

    let delete = Request::builder()
        .method("DELETE")
        .uri("/api/v1/rules/latency-high")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, delete).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, get("/api/v1/rules/latency-high")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_alert_lifecycle_over_http() {
    let (app, pipeline) = setup_test_app().await;
    let handle = pipeline.handle();
    let base = recent_base();

    let samples: Vec<Value> = (0..60)
        .map(|i| json!({"timestamp_ms": base + i * 1000, "name": "cpu", "value": 95.0, "labels": {"host": "a"}}))
        .collect();
    let (status, _) = send(&app, post_json("POST", "/api/v1/ingest", &json!({ "samples": samples }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(handle.flush().await, 0);

    let key = PartitionKey::new("cpu", [("host".to_string(), "a".to_string())].into());
    let id = Alert::id_for("cpu-high", &key);
    let mut firing = false;
    for _ in 0..100 {
        let (status, alerts) = send(&app, get("/api/v1/alerts?state=firing")).await;
        assert_eq!(status, StatusCode::OK);
        if alerts.as_array().map(|a| !a.is_empty()).unwrap_or(false) {
            firing = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(firing);

    let (status, alert) = send(&app, get(&format!("/api/v1/alerts/{}", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(alert["rule_id"], "cpu-high");

    let (status, aggregates) = send(&app, get("/api/v1/aggregates?metric=cpu")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(!aggregates.as_array().unwrap().is_empty());

    let ack = |path: &str| {
        Request::builder()
            .method("POST")
            .uri(path)
            .body(Body::empty())
            .unwrap()
    };
    let (status, acked) = send(&app, ack(&format!("/api/v1/alerts/{}/ack", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(acked["state"], "acknowledged");

    let (status, _) = send(&app, ack(&format!("/api/v1/alerts/{}/ack", id))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, resolved) = send(&app, ack(&format!("/api/v1/alerts/{}/resolve", id))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(resolved["state"], "resolved");

    let (status, _) = send(&app, ack("/api/v1/alerts/unknown/ack")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_analysis_needs_history() {
    let (app, pipeline) = setup_test_app().await;

    let (status, body) = send(&app, get("/api/v1/analysis/forecast?key=missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("missing"));

    let (status, _) = send(&app, get("/api/v1/analysis/correlation?a=x&b=y")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, get("/api/v1/analysis/correlation?a=x")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    pipeline.shutdown("test").await;
}

#[tokio::test]
async fn test_status_summarizes_pipeline() {
    let (app, pipeline) = setup_test_app().await;

    let (status, body) = send(&app, get("/api/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["partitions"], 2);
    assert_eq!(body["rules"], 1);
    assert_eq!(body["queue_depths"].as_array().unwrap().len(), 2);

    pipeline.shutdown("test").await;
}
