//! Command tests against a mocked daemon

use mockito::{Matcher, Server};
use serde_json::json;
use tempfile::TempDir;
use tpl_cli::client::{Alert, ApiClient, ApiError, IngestReport};
use tpl_cli::commands::{alerts, data, rules, status};
use tpl_cli::output::OutputFormat;

fn alert_body(state: &str) -> serde_json::Value {
    json!({
        "id": "abc123",
        "rule_id": "cpu-high",
        "key": {"metric": "cpu", "labels": {"host": "a"}},
        "state": state,
        "severity": "critical",
        "first_triggered_ms": 1_700_000_000_000i64,
        "last_notified_ms": null,
        "escalation_level": 0,
        "suppressed_until_ms": null,
        "acknowledged_until_ms": 1_700_000_360_000i64,
        "resolved_at_ms": null,
        "last_value": 95.0,
        "condition_active": true,
        "notification_deferred": false,
        "epoch": 1,
        "transitions": [
            {"from": "inactive", "to": "pending", "at_ms": 1_700_000_000_000i64, "reason": "condition met"}
        ]
    })
}

#[tokio::test]
async fn test_list_alerts_passes_state_filter() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v1/alerts")
        .match_query(Matcher::UrlEncoded("state".into(), "firing".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(json!([alert_body("firing")]).to_string())
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    alerts::list_alerts(&client, Some("firing".to_string()), OutputFormat::Table)
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_acknowledge_conflict_surfaces_api_error() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/alerts/abc123/ack")
        .with_status(409)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"alert abc123: transition acknowledged -> acknowledged is not allowed"}"#)
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let err = alerts::acknowledge_alert(&client, "abc123", OutputFormat::Json)
        .await
        .unwrap_err();
    let api = err.downcast_ref::<ApiError>().unwrap();
    assert_eq!(api.status, 409);
    assert!(api.message.contains("not allowed"));
}

#[tokio::test]
async fn test_resolve_alert_parses_response() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/alerts/abc123/resolve")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(alert_body("resolved").to_string())
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let alert: Alert = client
        .post("api/v1/alerts/abc123/resolve", &json!({}))
        .await
        .unwrap();
    assert_eq!(alert.state, "resolved");
    assert_eq!(alert.key.to_string(), "cpu{host=a}");
    assert_eq!(alert.transitions.len(), 1);
}

#[tokio::test]
async fn test_ingest_file_posts_batch() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/ingest")
        .match_body(Matcher::Regex(r#""name":"cpu""#.to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accepted":1,"rejected":0,"errors":[]}"#)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.json");
    std::fs::write(
        &path,
        json!({"samples": [{"timestamp_ms": 1_700_000_000_000i64, "name": "cpu", "value": 1.0}]}).to_string(),
    )
    .unwrap();

    let client = ApiClient::new(&server.url()).unwrap();
    data::ingest_file(&client, &path, OutputFormat::Table).await.unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_ingest_file_requires_samples_array() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("batch.json");
    std::fs::write(&path, r#"{"data": []}"#).unwrap();

    let client = ApiClient::new("http://127.0.0.1:1").unwrap();
    let err = data::ingest_file(&client, &path, OutputFormat::Table)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("samples"));
}

#[tokio::test]
async fn test_ingest_report_with_rejections() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/ingest")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accepted":2,"rejected":1,"errors":[{"index":2,"reason":"metric name is missing"}]}"#)
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let report: IngestReport = client
        .post("api/v1/ingest", &json!({"samples": []}))
        .await
        .unwrap();
    assert_eq!(report.rejected, 1);
    assert_eq!(report.errors[0].index, 2);
    assert_eq!(report.dropped, 0);
    assert!(report.backpressure.is_none());
}

#[tokio::test]
async fn test_ingest_report_with_backpressure_drops() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/api/v1/ingest")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"accepted":8,"rejected":0,"errors":[],"dropped":4,"backpressure":"stage partition-1 is closed"}"#)
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let report: IngestReport = client
        .post("api/v1/ingest", &json!({"samples": []}))
        .await
        .unwrap();
    assert_eq!(report.accepted, 8);
    assert_eq!(report.dropped, 4);
    assert_eq!(report.backpressure.as_deref(), Some("stage partition-1 is closed"));
}

#[tokio::test]
async fn test_apply_rules_from_array_file() {
    let mut server = Server::new_async().await;
    let rule = |id: &str| {
        json!({
            "id": id,
            "target": {"metric": "cpu"},
            "condition": {"type": "threshold", "field": "mean", "op": "gt", "value": 80.0},
            "severity": "warning",
            "sinks": ["log"],
            "enabled": true
        })
    };
    let mock = server
        .mock("POST", "/api/v1/rules")
        .with_status(201)
        .with_header("content-type", "application/json")
        .with_body(rule("cpu-high").to_string())
        .expect(2)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("rules.json");
    std::fs::write(&path, json!([rule("cpu-high"), rule("cpu-higher")]).to_string()).unwrap();

    let client = ApiClient::new(&server.url()).unwrap();
    rules::apply_rules(&client, &path, OutputFormat::Json).await.unwrap();
    mock.assert_async().await;
}

#[test]
fn test_read_rules_file_accepts_object_or_array() {
    let dir = TempDir::new().unwrap();
    let object = dir.path().join("one.json");
    std::fs::write(&object, r#"{"id": "a"}"#).unwrap();
    assert_eq!(rules::read_rules_file(&object).unwrap().len(), 1);

    let scalar = dir.path().join("bad.json");
    std::fs::write(&scalar, "42").unwrap();
    assert!(rules::read_rules_file(&scalar).is_err());
}

#[test]
fn test_describe_condition() {
    let threshold = json!({"type": "threshold", "field": "p99", "op": "gt", "value": 300.0});
    assert_eq!(rules::describe_condition(&threshold), "p99 gt 300.0");

    let anomaly = json!({"type": "anomaly", "min_score": 0.7});
    assert_eq!(rules::describe_condition(&anomaly), "score >= 0.7");
}

#[tokio::test]
async fn test_delete_missing_rule_is_not_found() {
    let mut server = Server::new_async().await;
    server
        .mock("DELETE", "/api/v1/rules/nope")
        .with_status(404)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"rule nope not found"}"#)
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let err = rules::delete_rule(&client, "nope").await.unwrap_err();
    assert_eq!(err.downcast_ref::<ApiError>().unwrap().status, 404);
}

#[tokio::test]
async fn test_status_tolerates_unhealthy_daemon() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/api/v1/status")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"partitions":4,"queue_depths":[0,0,1,0],"rules":2,"alerts":1,"windows_published":10,"keys":3}"#,
        )
        .create_async()
        .await;
    server
        .mock("GET", "/healthz")
        .with_status(503)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"status":"unhealthy","components":{"partitions":{"status":"unhealthy","message":"partition 2 exhausted restarts","last_check_timestamp":0}}}"#,
        )
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    status::show_status(&client, OutputFormat::Table).await.unwrap();
}

#[tokio::test]
async fn test_aggregates_query_parameters() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/api/v1/aggregates")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("metric".into(), "cpu".into()),
            Matcher::UrlEncoded("limit".into(), "5".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!([{
                "window_id": "sliding|cpu{host=a}|0|10000",
                "key": {"metric": "cpu", "labels": {"host": "a"}},
                "kind": "sliding",
                "interval": {"start_ms": 0, "end_ms": 10000},
                "count": 10,
                "mean": 50.0,
                "min": 40.0,
                "max": 60.0,
                "stddev": 5.0,
                "percentiles": {"p50": 50.0, "p75": 55.0, "p95": 59.0, "p99": 60.0},
                "trend_slope": 0.5,
                "degraded": false
            }])
            .to_string(),
        )
        .create_async()
        .await;

    let client = ApiClient::new(&server.url()).unwrap();
    let filter = data::AggregateFilter {
        metric: Some("cpu".to_string()),
        key: None,
        limit: Some(5),
    };
    data::list_aggregates(&client, filter, OutputFormat::Table).await.unwrap();
    mock.assert_async().await;
}
