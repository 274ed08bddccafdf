//! Sample ingestion and query commands

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tabled::Tabled;

use crate::client::{Aggregate, AnomalyScore, ApiClient, IngestReport};
use crate::output::{
    color_score, format_timestamp_ms, format_value, print_info, print_json, print_list,
    print_success, print_warning, OutputFormat,
};

/// Row for aggregates table
#[derive(Tabled)]
struct AggregateRow {
    #[tabled(rename = "Series")]
    series: String,
    #[tabled(rename = "Start")]
    start: String,
    #[tabled(rename = "End")]
    end: String,
    #[tabled(rename = "Count")]
    count: String,
    #[tabled(rename = "Mean")]
    mean: String,
    #[tabled(rename = "Min")]
    min: String,
    #[tabled(rename = "Max")]
    max: String,
    #[tabled(rename = "P95")]
    p95: String,
    #[tabled(rename = "Slope/s")]
    slope: String,
}

/// Row for anomalies table
#[derive(Tabled)]
struct AnomalyRow {
    #[tabled(rename = "Time")]
    time: String,
    #[tabled(rename = "Series")]
    series: String,
    #[tabled(rename = "Source")]
    source: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Detectors")]
    detectors: String,
}

#[derive(Debug, Default, Serialize)]
pub struct AggregateFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Serialize)]
pub struct AnomalyFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flagged: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

/// Send a `{"samples": [...]}` file to the daemon
pub async fn ingest_file(client: &ApiClient, path: &Path, format: OutputFormat) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let batch: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))?;
    if batch.get("samples").map(|s| s.is_array()) != Some(true) {
        anyhow::bail!("{} must contain a \"samples\" array", path.display());
    }

    let report: IngestReport = client.post("api/v1/ingest", &batch).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_success(&format!("{} samples accepted", report.accepted));
            if report.rejected > 0 {
                print_warning(&format!("{} samples rejected", report.rejected));
                for error in &report.errors {
                    println!("  #{}: {}", error.index, error.reason);
                }
            }
            if report.dropped > 0 {
                print_warning(&format!(
                    "{} samples dropped under backpressure ({})",
                    report.dropped,
                    report.backpressure.as_deref().unwrap_or("unknown")
                ));
            }
        }
    }

    Ok(())
}

pub async fn list_aggregates(client: &ApiClient, filter: AggregateFilter, format: OutputFormat) -> Result<()> {
    let aggregates: Vec<Aggregate> = client.get_with_query("api/v1/aggregates", &filter).await?;

    print_list(
        &aggregates,
        |aggregates| {
            aggregates
                .iter()
                .map(|a| AggregateRow {
                    series: format!("{}{}", a.key, if a.degraded { " (degraded)" } else { "" }),
                    start: format_timestamp_ms(a.interval.start_ms),
                    end: format_timestamp_ms(a.interval.end_ms),
                    count: a.count.to_string(),
                    mean: format_value(a.mean),
                    min: format_value(a.min),
                    max: format_value(a.max),
                    p95: a
                        .percentiles
                        .as_ref()
                        .map(|p| format_value(p.p95))
                        .unwrap_or_else(|| "-".to_string()),
                    slope: format_value(a.trend_slope),
                })
                .collect()
        },
        "No aggregates found",
        format,
    )
}

pub async fn list_anomalies(client: &ApiClient, filter: AnomalyFilter, format: OutputFormat) -> Result<()> {
    let scores: Vec<AnomalyScore> = client.get_with_query("api/v1/anomalies", &filter).await?;

    print_list(
        &scores,
        |scores| {
            scores
                .iter()
                .map(|s| AnomalyRow {
                    time: format_timestamp_ms(s.timestamp_ms),
                    series: s.key.to_string(),
                    source: s.source.kind.clone(),
                    value: format_value(s.value),
                    score: color_score(s.combined, s.is_anomaly),
                    detectors: s
                        .detector_scores
                        .iter()
                        .map(|(name, score)| format!("{}={:.2}", name, score))
                        .collect::<Vec<_>>()
                        .join(" "),
                })
                .collect()
        },
        "No anomalies recorded",
        format,
    )
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Forecast {
    pub at_ms: i64,
    pub predicted: f64,
    pub slope: f64,
    pub r_squared: f64,
    pub based_on: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Correlation {
    pub coefficient: f64,
    pub aligned_windows: usize,
}

/// Linear projection of a series' window means
pub async fn forecast(client: &ApiClient, key: &str, horizon_secs: f64, format: OutputFormat) -> Result<()> {
    let query = [("key", key.to_string()), ("horizon_secs", horizon_secs.to_string())];
    let forecast: Forecast = client
        .get_with_query("api/v1/analysis/forecast", &query)
        .await?;

    match format {
        OutputFormat::Json => print_json(&forecast)?,
        OutputFormat::Table => {
            print_info(&format!(
                "{} at {}: {}",
                key,
                format_timestamp_ms(forecast.at_ms),
                format_value(forecast.predicted)
            ));
            println!(
                "Slope: {}/s  R²: {:.3}  Windows: {}",
                format_value(forecast.slope),
                forecast.r_squared,
                forecast.based_on
            );
        }
    }
    Ok(())
}

/// Pearson correlation between two series
pub async fn correlate(client: &ApiClient, a: &str, b: &str, format: OutputFormat) -> Result<()> {
    let query = [("a", a), ("b", b)];
    let correlation: Correlation = client
        .get_with_query("api/v1/analysis/correlation", &query)
        .await?;

    match format {
        OutputFormat::Json => print_json(&correlation)?,
        OutputFormat::Table => print_info(&format!(
            "r = {:.3} over {} aligned windows",
            correlation.coefficient, correlation.aligned_windows
        )),
    }
    Ok(())
}
