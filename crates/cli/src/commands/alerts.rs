//! Alert inspection and operator actions

use anyhow::Result;
use serde::Serialize;
use tabled::Tabled;

use crate::client::{Alert, ApiClient};
use crate::output::{
    color_severity, color_state, format_optional_ms, format_timestamp_ms, format_value, print_json,
    print_list, print_success, truncate_id, OutputFormat,
};

/// Row for alerts table
#[derive(Tabled)]
struct AlertRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Rule")]
    rule: String,
    #[tabled(rename = "Series")]
    series: String,
    #[tabled(rename = "State")]
    state: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Level")]
    level: String,
    #[tabled(rename = "Last Value")]
    last_value: String,
    #[tabled(rename = "Since")]
    since: String,
}

#[derive(Serialize)]
struct StateQuery<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    state: Option<&'a str>,
}

/// List alerts, optionally filtered by state
pub async fn list_alerts(client: &ApiClient, state: Option<String>, format: OutputFormat) -> Result<()> {
    let query = StateQuery {
        state: state.as_deref(),
    };
    let alerts: Vec<Alert> = client.get_with_query("api/v1/alerts", &query).await?;

    print_list(
        &alerts,
        |alerts| {
            alerts
                .iter()
                .map(|a| AlertRow {
                    id: truncate_id(&a.id),
                    rule: a.rule_id.clone(),
                    series: a.key.to_string(),
                    state: color_state(&a.state),
                    severity: color_severity(&a.severity),
                    level: a.escalation_level.to_string(),
                    last_value: a.last_value.map(format_value).unwrap_or_else(|| "-".to_string()),
                    since: format_optional_ms(a.first_triggered_ms),
                })
                .collect()
        },
        "No alerts found",
        format,
    )
}

/// Show one alert with its transition history
pub async fn get_alert(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let alert: Alert = client.get(&format!("api/v1/alerts/{}", id)).await?;

    match format {
        OutputFormat::Json => print_json(&alert)?,
        OutputFormat::Table => {
            print_alert(&alert);
            if !alert.transitions.is_empty() {
                println!("\nTransitions:");
                for t in &alert.transitions {
                    println!(
                        "  {}  {} -> {}  {}",
                        format_timestamp_ms(t.at_ms),
                        t.from,
                        color_state(&t.to),
                        t.reason
                    );
                }
            }
        }
    }

    Ok(())
}

/// Acknowledge a firing alert
pub async fn acknowledge_alert(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let alert: Alert = client
        .post(&format!("api/v1/alerts/{}/ack", id), &serde_json::json!({}))
        .await?;

    match format {
        OutputFormat::Json => print_json(&alert)?,
        OutputFormat::Table => {
            print_success(&format!("Alert {} acknowledged", id));
            println!("Until: {}", format_optional_ms(alert.acknowledged_until_ms));
        }
    }

    Ok(())
}

/// Resolve an active alert
pub async fn resolve_alert(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let alert: Alert = client
        .post(&format!("api/v1/alerts/{}/resolve", id), &serde_json::json!({}))
        .await?;

    match format {
        OutputFormat::Json => print_json(&alert)?,
        OutputFormat::Table => {
            print_success(&format!("Alert {} resolved", id));
            if let Some(until) = alert.suppressed_until_ms {
                println!("Re-notification suppressed until {}", format_timestamp_ms(until));
            }
        }
    }

    Ok(())
}

fn print_alert(alert: &Alert) {
    println!("Alert:      {}", alert.id);
    println!("Rule:       {}", alert.rule_id);
    println!("Series:     {}", alert.key);
    println!("State:      {}", color_state(&alert.state));
    println!("Severity:   {}", color_severity(&alert.severity));
    println!("Escalation: level {}", alert.escalation_level);
    println!("Triggered:  {}", format_optional_ms(alert.first_triggered_ms));
    println!("Notified:   {}", format_optional_ms(alert.last_notified_ms));
    if let Some(value) = alert.last_value {
        println!("Last value: {}", format_value(value));
    }
}
