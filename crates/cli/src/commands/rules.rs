//! Alert rule management

use anyhow::{Context, Result};
use std::path::Path;
use tabled::Tabled;

use crate::client::{ApiClient, Rule};
use crate::output::{color_severity, print_json, print_list, print_success, OutputFormat};

/// Row for rules table
#[derive(Tabled)]
struct RuleRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Condition")]
    condition: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "For")]
    for_secs: String,
    #[tabled(rename = "Sinks")]
    sinks: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
}

/// One-line summary of a rule condition
pub fn describe_condition(condition: &serde_json::Value) -> String {
    let get = |field: &str| condition.get(field).map(|v| v.to_string().trim_matches('"').to_string());
    match condition.get("type").and_then(|t| t.as_str()) {
        Some("threshold") => format!(
            "{} {} {}",
            get("field").unwrap_or_else(|| "value".to_string()),
            get("op").unwrap_or_default(),
            get("value").unwrap_or_default()
        ),
        Some("anomaly") => format!("score >= {}", get("min_score").unwrap_or_default()),
        _ => condition.to_string(),
    }
}

pub async fn list_rules(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let rules: Vec<Rule> = client.get("api/v1/rules").await?;

    print_list(
        &rules,
        |rules| {
            rules
                .iter()
                .map(|r| RuleRow {
                    id: r.id.clone(),
                    metric: r.target.metric.clone(),
                    condition: describe_condition(&r.condition),
                    severity: color_severity(&r.severity),
                    for_secs: format!("{}s", r.for_secs),
                    sinks: r.sinks.join(","),
                    enabled: if r.enabled { "✓".to_string() } else { String::new() },
                })
                .collect()
        },
        "No rules defined",
        format,
    )
}

pub async fn get_rule(client: &ApiClient, id: &str, format: OutputFormat) -> Result<()> {
    let rule: Rule = client.get(&format!("api/v1/rules/{}", id)).await?;

    match format {
        OutputFormat::Json => print_json(&rule)?,
        OutputFormat::Table => {
            println!("Rule:      {}", rule.id);
            if !rule.name.is_empty() {
                println!("Name:      {}", rule.name);
            }
            println!("Metric:    {}", rule.target.metric);
            println!("Condition: {}", describe_condition(&rule.condition));
            println!("Severity:  {}", color_severity(&rule.severity));
            println!("For:       {}s", rule.for_secs);
            println!("Cooldown:  {}s", rule.cooldown_secs);
            println!("Sinks:     {}", rule.sinks.join(", "));
            println!("Escalation steps: {}", rule.escalation.len());
        }
    }

    Ok(())
}

/// Read a rule object or an array of rules from a JSON file
pub fn read_rules_file(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))?;

    match value {
        serde_json::Value::Array(rules) => Ok(rules),
        rule @ serde_json::Value::Object(_) => Ok(vec![rule]),
        _ => anyhow::bail!("{} must contain a rule object or an array of rules", path.display()),
    }
}

/// Create or replace every rule in the file
pub async fn apply_rules(client: &ApiClient, path: &Path, format: OutputFormat) -> Result<()> {
    let rules = read_rules_file(path)?;
    let mut applied = Vec::with_capacity(rules.len());

    for rule in &rules {
        let saved: Rule = client.post("api/v1/rules", rule).await?;
        if format == OutputFormat::Table {
            print_success(&format!("Rule {} applied", saved.id));
        }
        applied.push(saved);
    }

    if format == OutputFormat::Json {
        print_json(&applied)?;
    }
    Ok(())
}

pub async fn delete_rule(client: &ApiClient, id: &str) -> Result<()> {
    client.delete(&format!("api/v1/rules/{}", id)).await?;
    print_success(&format!("Rule {} deleted", id));
    Ok(())
}
