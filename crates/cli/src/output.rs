//! Output formatting utilities

use chrono::{TimeZone, Utc};
use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Parse a format name from the config file, ignoring case
    pub fn parse(value: &str) -> Option<Self> {
        <Self as ValueEnum>::from_str(value, true).ok()
    }
}

/// Print rows as a table, or the raw items as JSON
pub fn print_list<T: Serialize, R: Tabled>(
    items: &[T],
    rows: impl FnOnce(&[T]) -> Vec<R>,
    empty_message: &str,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => print_json(&items)?,
        OutputFormat::Table => {
            if items.is_empty() {
                print_warning(empty_message);
                return Ok(());
            }
            let table = Table::new(rows(items)).with(Style::rounded()).to_string();
            println!("{}", table);
            println!("\nTotal: {}", items.len());
        }
    }
    Ok(())
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format Unix milliseconds as a UTC timestamp
pub fn format_timestamp_ms(ms: i64) -> String {
    match Utc.timestamp_millis_opt(ms).single() {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ms.to_string(),
    }
}

pub fn format_optional_ms(ms: Option<i64>) -> String {
    ms.map(format_timestamp_ms).unwrap_or_else(|| "-".to_string())
}

/// Format a metric value with precision that fits its magnitude
pub fn format_value(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1000.0 {
        format!("{:.0}", value)
    } else if abs >= 1.0 {
        format!("{:.2}", value)
    } else {
        format!("{:.4}", value)
    }
}

/// Color alert state
pub fn color_state(state: &str) -> String {
    match state.to_lowercase().as_str() {
        "firing" => state.red().bold().to_string(),
        "pending" => state.yellow().to_string(),
        "acknowledged" => state.blue().to_string(),
        "resolved" => state.green().to_string(),
        "healthy" => state.green().to_string(),
        "degraded" => state.yellow().to_string(),
        "unhealthy" => state.red().to_string(),
        _ => state.to_string(),
    }
}

pub fn color_severity(severity: &str) -> String {
    match severity.to_lowercase().as_str() {
        "critical" => severity.red().bold().to_string(),
        "warning" => severity.yellow().to_string(),
        _ => severity.to_string(),
    }
}

/// Color a combined anomaly score
pub fn color_score(score: f64, is_anomaly: bool) -> String {
    let formatted = format!("{:.2}", score);
    if is_anomaly {
        formatted.red().bold().to_string()
    } else if score >= 0.4 {
        formatted.yellow().to_string()
    } else {
        formatted.green().to_string()
    }
}

/// Truncate ID for display
pub fn truncate_id(id: &str) -> String {
    if id.len() > 12 {
        format!("{}...", &id[..12])
    } else {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp_ms() {
        assert_eq!(format_timestamp_ms(0), "1970-01-01 00:00:00");
        assert_eq!(format_optional_ms(None), "-");
    }

    #[test]
    fn test_format_value_precision() {
        assert_eq!(format_value(12345.6), "12346");
        assert_eq!(format_value(3.14159), "3.14");
        assert_eq!(format_value(0.012345), "0.0123");
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(OutputFormat::parse("JSON"), Some(OutputFormat::Json));
        assert_eq!(OutputFormat::parse("table"), Some(OutputFormat::Table));
        assert_eq!(OutputFormat::parse("yaml"), None);
    }

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("short"), "short");
        assert_eq!(truncate_id("0123456789abcdef"), "0123456789ab...");
    }
}
