//! Daemon status overview

use anyhow::Result;
use colored::Colorize;

use crate::client::{ApiClient, ApiError, HealthResponse, PipelineStatus};
use crate::output::{color_state, print_error, print_json, OutputFormat};

/// Show health and queue state of the daemon
pub async fn show_status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: PipelineStatus = client.get("api/v1/status").await?;

    // An unhealthy daemon answers /healthz with 503
    let health = match client.get::<HealthResponse>("healthz").await {
        Ok(health) => Some(health),
        Err(e) => match e.downcast_ref::<ApiError>() {
            Some(api) if api.status == 503 => serde_json::from_str(&api.message).ok(),
            _ => return Err(e),
        },
    };

    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "status": status,
            "health": health,
        }))?,
        OutputFormat::Table => {
            match &health {
                Some(health) => {
                    println!("Health: {}", color_state(&health.status));
                    for (name, component) in &health.components {
                        let message = component.message.as_deref().unwrap_or("");
                        println!("  {:<12} {} {}", name, color_state(&component.status), message.dimmed());
                    }
                }
                None => print_error("Health: unavailable"),
            }
            println!();
            println!("Partitions:        {}", status.partitions);
            println!(
                "Queue depths:      {}",
                status
                    .queue_depths
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            );
            println!("Rules:             {}", status.rules);
            println!("Alerts:            {}", status.alerts);
            println!("Series:            {}", status.keys);
            println!("Windows published: {}", status.windows_published);
        }
    }

    Ok(())
}
