//! Telemetry pipeline daemon
//!
//! Ingests metric samples over HTTP, aggregates them into windows, scores
//! them for anomalies and drives alert notifications.

use anyhow::{Context, Result};
use pipeline_lib::{
    alerting::{load_rules_file, RuleRegistry, RulesWatcher},
    health::HealthRegistry,
    observability::PipelineMetrics,
    Pipeline,
};
use std::sync::Arc;
use telemetry_pipeline::{api, config::PipelineSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting telemetry-pipeline");

    let settings = PipelineSettings::load()?;
    info!(
        instance = %settings.instance,
        partitions = settings.partitions,
        "Pipeline configured"
    );

    let rules = match &settings.rules_file {
        Some(path) => {
            let loaded = load_rules_file(path)
                .with_context(|| format!("Failed to load rules from {}", path.display()))?;
            info!(path = %path.display(), rules = loaded.len(), "Rules loaded");
            Arc::new(RuleRegistry::with_rules(loaded)?)
        }
        None => Arc::new(RuleRegistry::new()),
    };

    let sinks = settings.build_sinks()?;
    let health_registry = HealthRegistry::new();
    let metrics = PipelineMetrics::new();

    let pipeline = Pipeline::start(
        settings.pipeline_config(),
        Arc::clone(&rules),
        sinks,
        health_registry,
    )
    .await?;

    let watcher_cancel = CancellationToken::new();
    let watcher = match &settings.rules_file {
        Some(path) => Some(RulesWatcher::new(path.clone(), Arc::clone(&rules)).start(watcher_cancel.clone())?),
        None => None,
    };

    let app_state = Arc::new(api::AppState::new(pipeline.handle(), metrics));
    let api_handle = tokio::spawn(api::serve(settings.api_port, app_state));

    // Wait for shutdown signal or API failure
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => info!("API server stopped"),
                Ok(Err(e)) => error!(error = %e, "API server failed"),
                Err(e) => error!(error = %e, "API server task panicked"),
            }
        }
    }

    watcher_cancel.cancel();
    if let Some(watcher) = watcher {
        watcher.join().await;
    }

    let report = pipeline.shutdown("SIGINT received").await;
    let processed: u64 = report.partitions.iter().map(|s| s.processed).sum();
    info!(
        processed,
        delivered = report.dispatcher.delivered,
        failed = report.dispatcher.failed,
        "Shutdown complete"
    );

    Ok(())
}
