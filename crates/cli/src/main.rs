//! Telemetry pipeline CLI
//!
//! A command-line tool for pushing samples, managing alert rules,
//! handling alerts and inspecting aggregates and anomalies.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tpl_cli::client::ApiClient;
use tpl_cli::commands::{alerts, data, rules, status};
use tpl_cli::config::Config;
use tpl_cli::output::{self, OutputFormat};

/// Telemetry pipeline CLI
#[derive(Parser)]
#[command(name = "tpl")]
#[command(author, version, about = "CLI for the telemetry pipeline", long_about = None)]
pub struct Cli {
    /// API endpoint URL (can also be set via TPL_API_URL env var)
    #[arg(long, env = "TPL_API_URL")]
    pub api_url: Option<String>,

    /// Output format
    #[arg(long, short)]
    pub format: Option<OutputFormat>,

    /// Enable verbose output
    #[arg(long, short)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Push a JSON sample batch file ({"samples": [...]})
    Ingest {
        /// Path to the batch file
        file: PathBuf,
    },

    /// Manage alert rules
    #[command(subcommand)]
    Rules(RulesCommands),

    /// Inspect and act on alerts
    #[command(subcommand)]
    Alerts(AlertsCommands),

    /// Show closed-window aggregates
    Aggregates {
        /// Filter by metric name
        #[arg(long, short)]
        metric: Option<String>,

        /// Filter by canonical series key
        #[arg(long, short)]
        key: Option<String>,

        /// Show at most this many windows
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Show anomaly scores
    Anomalies {
        /// Filter by metric name
        #[arg(long, short)]
        metric: Option<String>,

        /// Only scores above the ensemble threshold
        #[arg(long)]
        flagged: bool,

        /// Show at most this many scores
        #[arg(long, short)]
        limit: Option<usize>,
    },

    /// Trend and correlation analysis
    #[command(subcommand)]
    Analyze(AnalyzeCommands),

    /// Show daemon health and queue state
    Status,

    /// Manage CLI configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
pub enum RulesCommands {
    /// List rules
    List,

    /// Show one rule
    Get {
        /// Rule ID
        id: String,
    },

    /// Create or replace rules from a JSON file (object or array)
    Apply {
        /// Path to the rules file
        file: PathBuf,
    },

    /// Delete a rule
    Delete {
        /// Rule ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum AlertsCommands {
    /// List alerts
    List {
        /// Filter by state (inactive, pending, firing, acknowledged, resolved)
        #[arg(long, short)]
        state: Option<String>,
    },

    /// Show one alert with its transitions
    Get {
        /// Alert ID
        id: String,
    },

    /// Acknowledge a firing alert
    Ack {
        /// Alert ID
        id: String,
    },

    /// Resolve an active alert
    Resolve {
        /// Alert ID
        id: String,
    },
}

#[derive(Subcommand)]
pub enum AnalyzeCommands {
    /// Project a series' window means forward
    Forecast {
        /// Canonical series key
        key: String,

        /// Seconds past the latest window
        #[arg(long, default_value_t = 300.0)]
        horizon_secs: f64,
    },

    /// Correlate the window means of two series
    Correlate {
        /// First canonical series key
        a: String,

        /// Second canonical series key
        b: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Persist the API URL
    SetUrl {
        /// API endpoint URL
        url: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let verbose = cli.verbose;

    if let Err(e) = run(cli).await {
        if verbose {
            output::print_error(&format!("{:?}", e));
        } else {
            output::print_error(&format!("{:#}", e));
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load()?;
    let format = cli
        .format
        .or_else(|| config.default_format.as_deref().and_then(OutputFormat::parse))
        .unwrap_or_default();
    let api_url = config.resolve_api_url(cli.api_url.clone());

    if let Commands::Config(config_cmd) = &cli.command {
        match config_cmd {
            ConfigCommands::Show => {
                output::print_json(&config)?;
                output::print_info(&format!("Effective API URL: {}", api_url));
            }
            ConfigCommands::SetUrl { url } => {
                url::Url::parse(url).map_err(|e| anyhow::anyhow!("Invalid API URL {}: {}", url, e))?;
                config.api_url = Some(url.clone());
                config.save()?;
                output::print_success(&format!("API URL set to {}", url));
            }
        }
        return Ok(());
    }

    // Initialize client
    let client = ApiClient::new(&api_url)?;
    if cli.verbose {
        output::print_info(&format!("Using API at {}", api_url));
    }

    // Execute command
    match cli.command {
        Commands::Ingest { file } => data::ingest_file(&client, &file, format).await?,
        Commands::Rules(rules_cmd) => match rules_cmd {
            RulesCommands::List => rules::list_rules(&client, format).await?,
            RulesCommands::Get { id } => rules::get_rule(&client, &id, format).await?,
            RulesCommands::Apply { file } => rules::apply_rules(&client, &file, format).await?,
            RulesCommands::Delete { id } => rules::delete_rule(&client, &id).await?,
        },
        Commands::Alerts(alerts_cmd) => match alerts_cmd {
            AlertsCommands::List { state } => alerts::list_alerts(&client, state, format).await?,
            AlertsCommands::Get { id } => alerts::get_alert(&client, &id, format).await?,
            AlertsCommands::Ack { id } => alerts::acknowledge_alert(&client, &id, format).await?,
            AlertsCommands::Resolve { id } => alerts::resolve_alert(&client, &id, format).await?,
        },
        Commands::Aggregates { metric, key, limit } => {
            let filter = data::AggregateFilter { metric, key, limit };
            data::list_aggregates(&client, filter, format).await?;
        }
        Commands::Anomalies {
            metric,
            flagged,
            limit,
        } => {
            let filter = data::AnomalyFilter {
                metric,
                flagged: flagged.then_some(true),
                limit,
            };
            data::list_anomalies(&client, filter, format).await?;
        }
        Commands::Analyze(analyze_cmd) => match analyze_cmd {
            AnalyzeCommands::Forecast { key, horizon_secs } => {
                data::forecast(&client, &key, horizon_secs, format).await?;
            }
            AnalyzeCommands::Correlate { a, b } => data::correlate(&client, &a, &b, format).await?,
        },
        Commands::Status => status::show_status(&client, format).await?,
        Commands::Config(_) => {}
    }

    Ok(())
}
