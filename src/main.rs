//! MonthSync - Month-Partitioned Embedded Database Replication
//!
//! Command line front end for a local set of month partitions.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use monthsync::api::MonthSync;
use monthsync::changelog::Value;
use monthsync::config::MonthSyncConfig;
use monthsync::partition::MonthKey;

/// MonthSync - Month-Partitioned Embedded Database Replication
#[derive(Parser)]
#[command(name = "monthsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "monthsync.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "monthsync.toml")]
        output: PathBuf,

        /// Partition root directory
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },

    /// Validate configuration file
    Validate,

    /// Run the replication loop until interrupted
    Serve,

    /// Execute a mutation on the primary
    Write {
        sql: String,
        /// Parameters as a JSON array
        #[arg(short, long)]
        params: Option<String>,
        /// Month partition (YYYY-MM), defaults to the current month
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Execute one statement per parameter tuple
    Batch {
        sql: String,
        /// Parameter tuples as a JSON array of arrays
        params: String,
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Run a read-only query on every node
    Query {
        sql: String,
        #[arg(short, long)]
        params: Option<String>,
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Show replication status of a month
    Status {
        #[arg(short, long)]
        month: Option<String>,
    },

    /// List months with partition files
    Months,

    /// List tables, or describe one
    Tables {
        /// Table to describe
        table: Option<String>,
        #[arg(short, long)]
        month: Option<String>,
    },

    /// Run one replication pass
    Sync {
        /// Only this month (default: every month)
        #[arg(short, long)]
        month: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Init { output, data_dir } = &cli.command {
        init_logging(cli.log_level.as_deref().unwrap_or("info"), "pretty");
        return run_init(output, data_dir);
    }

    let config = load_config(&cli.config)?;
    init_logging(
        cli.log_level.as_deref().unwrap_or(&config.logging.level),
        &config.logging.format,
    );

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Validate => run_validate(&config),
        Commands::Serve => run_serve(config).await,
        command => run_command(config, command).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<MonthSyncConfig> {
    if path.exists() {
        MonthSyncConfig::from_file(path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))
    } else {
        Ok(MonthSyncConfig::default())
    }
}

fn run_init(output: &Path, data_dir: &Path) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }

    let config = MonthSyncConfig::with_data_dir(data_dir);
    let content = format!(
        "# MonthSync Configuration\n# Generated configuration file\n\n{}",
        config.to_toml()?
    );
    std::fs::write(output, content)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("Configuration written to {}", output.display());
    Ok(())
}

fn run_validate(config: &MonthSyncConfig) -> anyhow::Result<()> {
    config.validate()?;
    println!("✓ Configuration is valid");
    println!("  Data dir: {}", config.data_dir().display());
    println!("  Nodes per month: {}", config.storage.node_count);
    println!("  Poll interval: {:?}", config.poll_interval());
    println!("  Query pool: {} (timeout {:?})", config.pool_size(), config.query_timeout());
    Ok(())
}

async fn run_serve(config: MonthSyncConfig) -> anyhow::Result<()> {
    let service = MonthSync::new(config)?;
    service.start_replication().await;
    tracing::info!("Replication running, press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl+C")?;

    let report = service.shutdown().await;
    tracing::info!(
        closed = report.closed,
        deferred = report.deferred,
        "Shutdown complete"
    );
    Ok(())
}

async fn run_command(config: MonthSyncConfig, command: Commands) -> anyhow::Result<()> {
    let service = MonthSync::new(config)?;

    let outcome = match command {
        Commands::Write { sql, params, month } => {
            let params = parse_params(params.as_deref())?;
            print_json(&service.write(month.as_deref(), &sql, params).await?)
        }
        Commands::Batch { sql, params, month } => {
            let tuples: Vec<Vec<Value>> =
                serde_json::from_str(&params).context("batch params must be a JSON array of arrays")?;
            print_json(&service.execute_batch(month.as_deref(), &sql, tuples).await?)
        }
        Commands::Query { sql, params, month } => {
            let params = parse_params(params.as_deref())?;
            print_json(&service.execute_concurrent_query(&sql, params, month.as_deref()).await?)
        }
        Commands::Status { month } => print_json(&service.get_sync_status(month.as_deref()).await?),
        Commands::Months => print_json(&service.available_months()?),
        Commands::Tables { table: Some(table), month } => {
            print_json(&service.table_schema(month.as_deref(), &table).await?)
        }
        Commands::Tables { table: None, month } => print_json(&service.list_tables(month.as_deref()).await?),
        Commands::Sync { month: Some(month) } => {
            let month = MonthKey::parse(&month)?;
            print_json(&service.coordinator().replicate_partition(&month).await?)
        }
        Commands::Sync { month: None } => print_json(&service.coordinator().replicate_once().await?),
        Commands::Init { .. } | Commands::Validate | Commands::Serve => Ok(()),
    };

    service.shutdown().await;
    outcome
}

fn parse_params(raw: Option<&str>) -> anyhow::Result<Vec<Value>> {
    match raw {
        Some(raw) => serde_json::from_str(raw).context("params must be a JSON array"),
        None => Ok(Vec::new()),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
