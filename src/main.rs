// ABOUTME: CLI entry point for collection-sync
// ABOUTME: Parses commands and routes to sync, decompose and watermark handlers

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use collection_sync::config::{PipelineConfig, SyncUnit};
use collection_sync::decompose::{decompose, DecomposeJob, DEFAULT_PACKED_FIELD};
use collection_sync::destination::PgDestination;
use collection_sync::source::MongoSource;
use collection_sync::watermark::{ConfiguredStore, WatermarkStore};
use collection_sync::{Pipeline, RunOptions};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "collection-sync")]
#[command(about = "Incremental MongoDB-to-PostgreSQL collection loader", long_about = None)]
#[command(version)]
struct Cli {
    /// Allow self-signed TLS certificates (insecure - use only for testing)
    #[arg(
        long = "allow-self-signed-certs",
        global = true,
        default_value_t = false
    )]
    allow_self_signed_certs: bool,
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run sync units defined in a pipeline config
    Sync {
        /// Path to the pipeline TOML file
        #[arg(long, default_value = "pipeline.toml")]
        config: PathBuf,
        /// Run only these units (repeatable, defaults to all)
        #[arg(long = "unit")]
        units: Vec<String>,
        /// Reset watermarks and reload from the configured start
        #[arg(long)]
        full_refresh: bool,
        /// Ignore configured units and replace-load every collection
        #[arg(long)]
        all_collections: bool,
    },
    /// Split a packed date-range field of a loaded table into two date columns
    Decompose {
        /// Target PostgreSQL connection string
        #[arg(long, env = "TARGET_URL")]
        target: String,
        /// Schema holding the tables
        #[arg(long, env = "DATASET")]
        dataset: String,
        #[arg(long, env = "INPUT_TABLE")]
        input_table: String,
        #[arg(long, env = "OUTPUT_TABLE")]
        output_table: String,
        /// Field holding the packed YYYYMMDD-YYYYMMDD value
        #[arg(long, default_value = DEFAULT_PACKED_FIELD)]
        field: String,
        #[arg(long, default_value = "start_date")]
        start_column: String,
        #[arg(long, default_value = "end_date")]
        end_column: String,
    },
    /// Inspect or reset persisted watermarks
    Watermark {
        #[command(subcommand)]
        action: WatermarkAction,
    },
}

#[derive(Subcommand)]
enum WatermarkAction {
    /// Print stored watermarks
    Show {
        #[arg(long, default_value = "pipeline.toml")]
        config: PathBuf,
        /// Only this unit
        #[arg(long)]
        unit: Option<String>,
    },
    /// Forget a unit's watermark so the next run starts from its initial value
    Reset {
        #[arg(long, default_value = "pipeline.toml")]
        config: PathBuf,
        #[arg(long)]
        unit: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    // 3. Default to "info" if neither are provided
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    collection_sync::postgres::connection::init_tls_policy(cli.allow_self_signed_certs);

    match cli.command {
        Commands::Sync {
            config,
            units,
            full_refresh,
            all_collections,
        } => run_sync(&config, &units, full_refresh, all_collections).await,
        Commands::Decompose {
            target,
            dataset,
            input_table,
            output_table,
            field,
            start_column,
            end_column,
        } => {
            let destination = PgDestination::connect(&target, &dataset).await?;
            let job = DecomposeJob::new(&input_table, &output_table)
                .with_packed_field(&field)
                .with_columns(&start_column, &end_column);
            let report = decompose(&destination, &job).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.succeeded() {
                bail!("Decomposing '{}' failed", input_table);
            }
            Ok(())
        }
        Commands::Watermark { action } => match action {
            WatermarkAction::Show { config, unit } => {
                let store = open_store(&config)?;
                let states = store.list().await?;
                let mut shown = 0;
                for state in states
                    .iter()
                    .filter(|s| unit.as_deref().map_or(true, |u| s.unit == u))
                {
                    println!(
                        "{}\t{}\tversion={}\trows={}\tupdated={}",
                        state.unit,
                        state.value,
                        state.version,
                        state.last_row_count,
                        state.updated_at.to_rfc3339()
                    );
                    shown += 1;
                }
                if shown == 0 {
                    println!("No watermarks stored");
                }
                Ok(())
            }
            WatermarkAction::Reset { config, unit } => {
                let store = open_store(&config)?;
                if store.remove(&unit).await? {
                    println!("Reset watermark for '{}'", unit);
                } else {
                    println!("No watermark stored for '{}'", unit);
                }
                Ok(())
            }
        },
    }
}

fn open_store(config_path: &Path) -> anyhow::Result<ConfiguredStore> {
    let config = PipelineConfig::load(config_path)?;
    ConfiguredStore::open(&config.state).context("Failed to open watermark store")
}

async fn run_sync(
    config_path: &Path,
    selected: &[String],
    full_refresh: bool,
    all_collections: bool,
) -> anyhow::Result<()> {
    let config = PipelineConfig::load(config_path)?;
    let store = ConfiguredStore::open(&config.state).context("Failed to open watermark store")?;
    let source = MongoSource::connect(&config.source.uri, &config.source.database).await?;
    let destination =
        PgDestination::connect(&config.destination.url, &config.destination.dataset).await?;
    let pipeline = Pipeline::new(source, destination, store, config.extract.clone());

    let units: Vec<SyncUnit> = if all_collections {
        pipeline.discover_units().await?
    } else if selected.is_empty() {
        config.units.clone()
    } else {
        selected
            .iter()
            .map(|name| {
                config
                    .unit(name)
                    .cloned()
                    .with_context(|| format!("Unknown unit '{}' in {}", name, config_path.display()))
            })
            .collect::<anyhow::Result<_>>()?
    };
    if units.is_empty() {
        bail!("No sync units to run");
    }

    let options = RunOptions { full_refresh };
    let summary = tokio::select! {
        summary = pipeline.run(&units, options) => summary,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Received shutdown signal; aborting run");
            bail!("Sync interrupted");
        }
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if !summary.all_succeeded() {
        bail!("{} of {} unit(s) failed", summary.failed, units.len());
    }
    Ok(())
}
