#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the property-tax roll ETL pipeline.
//!
//! Configuration is layered: built-in defaults, then the TOML file given
//! with `--config`, then `ETL_*` environment variables, then flags.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use taxroll_cli_utils::IndicatifProgress;
use taxroll_ingest::Orchestrator;
use taxroll_source::registry;
use taxroll_source_models::config::EtlConfig;

#[derive(Parser)]
#[command(name = "taxroll_ingest", about = "Property-tax roll ETL pipeline")]
struct Cli {
    /// TOML configuration file, applied on top of the defaults
    #[arg(long, global = true, env = "ETL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full pipeline
    Run {
        #[command(flatten)]
        selection: Selection,
        #[arg(long)]
        skip_download: bool,
        #[arg(long)]
        skip_extract: bool,
        #[arg(long)]
        skip_transform: bool,
        #[arg(long)]
        skip_load: bool,
        /// Transform without writing to the database
        #[arg(long)]
        dry_run: bool,
        /// Abort at the first failed stage
        #[arg(long)]
        no_continue_on_error: bool,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the source catalog
    Sources,
    /// Download source archives only
    Download {
        #[command(flatten)]
        selection: Selection,
    },
    /// Extract already-downloaded archives only
    Extract {
        #[command(flatten)]
        selection: Selection,
    },
    /// Attach child rows loaded before their property
    LinkOrphans,
    /// Delete superseded child rows left behind by append runs
    Purge,
    /// Print total and active row counts per table
    Counts,
}

/// Which sources and which roll year to process.
#[derive(Args)]
struct Selection {
    /// Roll year (e.g., 2024)
    #[arg(long)]
    year: Option<i32>,
    /// Source name to process; repeatable. Defaults to every required source
    #[arg(long = "source")]
    sources: Vec<String>,
    /// Include optional sources
    #[arg(long)]
    all: bool,
}

impl Selection {
    fn apply(self, config: &mut EtlConfig) {
        if let Some(year) = self.year {
            config.data_year = year;
        }
        if !self.sources.is_empty() {
            config.source_filter = self.sources;
        }
        config.include_optional |= self.all;
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<EtlConfig, Box<dyn std::error::Error>> {
    let mut config = match path {
        Some(path) => {
            log::info!("Loading configuration from {}", path.display());
            EtlConfig::from_file(path)?
        }
        None => EtlConfig::default(),
    };
    config.apply_env()?;
    Ok(config)
}

#[cfg(feature = "duckdb")]
fn open_store(
    config: &EtlConfig,
) -> Result<taxroll_database::duckdb_store::DuckDbStore, taxroll_database::DbError> {
    log::info!("Using database {}", config.database_path.display());
    taxroll_database::duckdb_store::DuckDbStore::open(&config.database_path)
}

#[cfg(not(feature = "duckdb"))]
#[allow(clippy::unnecessary_wraps)]
fn open_store(
    config: &EtlConfig,
) -> Result<taxroll_database::memory::MemoryStore, taxroll_database::DbError> {
    log::warn!(
        "Built without the duckdb feature; loading into memory instead of {}",
        config.database_path.display()
    );
    Ok(taxroll_database::memory::MemoryStore::new())
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let multi = taxroll_cli_utils::init_logger();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Run {
            selection,
            skip_download,
            skip_extract,
            skip_transform,
            skip_load,
            dry_run,
            no_continue_on_error,
            json,
        } => {
            selection.apply(&mut config);
            config.skip_download |= skip_download;
            config.skip_extract |= skip_extract;
            config.skip_transform |= skip_transform;
            config.skip_load |= skip_load;
            config.dry_run |= dry_run;
            if no_continue_on_error {
                config.continue_on_error = false;
            }

            let store = open_store(&config)?;
            let mut orchestrator = Orchestrator::new(config, store)?
                .with_progress(IndicatifProgress::sources_bar(&multi, "Download"))
                .with_record_progress(IndicatifProgress::records_spinner(&multi, "Load"));
            let result = orchestrator.execute().await;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!();
                println!("Batch:    {}", result.batch_id);
                println!("Status:   {}", result.status);
                println!("Duration: {:.1}s", result.duration.as_secs_f64());
                println!();
                println!("{:<16} {:<8} METRICS", "STAGE", "RESULT");
                println!("{}", "-".repeat(72));
                for stage in &result.stages {
                    let outcome = if stage.skipped {
                        "skipped"
                    } else if stage.success {
                        "ok"
                    } else {
                        "failed"
                    };
                    let metrics = stage
                        .metrics
                        .iter()
                        .map(|(name, value)| format!("{name}={value}"))
                        .collect::<Vec<_>>()
                        .join(" ");
                    println!("{:<16} {outcome:<8} {metrics}", stage.stage.to_string());
                }
                if !result.errors.is_empty() {
                    println!();
                    println!("Errors:");
                    for error in &result.errors {
                        println!("  {error}");
                    }
                }
            }

            return Ok(ExitCode::from(result.status.exit_code()));
        }
        Commands::Sources => {
            let sources = registry::all_sources()?;
            println!(
                "{:<28} {:<14} {:<9} {:<5} URL",
                "NAME", "TYPE", "REQUIRED", "PRI"
            );
            println!("{}", "-".repeat(100));
            for source in &sources {
                println!(
                    "{:<28} {:<14} {:<9} {:<5} {}",
                    source.name,
                    source.source_type.to_string(),
                    if source.required { "yes" } else { "no" },
                    source.priority,
                    source.url_for_year(config.data_year)
                );
            }
        }
        Commands::Download { selection } => {
            selection.apply(&mut config);
            let orchestrator = Orchestrator::new(config, taxroll_database::memory::MemoryStore::new())?
                .with_progress(IndicatifProgress::sources_bar(&multi, "Download"));
            let results = orchestrator.execute_download_only().await;

            let mut failed_required = false;
            for result in &results {
                if result.success {
                    log::info!(
                        "{}: {} bytes in {:.1}s ({} attempt(s))",
                        result.source,
                        result.bytes,
                        result.duration.as_secs_f64(),
                        result.attempts
                    );
                } else {
                    failed_required |= result.required;
                    log::error!(
                        "{}: {}",
                        result.source,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if failed_required {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Extract { selection } => {
            selection.apply(&mut config);
            let orchestrator =
                Orchestrator::new(config, taxroll_database::memory::MemoryStore::new())?;

            let mut failed_required = false;
            for result in orchestrator.execute_extract_only() {
                if result.success {
                    log::info!(
                        "{}: {} file(s), {} bytes",
                        result.source,
                        result.files_extracted.len(),
                        result.bytes_extracted
                    );
                } else {
                    failed_required |= result.required;
                    log::error!(
                        "{}: {}",
                        result.source,
                        result.error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            if failed_required {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::LinkOrphans => {
            let store = open_store(&config)?;
            let mut orchestrator = Orchestrator::new(config, store)?;
            let linked = orchestrator.link_orphans()?;
            println!("Linked {linked} orphaned row(s)");
        }
        Commands::Purge => {
            let store = open_store(&config)?;
            let mut orchestrator = Orchestrator::new(config, store)?;
            let deleted = orchestrator.purge_superseded()?;
            println!("Removed {deleted} superseded row(s)");
        }
        Commands::Counts => {
            let store = open_store(&config)?;
            let orchestrator = Orchestrator::new(config, store)?;
            println!("{:<20} {:>12} {:>12}", "TABLE", "TOTAL", "ACTIVE");
            println!("{}", "-".repeat(46));
            for counts in orchestrator.record_counts()? {
                println!(
                    "{:<20} {:>12} {:>12}",
                    counts.table.to_string(),
                    counts.total,
                    counts.active
                );
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
