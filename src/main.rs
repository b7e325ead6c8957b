use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use sngpc_etl::config::EtlConfig;
use sngpc_etl::db::DatabaseManager;
use sngpc_etl::logging;
use sngpc_etl::metrics;
use sngpc_etl::pipeline::indexes::IndexBuilder;
use sngpc_etl::pipeline::ingestion::raw::RawIngestor;
use sngpc_etl::pipeline::ingestion::reference::{dedupe_mapping_csv, FailurePolicy, ReferenceLoader};
use sngpc_etl::pipeline::Pipeline;
use sngpc_etl::report::{distinct_values, export_unmapped_substances, FactSummary};

#[derive(Parser)]
#[command(name = "sngpc-etl")]
#[command(about = "Build the SNGPC dispensing analytics database from raw CSV extracts")]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to etl.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database file, overriding the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Write Prometheus metrics to this file after the command
    #[arg(long, global = true)]
    metrics_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full ETL: ingest, normalize, build, remediate, annotate, publish, index
    Run {
        /// Directory of raw CSV extracts
        #[arg(long)]
        raw_dir: Option<PathBuf>,
        /// Reload the three reference mappings first
        #[arg(long)]
        load_references: bool,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Load raw CSV extracts into the staging table only
    Ingest {
        #[arg(long)]
        raw_dir: Option<PathBuf>,
    },
    /// Load all three reference mappings
    LoadReferences {
        /// Keep loading the remaining sources when one fails
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Load the controlled-substance mapping
    LoadControlled {
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Load the ATC mapping
    LoadAtc {
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Load the municipality mapping
    LoadMunicipalities {
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Create the lookup indexes on the fact table
    Index,
    /// Print a data-quality summary of the fact table
    Summary {
        #[arg(long)]
        json: bool,
    },
    /// Export substances without a controlled-list mapping
    Unmapped {
        #[arg(long)]
        output: PathBuf,
    },
    /// Rewrite a mapping CSV keeping the first row per key
    DedupeMapping {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        output: PathBuf,
        #[arg(long, default_value = "principio_ativo")]
        key: String,
    },
    /// List distinct values of a filter column
    Distinct {
        #[arg(long)]
        column: String,
    },
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let _guard = logging::init_logging("logs");

    let cli = Cli::parse();
    let mut config =
        EtlConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    if let Some(path) = cli.metrics_file {
        config.metrics.textfile = Some(path);
    }

    if config.metrics.textfile.is_some() {
        metrics::init_metrics()?;
    }

    let outcome = execute(cli.command, &config);

    if let Some(path) = &config.metrics.textfile {
        if let Err(e) = metrics::write_textfile(path) {
            warn!("Could not write metrics file: {}", e);
        }
    }

    if let Err(e) = &outcome {
        error!("❌ {:#}", e);
    }
    outcome
}

fn execute(command: Commands, config: &EtlConfig) -> Result<()> {
    match command {
        Commands::Run {
            raw_dir,
            load_references,
            json,
        } => {
            let mut db = DatabaseManager::open_for_etl(&config.database.path)?;
            let mut pipeline =
                Pipeline::new(config.clone()).with_reference_loading(load_references);
            if let Some(dir) = raw_dir {
                pipeline = pipeline.with_raw_dir(dir);
            }
            let result = pipeline.run(&mut db).context("ETL run failed")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("\n📊 ETL run {}", result.run_id);
                for step in &result.steps {
                    println!("   {:<10} {}", step.stage, step.message);
                }
                println!("   Published rows: {}", result.published_rows);
                println!("   Duration: {:.1}s", result.duration_ms as f64 / 1000.0);
            }
        }
        Commands::Ingest { raw_dir } => {
            let mut db = DatabaseManager::open_for_etl(&config.database.path)?;
            let dir = raw_dir.unwrap_or_else(|| config.sources.raw_dir.clone());
            let report = RawIngestor::from_config(config).ingest_dir(&mut db, &dir)?;
            println!("✅ {} rows staged from {} files", report.total_rows, report.files.len());
        }
        Commands::LoadReferences { continue_on_error } => {
            let mut db = DatabaseManager::open_for_etl(&config.database.path)?;
            let policy = if continue_on_error {
                FailurePolicy::Continue
            } else {
                FailurePolicy::Abort
            };
            let outcomes = ReferenceLoader::from_config(config).load_all(&mut db, config, policy)?;
            for outcome in &outcomes {
                match (&outcome.rows, &outcome.error) {
                    (Some(rows), _) => {
                        println!("✅ {:<15} {} rows", outcome.reference.name(), rows)
                    }
                    (None, Some(e)) => println!("❌ {:<15} {}", outcome.reference.name(), e),
                    (None, None) => {}
                }
            }
            let failed = outcomes.iter().filter(|o| !o.is_success()).count();
            if failed > 0 {
                bail!("{failed} reference mapping(s) failed to load");
            }
        }
        Commands::LoadControlled { csv } => {
            let path = csv.unwrap_or_else(|| config.sources.controlled_csv.clone());
            load_single(config, &path, |loader, db, path| loader.load_controlled(db, path))?;
        }
        Commands::LoadAtc { csv } => {
            let path = csv.unwrap_or_else(|| config.sources.atc_csv.clone());
            load_single(config, &path, |loader, db, path| loader.load_atc(db, path))?;
        }
        Commands::LoadMunicipalities { csv } => {
            let path = csv.unwrap_or_else(|| config.sources.municipalities_csv.clone());
            load_single(config, &path, |loader, db, path| loader.load_municipalities(db, path))?;
        }
        Commands::Index => {
            let mut db = DatabaseManager::open_for_etl(&config.database.path)?;
            let report = IndexBuilder::for_fact_table(&config.database.fact_table).create(&mut db)?;
            println!(
                "✅ {} indexes created, {} already present",
                report.created.len(),
                report.existing.len()
            );
        }
        Commands::Summary { json } => {
            let db = DatabaseManager::open_read_only(&config.database.path)?;
            let summary = FactSummary::collect(&db, &config.database.fact_table)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                summary.log();
            }
        }
        Commands::Unmapped { output } => {
            let db = DatabaseManager::open_read_only(&config.database.path)?;
            let count = export_unmapped_substances(&db, &config.database.fact_table, &output)?;
            println!("📄 {} unmapped substances written to {}", count, output.display());
        }
        Commands::DedupeMapping { input, output, key } => {
            let report = dedupe_mapping_csv(
                &input,
                &output,
                &key,
                config.delimiter_byte(),
                config.sources.reference_encoding,
            )?;
            println!(
                "✅ {} of {} rows kept in {}",
                report.rows_written,
                report.rows_read,
                output.display()
            );
        }
        Commands::Distinct { column } => {
            let db = DatabaseManager::open_read_only(&config.database.path)?;
            for value in distinct_values(&db, &config.database.fact_table, &column)? {
                println!("{value}");
            }
        }
    }
    Ok(())
}

/// Load one reference mapping into its table
fn load_single<F>(config: &EtlConfig, path: &Path, load: F) -> Result<()>
where
    F: FnOnce(&ReferenceLoader, &mut DatabaseManager, &Path) -> sngpc_etl::Result<u64>,
{
    let mut db = DatabaseManager::open_for_etl(&config.database.path)?;
    let loader = ReferenceLoader::from_config(config);
    let rows = load(&loader, &mut db, path)?;
    info!("Loaded {} rows from {}", rows, path.display());
    println!("✅ {} rows loaded from {}", rows, path.display());
    Ok(())
}
