// ETL pipeline: ingestion, processing, publication and indexing

pub mod indexes;
pub mod ingestion;
pub mod processing;

use chrono::{DateTime, Utc};
use metrics::histogram;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::EtlConfig;
use crate::constants::{ATC_TABLE, CONTROLLED_TABLE};
use crate::db::DatabaseManager;
use crate::error::{EtlError, Result};
use crate::report::FactSummary;
use indexes::{IndexBuilder, IndexReport};
use ingestion::raw::{IngestReport, RawIngestor};
use ingestion::reference::{FailurePolicy, ReferenceLoader, ReferenceOutcome};
use processing::fact_builder::{
    building_table_name, publish_fact_table, FactBuildReport, FactBuilder, ReferenceIndex,
};
use processing::normalize::{
    normalize_reference, normalize_staging, NormalizeReport, SubstanceNormalizer,
};
use processing::outliers::{OutlierRemediator, RemediationReport};
use processing::validity::{ValidityAnnotator, ValidityReport};

/// Stage names in execution order
pub const STAGES: [&str; 8] = [
    "ingest",
    "normalize",
    "build",
    "remediate",
    "validity",
    "publish",
    "index",
    "cleanup",
];

/// Result of executing one pipeline stage
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub stage: String,
    pub success: bool,
    pub processed_count: u64,
    pub message: String,
    pub duration_ms: u128,
    pub metadata: BTreeMap<String, String>,
}

impl StepResult {
    pub fn success(stage: &str, processed: u64, message: String, duration_ms: u128) -> Self {
        Self {
            stage: stage.to_string(),
            success: true,
            processed_count: processed,
            message,
            duration_ms,
            metadata: BTreeMap::new(),
        }
    }

    pub fn failure(stage: &str, message: String, duration_ms: u128) -> Self {
        Self {
            stage: stage.to_string(),
            success: false,
            processed_count: 0,
            message,
            duration_ms,
            metadata: BTreeMap::new(),
        }
    }
}

/// Everything a run produced, serializable for `--json`
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u128,
    pub fact_table: String,
    pub steps: Vec<StepResult>,
    pub references: Vec<ReferenceOutcome>,
    pub ingest: Option<IngestReport>,
    pub normalization: Vec<NormalizeReport>,
    pub build: Option<FactBuildReport>,
    pub remediation: Option<RemediationReport>,
    pub validity: Option<ValidityReport>,
    pub published_rows: u64,
    pub indexes: Option<IndexReport>,
    pub summary: Option<FactSummary>,
}

impl PipelineResult {
    fn new(fact_table: &str) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            fact_table: fact_table.to_string(),
            steps: Vec::new(),
            references: Vec::new(),
            ingest: None,
            normalization: Vec::new(),
            build: None,
            remediation: None,
            validity: None,
            published_rows: 0,
            indexes: None,
            summary: None,
        }
    }

    fn complete(&mut self) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u128;
        self.completed_at = Some(now);
    }

    pub fn success(&self) -> bool {
        self.steps.iter().all(|s| s.success)
    }
}

/// Runs the full ETL against one database handle, stage by stage.
pub struct Pipeline {
    config: EtlConfig,
    raw_dir: PathBuf,
    load_references: bool,
    normalizer: SubstanceNormalizer,
}

impl Pipeline {
    pub fn new(config: EtlConfig) -> Self {
        let raw_dir = config.sources.raw_dir.clone();
        Self {
            config,
            raw_dir,
            load_references: false,
            normalizer: SubstanceNormalizer::default(),
        }
    }

    pub fn with_raw_dir(mut self, raw_dir: PathBuf) -> Self {
        self.raw_dir = raw_dir;
        self
    }

    /// Reload the three reference CSVs before ingestion
    pub fn with_reference_loading(mut self, load: bool) -> Self {
        self.load_references = load;
        self
    }

    /// Run every stage in order. On failure the building table is dropped and the
    /// previously published fact table is left as it was.
    #[instrument(skip(self, db), fields(fact_table = %self.config.database.fact_table))]
    pub fn run(&self, db: &mut DatabaseManager) -> Result<PipelineResult> {
        let mut result = PipelineResult::new(&self.config.database.fact_table);
        info!("🚀 Starting ETL run {}", result.run_id);

        if let Err(e) = self.run_stages(db, &mut result) {
            let building = building_table_name(&self.config.database.fact_table);
            if let Err(cleanup) = db.drop_table(&building) {
                warn!("Could not drop '{}' after failure: {}", building, cleanup);
            }
            error!("💥 ETL run {} failed: {}", result.run_id, e);
            return Err(e);
        }

        result.complete();
        info!(
            "🎉 ETL run {} finished in {:.1}s",
            result.run_id,
            result.duration_ms as f64 / 1000.0
        );
        Ok(result)
    }

    fn run_stages(&self, db: &mut DatabaseManager, result: &mut PipelineResult) -> Result<()> {
        let fact_table = self.config.database.fact_table.clone();
        let staging_table = self.config.database.staging_table.clone();
        let building = building_table_name(&fact_table);

        if self.load_references {
            info!("Loading reference mappings");
            let loader = ReferenceLoader::from_config(&self.config);
            result.references = loader.load_all(db, &self.config, FailurePolicy::Abort)?;
        }

        let ingest = stage(
            result,
            0,
            || RawIngestor::from_config(&self.config).ingest_dir(db, &self.raw_dir),
            |r| {
                let message = format!("{} rows from {} files", r.total_rows, r.files.len());
                (r.total_rows, message)
            },
        )?;
        result.ingest = Some(ingest);

        let normalization = stage(
            result,
            1,
            || {
                Ok(vec![
                    normalize_staging(db, &staging_table, &self.normalizer)?,
                    normalize_reference(db, CONTROLLED_TABLE, &self.normalizer)?,
                    normalize_reference(db, ATC_TABLE, &self.normalizer)?,
                ])
            },
            |reports| {
                let names: u64 = reports.iter().map(|r| r.distinct_names as u64).sum();
                (names, format!("{names} distinct names canonicalized"))
            },
        )?;
        result.normalization = normalization;

        let (refs, build) = stage(
            result,
            2,
            || {
                let refs = ReferenceIndex::load(db)?;
                let build = FactBuilder::new(&staging_table, &fact_table).build(db, &refs)?;
                Ok((refs, build))
            },
            |(_, b)| {
                let message = format!(
                    "{} rows built, {} excluded",
                    b.inserted_rows, b.excluded_invalid_date
                );
                (b.inserted_rows, message)
            },
        )?;
        result.build = Some(build);

        let remediation = stage(
            result,
            3,
            || OutlierRemediator::new(&building).run(db),
            |r| {
                let message = format!(
                    "{} ages replaced, {} negatives repaired, {} quantities capped",
                    r.ages_replaced, r.negatives_repaired, r.values_capped
                );
                (r.ages_replaced + r.negatives_repaired + r.values_capped, message)
            },
        )?;
        result.remediation = Some(remediation);

        let validity = stage(
            result,
            4,
            || ValidityAnnotator::new(&building).run(db, &refs),
            |v| {
                let message = format!(
                    "{} inside, {} outside, {} unknown",
                    v.rows_inside, v.rows_outside, v.rows_unknown
                );
                (v.pairs_evaluated, message)
            },
        )?;
        result.validity = Some(validity);

        let published = stage(
            result,
            5,
            || publish_fact_table(db, &fact_table),
            |rows| (*rows, format!("{rows} rows published")),
        )?;
        result.published_rows = published;

        let indexes = stage(
            result,
            6,
            || IndexBuilder::for_fact_table(&fact_table).create(db),
            |r| {
                let message = format!("{} created, {} existing", r.created.len(), r.existing.len());
                (r.created.len() as u64, message)
            },
        )?;
        result.indexes = Some(indexes);

        stage(
            result,
            7,
            || db.drop_table(&staging_table),
            |_| (0, format!("staging table '{staging_table}' dropped")),
        )?;

        let summary = FactSummary::collect(db, &fact_table)?;
        summary.log();
        result.summary = Some(summary);
        Ok(())
    }
}

/// Run one numbered stage, recording its `StepResult` and duration.
fn stage<T>(
    result: &mut PipelineResult,
    index: usize,
    run: impl FnOnce() -> Result<T>,
    describe: impl FnOnce(&T) -> (u64, String),
) -> Result<T> {
    let name = STAGES[index];
    info!("[stage {}/{}] {}", index + 1, STAGES.len(), name);
    let started = Instant::now();

    match run() {
        Ok(value) => {
            let elapsed = started.elapsed();
            histogram!("sngpc_stage_duration_seconds", "stage" => name)
                .record(elapsed.as_secs_f64());
            let (processed, message) = describe(&value);
            info!("✅ Stage '{}' completed: {}", name, message);
            result
                .steps
                .push(StepResult::success(name, processed, message, elapsed.as_millis()));
            Ok(value)
        }
        Err(e) => {
            error!("❌ Stage '{}' failed: {}", name, e);
            result
                .steps
                .push(StepResult::failure(name, e.to_string(), started.elapsed().as_millis()));
            Err(EtlError::in_stage(name, e))
        }
    }
}
