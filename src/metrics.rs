use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::path::Path;
use std::sync::OnceLock;
use tracing::info;

use crate::error::{EtlError, Result};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Without it every `counter!` is a no-op.
pub fn init_metrics() -> Result<()> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EtlError::Metrics(format!("Failed to install Prometheus recorder: {e}")))?;
    METRICS_HANDLE.set(handle).ok();

    describe_counter!("sngpc_raw_rows_ingested_total", "Raw rows appended to the staging table");
    describe_counter!("sngpc_raw_batches_total", "Committed ingestion batches");
    describe_counter!("sngpc_raw_files_total", "Source files ingested");
    describe_counter!(
        "sngpc_rows_excluded_invalid_date_total",
        "Staging rows dropped because year and month do not form a date"
    );
    describe_counter!("sngpc_fact_rows_built_total", "Rows written to the building fact table");
    describe_counter!("sngpc_ages_replaced_total", "Ages replaced by the plausible mean");
    describe_counter!("sngpc_quantities_repaired_total", "Quantities made positive or capped");
    describe_histogram!("sngpc_stage_duration_seconds", "Wall time of each pipeline stage");

    info!("Metrics recorder installed");
    Ok(())
}

pub fn render() -> Option<String> {
    METRICS_HANDLE.get().map(|handle| handle.render())
}

/// Write the exposition text next to `path` and rename it into place, so a
/// collector never reads a half-written file.
pub fn write_textfile(path: &Path) -> Result<()> {
    let Some(text) = render() else {
        return Err(EtlError::Metrics("Metrics recorder is not installed".to_string()));
    };
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("prom.tmp");
    std::fs::write(&tmp, text)?;
    std::fs::rename(&tmp, path)?;
    info!("📄 Metrics written to {}", path.display());
    Ok(())
}
