use chrono::NaiveDate;
use rusqlite::params;
use serde::Serialize;
use tracing::{info, instrument};

use super::fact_builder::{ControlledEntry, ReferenceIndex};
use crate::db::{quote_ident, DatabaseManager};
use crate::error::Result;

/// Whether a dispensing date falls inside its substance's controlled-list window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Validity {
    Inside,
    Outside,
    /// No controlled-list match, or a window that cannot be determined
    Unknown,
}

impl Validity {
    /// Stored as 1 / 0 / NULL
    pub fn as_sql(&self) -> Option<i64> {
        match self {
            Validity::Inside => Some(1),
            Validity::Outside => Some(0),
            Validity::Unknown => None,
        }
    }
}

/// Classify `date` against the window `[inclusion, exclusion]`, open-ended when
/// no exclusion date was recorded.
pub fn classify(entry: Option<&ControlledEntry>, date: NaiveDate) -> Validity {
    let Some(entry) = entry else {
        return Validity::Unknown;
    };
    let Some(inclusion) = entry.inclusion else {
        return Validity::Unknown;
    };
    let has_exclusion_text = entry
        .exclusion_raw
        .as_deref()
        .map(|t| !t.trim().is_empty())
        .unwrap_or(false);
    match entry.exclusion {
        None if has_exclusion_text => Validity::Unknown,
        None if date >= inclusion => Validity::Inside,
        Some(exclusion) if date >= inclusion && date <= exclusion => Validity::Inside,
        _ => Validity::Outside,
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidityReport {
    pub pairs_evaluated: u64,
    pub rows_inside: u64,
    pub rows_outside: u64,
    pub rows_unknown: u64,
}

/// Annotates `periodo_valido_controlado` on a fact table.
pub struct ValidityAnnotator {
    table: String,
}

impl ValidityAnnotator {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }

    /// Evaluate each distinct (substance, date) pair once and write the results
    /// back with a single UPDATE.
    #[instrument(skip(self, db, refs), fields(table = %self.table))]
    pub fn run(&self, db: &mut DatabaseManager, refs: &ReferenceIndex) -> Result<ValidityReport> {
        db.require_table(&self.table)?;
        let table = quote_ident(&self.table);
        let mut report = ValidityReport::default();

        let tx = db.conn_mut().transaction()?;
        let pairs: Vec<(String, String)> = {
            let mut stmt = tx.prepare(&format!(
                "SELECT DISTINCT principio_ativo, data FROM {table}
                 WHERE principio_ativo IS NOT NULL AND principio_ativo <> ''"
            ))?;
            let pairs = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            pairs
        };

        tx.execute_batch(
            "DROP TABLE IF EXISTS temp.validity_results;
             CREATE TEMP TABLE validity_results (join_key TEXT, data TEXT, valid INTEGER,
                PRIMARY KEY (join_key, data));",
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO temp.validity_results (join_key, data, valid) VALUES (?1, ?2, ?3)",
            )?;
            for (key, data) in &pairs {
                let Ok(date) = NaiveDate::parse_from_str(data, "%Y-%m-%d") else {
                    continue;
                };
                let validity = classify(refs.controlled(key), date);
                if validity != Validity::Unknown {
                    insert.execute(params![key, data, validity.as_sql()])?;
                }
            }
        }
        report.pairs_evaluated = pairs.len() as u64;

        // reset first so a re-run never keeps stale values
        tx.execute(&format!("UPDATE {table} SET periodo_valido_controlado = NULL"), [])?;
        tx.execute(
            &format!(
                "UPDATE {table} SET periodo_valido_controlado = v.valid
                 FROM temp.validity_results AS v
                 WHERE {table}.principio_ativo = v.join_key AND {table}.data = v.data"
            ),
            [],
        )?;
        tx.execute_batch("DROP TABLE temp.validity_results;")?;

        let (inside, outside, unknown): (i64, i64, i64) = tx.query_row(
            &format!(
                "SELECT
                    COALESCE(SUM(periodo_valido_controlado = 1), 0),
                    COALESCE(SUM(periodo_valido_controlado = 0), 0),
                    COALESCE(SUM(periodo_valido_controlado IS NULL), 0)
                 FROM {table}"
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        tx.commit()?;

        report.rows_inside = inside as u64;
        report.rows_outside = outside as u64;
        report.rows_unknown = unknown as u64;
        info!(
            "✅ Validity window: {} inside, {} outside, {} unknown",
            inside, outside, unknown
        );
        Ok(report)
    }
}
