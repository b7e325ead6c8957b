use metrics::counter;
use rusqlite::{params, Transaction};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::constants::{MAX_PLAUSIBLE_AGE, MIN_PLAUSIBLE_AGE, TUKEY_K};
use crate::db::{quote_ident, DatabaseManager};
use crate::error::Result;

/// Age bracket vocabulary of the fact table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AgeBracket {
    Unknown,
    Child,
    YoungAdult,
    Adult,
    EarlyElderly,
    LateElderly,
}

/// Upper bounds (exclusive) checked in order; ages past the last one are `LateElderly`.
pub const AGE_THRESHOLDS: [(i64, AgeBracket); 4] = [
    (15, AgeBracket::Child),
    (25, AgeBracket::YoungAdult),
    (60, AgeBracket::Adult),
    (65, AgeBracket::EarlyElderly),
];

impl AgeBracket {
    pub const ALL: [AgeBracket; 6] = [
        AgeBracket::Unknown,
        AgeBracket::Child,
        AgeBracket::YoungAdult,
        AgeBracket::Adult,
        AgeBracket::EarlyElderly,
        AgeBracket::LateElderly,
    ];

    pub fn from_age(age: Option<i64>) -> Self {
        let Some(age) = age else {
            return AgeBracket::Unknown;
        };
        AGE_THRESHOLDS
            .iter()
            .find(|(upper, _)| age < *upper)
            .map(|(_, bracket)| *bracket)
            .unwrap_or(AgeBracket::LateElderly)
    }

    pub fn label(&self) -> &'static str {
        match self {
            AgeBracket::Unknown => "Unknown",
            AgeBracket::Child => "Child (0-14)",
            AgeBracket::YoungAdult => "Young adult (15-24)",
            AgeBracket::Adult => "Adult (25-59)",
            AgeBracket::EarlyElderly => "Elderly (60-64)",
            AgeBracket::LateElderly => "Elderly (65+)",
        }
    }
}

/// SQL CASE expression equivalent to `AgeBracket::from_age` over `column`
pub fn age_bracket_case_sql(column: &str) -> String {
    let column = quote_ident(column);
    let mut sql = format!("CASE WHEN {column} IS NULL THEN '{}'", AgeBracket::Unknown.label());
    for (upper, bracket) in AGE_THRESHOLDS {
        sql.push_str(&format!(" WHEN {column} < {upper} THEN '{}'", bracket.label()));
    }
    sql.push_str(&format!(" ELSE '{}' END", AgeBracket::LateElderly.label()));
    sql
}

/// Zero-based rank and interpolation weight of the `p` quantile among `n` sorted values
pub fn quantile_position(n: u64, p: f64) -> (u64, f64) {
    let h = p * (n.saturating_sub(1)) as f64;
    let lower = h.floor();
    (lower as u64, h - lower)
}

/// Linear interpolation over the two values starting at the quantile rank.
/// A single value is its own quantile.
pub fn interpolate(window: &[f64], weight: f64) -> Option<f64> {
    let lo = *window.first()?;
    let hi = window.get(1).copied().unwrap_or(lo);
    Some(lo + weight * (hi - lo))
}

/// Upper Tukey fence, `q3 + k * (q3 - q1)`
pub fn upper_fence(q1: f64, q3: f64) -> f64 {
    q3 + TUKEY_K * (q3 - q1)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RemediationReport {
    pub mean_age: Option<f64>,
    pub replacement_age: Option<i64>,
    pub ages_replaced: u64,
    pub quantity_q1: Option<f64>,
    pub quantity_q3: Option<f64>,
    pub upper_fence: Option<f64>,
    pub negatives_repaired: u64,
    pub values_capped: u64,
    pub bracketed_rows: u64,
}

/// Repairs implausible ages and quantities of a fact table in place, then assigns
/// age brackets from the repaired ages.
pub struct OutlierRemediator {
    table: String,
}

impl OutlierRemediator {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
        }
    }

    #[instrument(skip(self, db), fields(table = %self.table))]
    pub fn run(&self, db: &mut DatabaseManager) -> Result<RemediationReport> {
        db.require_table(&self.table)?;
        let mut report = RemediationReport::default();

        let tx = db.conn_mut().transaction()?;
        self.remediate_ages(&tx, &mut report)?;
        self.remediate_quantities(&tx, &mut report)?;
        report.bracketed_rows = self.assign_age_brackets(&tx)?;
        tx.commit()?;

        counter!("sngpc_ages_replaced_total").increment(report.ages_replaced);
        counter!("sngpc_quantities_repaired_total")
            .increment(report.negatives_repaired + report.values_capped);
        Ok(report)
    }

    fn remediate_ages(&self, tx: &Transaction<'_>, report: &mut RemediationReport) -> Result<()> {
        let table = quote_ident(&self.table);
        let mean: Option<f64> = tx.query_row(
            &format!("SELECT AVG(idade) FROM {table} WHERE idade BETWEEN ?1 AND ?2"),
            params![MIN_PLAUSIBLE_AGE, MAX_PLAUSIBLE_AGE],
            |row| row.get(0),
        )?;
        let Some(mean) = mean else {
            warn!(
                "No age within [{}, {}], skipping age remediation",
                MIN_PLAUSIBLE_AGE, MAX_PLAUSIBLE_AGE
            );
            return Ok(());
        };

        let replacement = mean.round_ties_even() as i64;
        let replaced = tx.execute(
            &format!(
                "UPDATE {table} SET idade = ?1, idade_modificada_flag = 1
                 WHERE idade IS NULL OR idade < ?2 OR idade > ?3"
            ),
            params![replacement, MIN_PLAUSIBLE_AGE, MAX_PLAUSIBLE_AGE],
        )?;

        info!(
            "Mean plausible age {:.2}; {} ages replaced with {}",
            mean, replaced, replacement
        );
        report.mean_age = Some(mean);
        report.replacement_age = Some(replacement);
        report.ages_replaced = replaced as u64;
        Ok(())
    }

    fn remediate_quantities(
        &self,
        tx: &Transaction<'_>,
        report: &mut RemediationReport,
    ) -> Result<()> {
        let table = quote_ident(&self.table);
        let n: i64 = tx.query_row(
            &format!("SELECT COUNT(quantidade_vendida) FROM {table}"),
            [],
            |row| row.get(0),
        )?;
        if n == 0 {
            warn!("No quantity values, skipping quantity remediation");
            return Ok(());
        }

        let q1 = self.quantile(tx, n as u64, 0.25)?;
        let q3 = self.quantile(tx, n as u64, 0.75)?;
        let fence = upper_fence(q1, q3);

        let negatives = tx.execute(
            &format!(
                "UPDATE {table}
                 SET quantidade_vendida = ABS(quantidade_vendida), quantidade_modificada_flag = 1
                 WHERE quantidade_vendida < 0"
            ),
            [],
        )?;
        // capping at a negative fence would make repaired values negative again
        let capped = if fence < 0.0 {
            warn!("Upper fence {} is negative, skipping the quantity cap", fence);
            0
        } else {
            tx.execute(
                &format!(
                    "UPDATE {table} SET quantidade_vendida = ?1, quantidade_modificada_flag = 1
                     WHERE quantidade_vendida > ?1"
                ),
                params![fence],
            )?
        };

        info!(
            "Quantity Q1={} Q3={} fence={}; {} negatives repaired, {} capped",
            q1, q3, fence, negatives, capped
        );
        report.quantity_q1 = Some(q1);
        report.quantity_q3 = Some(q3);
        report.upper_fence = Some(fence);
        report.negatives_repaired = negatives as u64;
        report.values_capped = capped as u64;
        Ok(())
    }

    /// Continuous quantile over the non-null quantities, reading at most two ranked values
    fn quantile(&self, tx: &Transaction<'_>, n: u64, p: f64) -> Result<f64> {
        let (rank, weight) = quantile_position(n, p);
        let mut stmt = tx.prepare(&format!(
            "SELECT quantidade_vendida FROM {} WHERE quantidade_vendida IS NOT NULL
             ORDER BY quantidade_vendida LIMIT 2 OFFSET ?1",
            quote_ident(&self.table)
        ))?;
        let values = stmt
            .query_map([rank as i64], |row| row.get::<_, f64>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(interpolate(&values, weight).unwrap_or_default())
    }

    fn assign_age_brackets(&self, tx: &Transaction<'_>) -> Result<u64> {
        let updated = tx.execute(
            &format!(
                "UPDATE {} SET faixa_etaria = {}",
                quote_ident(&self.table),
                age_bracket_case_sql("idade")
            ),
            [],
        )?;
        Ok(updated as u64)
    }
}
