//! Read-only queries over a published fact table.

use serde::Serialize;
use std::path::Path;
use tracing::{info, warn};

use crate::constants::{INDEXED_COLUMNS, NOT_CLASSIFIED, NOT_MAPPED};
use crate::db::{quote_ident, DatabaseManager};
use crate::error::{EtlError, Result};

/// Data-quality overview of the fact table
#[derive(Debug, Clone, Default, Serialize)]
pub struct FactSummary {
    pub table: String,
    pub total_rows: u64,
    pub distinct_substances: u64,
    pub municipalities: u64,
    pub states: u64,
    pub therapeutic_classes: u64,
    pub atc_codes: u64,
    pub age_brackets: u64,
    pub controlled_lists: u64,
    pub rows_without_atc: u64,
    pub rows_unmapped_list: u64,
    pub rows_age_modified: u64,
    pub rows_quantity_modified: u64,
    pub first_date: Option<String>,
    pub last_date: Option<String>,
}

impl FactSummary {
    pub fn collect(db: &DatabaseManager, table: &str) -> Result<Self> {
        db.require_table(table)?;
        let t = quote_ident(table);
        let sql = format!(
            "SELECT
                COUNT(*),
                COUNT(DISTINCT principio_ativo),
                COUNT(DISTINCT nome_municipio),
                COUNT(DISTINCT sigla_uf),
                COUNT(DISTINCT classe_terapeutica),
                COUNT(DISTINCT codigo_atc),
                COUNT(DISTINCT faixa_etaria),
                COUNT(DISTINCT anvisa_lista),
                COALESCE(SUM(codigo_atc = ?1), 0),
                COALESCE(SUM(anvisa_lista = ?2), 0),
                COALESCE(SUM(idade_modificada_flag), 0),
                COALESCE(SUM(quantidade_modificada_flag), 0),
                MIN(data),
                MAX(data)
             FROM {t}"
        );
        let summary = db.conn().query_row(&sql, [NOT_CLASSIFIED, NOT_MAPPED], |row| {
            Ok(FactSummary {
                table: table.to_string(),
                total_rows: row.get::<_, i64>(0)? as u64,
                distinct_substances: row.get::<_, i64>(1)? as u64,
                municipalities: row.get::<_, i64>(2)? as u64,
                states: row.get::<_, i64>(3)? as u64,
                therapeutic_classes: row.get::<_, i64>(4)? as u64,
                atc_codes: row.get::<_, i64>(5)? as u64,
                age_brackets: row.get::<_, i64>(6)? as u64,
                controlled_lists: row.get::<_, i64>(7)? as u64,
                rows_without_atc: row.get::<_, i64>(8)? as u64,
                rows_unmapped_list: row.get::<_, i64>(9)? as u64,
                rows_age_modified: row.get::<_, i64>(10)? as u64,
                rows_quantity_modified: row.get::<_, i64>(11)? as u64,
                first_date: row.get(12)?,
                last_date: row.get(13)?,
            })
        })?;
        Ok(summary)
    }

    /// Share of rows with an ATC classification, in percent
    pub fn atc_coverage(&self) -> f64 {
        if self.total_rows == 0 {
            return 0.0;
        }
        100.0 * (self.total_rows - self.rows_without_atc) as f64 / self.total_rows as f64
    }

    pub fn log(&self) {
        info!("📊 Summary of '{}'", self.table);
        info!("   rows: {}", self.total_rows);
        info!(
            "   period: {} to {}",
            self.first_date.as_deref().unwrap_or("-"),
            self.last_date.as_deref().unwrap_or("-")
        );
        info!("   substances: {}", self.distinct_substances);
        info!("   municipalities: {} in {} states", self.municipalities, self.states);
        info!(
            "   therapeutic classes: {} ({} ATC codes)",
            self.therapeutic_classes, self.atc_codes
        );
        info!("   age brackets: {}", self.age_brackets);
        info!("   controlled lists: {}", self.controlled_lists);
        info!(
            "   remediated: {} ages, {} quantities",
            self.rows_age_modified, self.rows_quantity_modified
        );
        if self.total_rows > 0 && self.rows_without_atc > 0 {
            warn!(
                "{} rows ({:.1}%) have no ATC classification",
                self.rows_without_atc,
                100.0 - self.atc_coverage()
            );
        }
        if self.rows_unmapped_list > 0 {
            warn!(
                "{} rows have no controlled-list mapping; see the unmapped export",
                self.rows_unmapped_list
            );
        }
    }
}

/// Write substances without a controlled-list mapping to a `;` separated CSV,
/// most frequent first. Returns the number of substances written.
pub fn export_unmapped_substances(db: &DatabaseManager, table: &str, path: &Path) -> Result<u64> {
    db.require_table(table)?;
    let mut stmt = db.conn().prepare(&format!(
        "SELECT principio_ativo, COUNT(*) AS registros FROM {}
         WHERE anvisa_lista = ?1 AND principio_ativo IS NOT NULL AND principio_ativo <> ''
         GROUP BY principio_ativo
         ORDER BY registros DESC, principio_ativo",
        quote_ident(table)
    ))?;
    let rows = stmt
        .query_map([NOT_MAPPED], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b';')
        .from_path(path)
        .map_err(|e| EtlError::csv(path, e))?;
    writer
        .write_record(["principio_ativo", "registros"])
        .map_err(|e| EtlError::csv(path, e))?;
    for (name, count) in &rows {
        writer
            .write_record([name.as_str(), count.to_string().as_str()])
            .map_err(|e| EtlError::csv(path, e))?;
    }
    writer.flush()?;

    info!("📄 {} unmapped substances written to {}", rows.len(), path.display());
    Ok(rows.len() as u64)
}

/// Sorted distinct non-null values of an indexed filter column
pub fn distinct_values(db: &DatabaseManager, table: &str, column: &str) -> Result<Vec<String>> {
    if !INDEXED_COLUMNS.contains(&column) {
        return Err(EtlError::Config(format!(
            "'{}' is not a filter column; expected one of {}",
            column,
            INDEXED_COLUMNS.join(", ")
        )));
    }
    db.require_table(table)?;
    let column = quote_ident(column);
    let mut stmt = db.conn().prepare(&format!(
        "SELECT DISTINCT CAST({column} AS TEXT), {column} FROM {} WHERE {column} IS NOT NULL ORDER BY {column}",
        quote_ident(table)
    ))?;
    let values = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(db: &DatabaseManager) {
        db.conn()
            .execute_batch(
                "CREATE TABLE fact (ano INTEGER, data TEXT, principio_ativo TEXT, nome_municipio TEXT,
                    sigla_uf TEXT, classe_terapeutica TEXT, codigo_atc TEXT, faixa_etaria TEXT,
                    anvisa_lista TEXT, idade_modificada_flag INTEGER, quantidade_modificada_flag INTEGER);
                 INSERT INTO fact VALUES
                    (2019, '2019-01-01', 'SERTRALINA', 'A', 'SP', 'X', 'N06AB06', 'Adult (25-59)', 'C1', 1, 0),
                    (2020, '2020-02-01', 'DIPIRONA', 'B', 'RJ', 'Not classified', 'Not classified', 'Unknown', 'Not mapped', 0, 1),
                    (2020, '2020-03-01', 'DIPIRONA', 'B', 'RJ', 'Not classified', 'Not classified', 'Unknown', 'Not mapped', 0, 0),
                    (2020, '2020-03-01', 'OUTRA', 'B', 'RJ', 'Not classified', 'Not classified', 'Unknown', 'Not mapped', 0, 0);",
            )
            .unwrap();
    }

    #[test]
    fn test_summary_counts() {
        let db = DatabaseManager::open_in_memory().unwrap();
        sample(&db);
        let summary = FactSummary::collect(&db, "fact").unwrap();
        assert_eq!(summary.total_rows, 4);
        assert_eq!(summary.distinct_substances, 3);
        assert_eq!(summary.states, 2);
        assert_eq!(summary.rows_without_atc, 3);
        assert_eq!(summary.rows_unmapped_list, 3);
        assert_eq!(summary.rows_age_modified, 1);
        assert_eq!(summary.first_date.as_deref(), Some("2019-01-01"));
        assert_eq!(summary.atc_coverage(), 25.0);
    }

    #[test]
    fn test_unmapped_export_is_semicolon_separated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/unmapped.csv");
        let db = DatabaseManager::open_in_memory().unwrap();
        sample(&db);

        assert_eq!(export_unmapped_substances(&db, "fact", &path).unwrap(), 2);
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec!["principio_ativo;registros", "DIPIRONA;2", "OUTRA;1"]);
    }

    #[test]
    fn test_distinct_values_validates_column() {
        let db = DatabaseManager::open_in_memory().unwrap();
        sample(&db);
        assert_eq!(distinct_values(&db, "fact", "ano").unwrap(), vec!["2019", "2020"]);
        assert_eq!(distinct_values(&db, "fact", "sigla_uf").unwrap(), vec!["RJ", "SP"]);
        assert!(matches!(
            distinct_values(&db, "fact", "idade"),
            Err(EtlError::Config(_))
        ));
    }
}
