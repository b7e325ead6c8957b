use rusqlite::params_from_iter;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};

use super::csv_source::{CsvSource, TextEncoding};
use crate::config::EtlConfig;
use crate::constants::{ATC_TABLE, CONTROLLED_TABLE, MUNICIPALITIES_TABLE};
use crate::db::{quote_ident, DatabaseManager};
use crate::error::{EtlError, Result};
use crate::pipeline::processing::normalize::SubstanceNormalizer;

/// The three curated lookup sources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceKind {
    Controlled,
    Atc,
    Municipalities,
}

impl ReferenceKind {
    pub const ALL: [ReferenceKind; 3] = [
        ReferenceKind::Controlled,
        ReferenceKind::Atc,
        ReferenceKind::Municipalities,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ReferenceKind::Controlled => "controlled",
            ReferenceKind::Atc => "atc",
            ReferenceKind::Municipalities => "municipalities",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            ReferenceKind::Controlled => CONTROLLED_TABLE,
            ReferenceKind::Atc => ATC_TABLE,
            ReferenceKind::Municipalities => MUNICIPALITIES_TABLE,
        }
    }

    pub fn required_columns(&self) -> &'static [&'static str] {
        match self {
            ReferenceKind::Controlled => &["principio_ativo", "lista", "inclusao_lista"],
            ReferenceKind::Atc => &["principio_ativo", "codigo_atc", "classe_terapeutica"],
            ReferenceKind::Municipalities => &["id_municipio", "nome_municipio"],
        }
    }

    /// Whether rows are matched through the substance join key
    pub fn is_text_joined(&self) -> bool {
        !matches!(self, ReferenceKind::Municipalities)
    }

    pub fn source_path<'a>(&self, config: &'a EtlConfig) -> &'a Path {
        match self {
            ReferenceKind::Controlled => &config.sources.controlled_csv,
            ReferenceKind::Atc => &config.sources.atc_csv,
            ReferenceKind::Municipalities => &config.sources.municipalities_csv,
        }
    }
}

/// What to do with the remaining sources when one fails to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Abort,
    Continue,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferenceOutcome {
    pub reference: ReferenceKind,
    pub table: String,
    pub path: PathBuf,
    pub rows: Option<u64>,
    pub error: Option<String>,
}

impl ReferenceOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Loads curated mapping CSVs into reference tables, replacing any previous copy.
pub struct ReferenceLoader {
    delimiter: u8,
    encoding: TextEncoding,
    normalizer: SubstanceNormalizer,
}

impl ReferenceLoader {
    pub fn new(delimiter: u8, encoding: TextEncoding, normalizer: SubstanceNormalizer) -> Self {
        Self {
            delimiter,
            encoding,
            normalizer,
        }
    }

    pub fn from_config(config: &EtlConfig) -> Self {
        Self::new(
            config.delimiter_byte(),
            config.sources.reference_encoding,
            SubstanceNormalizer::default(),
        )
    }

    pub fn load_controlled(&self, db: &mut DatabaseManager, path: &Path) -> Result<u64> {
        self.load(db, ReferenceKind::Controlled, path)
    }

    pub fn load_atc(&self, db: &mut DatabaseManager, path: &Path) -> Result<u64> {
        self.load(db, ReferenceKind::Atc, path)
    }

    pub fn load_municipalities(&self, db: &mut DatabaseManager, path: &Path) -> Result<u64> {
        self.load(db, ReferenceKind::Municipalities, path)
    }

    /// Load one source. Failures are reported as `EtlError::Reference` naming it,
    /// and leave any previously loaded table in place.
    #[instrument(skip(self, db), fields(reference = kind.name(), path = %path.display()))]
    pub fn load(&self, db: &mut DatabaseManager, kind: ReferenceKind, path: &Path) -> Result<u64> {
        self.load_table(db, kind, path)
            .map_err(|e| EtlError::in_reference(kind.name(), e))
    }

    /// Load every source, stopping at the first failure under `FailurePolicy::Abort`.
    pub fn load_all(
        &self,
        db: &mut DatabaseManager,
        config: &EtlConfig,
        policy: FailurePolicy,
    ) -> Result<Vec<ReferenceOutcome>> {
        let mut outcomes = Vec::with_capacity(ReferenceKind::ALL.len());
        for kind in ReferenceKind::ALL {
            let path = kind.source_path(config);
            match self.load(db, kind, path) {
                Ok(rows) => outcomes.push(ReferenceOutcome {
                    reference: kind,
                    table: kind.table().to_string(),
                    path: path.to_path_buf(),
                    rows: Some(rows),
                    error: None,
                }),
                Err(e) if policy == FailurePolicy::Continue => {
                    error!("❌ {}", e);
                    outcomes.push(ReferenceOutcome {
                        reference: kind,
                        table: kind.table().to_string(),
                        path: path.to_path_buf(),
                        rows: None,
                        error: Some(e.to_string()),
                    });
                }
                Err(e) => return Err(e),
            }
        }
        Ok(outcomes)
    }

    fn load_table(
        &self,
        db: &mut DatabaseManager,
        kind: ReferenceKind,
        path: &Path,
    ) -> Result<u64> {
        let mut source = CsvSource::open(path, self.delimiter, self.encoding)?;
        source.require_columns(kind.required_columns())?;

        // Stored columns in file order; a supplied join_key is always recomputed
        let mut seen = HashSet::new();
        let mut kept: Vec<(usize, String)> = Vec::new();
        for (i, header) in source.headers().iter().enumerate() {
            if header.is_empty() || header == "join_key" {
                continue;
            }
            if !seen.insert(header.clone()) {
                warn!("Duplicate column '{}' in {}, keeping the first", header, path.display());
                continue;
            }
            kept.push((i, header.clone()));
        }

        let mut columns: Vec<String> = kept.iter().map(|(_, name)| name.clone()).collect();
        let add_exclusion =
            kind == ReferenceKind::Controlled && !columns.iter().any(|c| c == "exclusao_lista");
        if add_exclusion {
            columns.push("exclusao_lista".to_string());
        }
        if kind.is_text_joined() {
            columns.push("join_key".to_string());
        }

        let substance_pos = source.column_index("principio_ativo");
        let table = quote_ident(kind.table());
        let column_defs = columns
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {table} ({}) VALUES ({})",
            columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            (1..=columns.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
        );

        let tx = db.conn_mut().transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({column_defs});"
        ))?;

        let mut rows = 0u64;
        {
            let mut stmt = tx.prepare(&insert_sql)?;
            while let Some(record) = source.next_record()? {
                let mut values: Vec<Option<String>> = kept
                    .iter()
                    .map(|(i, name)| {
                        let value = record.get(*i).cloned().flatten();
                        if name == "id_municipio" {
                            value.map(|v| clean_municipality_id(&v))
                        } else {
                            value
                        }
                    })
                    .collect();
                if add_exclusion {
                    values.push(None);
                }
                if kind.is_text_joined() {
                    let key = substance_pos
                        .and_then(|i| record.get(i).cloned().flatten())
                        .and_then(|name| self.normalizer.join_key(&name));
                    values.push(key);
                }
                stmt.execute(params_from_iter(values))?;
                rows += 1;
            }
        }
        tx.commit()?;

        info!("✅ Loaded {} rows into '{}'", rows, kind.table());
        Ok(rows)
    }
}

/// Municipality ids exported through float columns arrive as "3550308.0"
pub fn clean_municipality_id(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed.strip_suffix(".0").unwrap_or(trimmed).to_string()
}

#[derive(Debug, Clone, Serialize)]
pub struct DedupeReport {
    pub rows_read: u64,
    pub rows_written: u64,
}

/// Rewrite a mapping CSV keeping only the first row for each value of `key_column`.
/// Rows whose key is empty are all kept.
pub fn dedupe_mapping_csv(
    input: &Path,
    output: &Path,
    key_column: &str,
    delimiter: u8,
    encoding: TextEncoding,
) -> Result<DedupeReport> {
    let mut source = CsvSource::open(input, delimiter, encoding)?;
    let key_pos = source.require_columns(&[key_column])?[0];

    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .from_path(output)
        .map_err(|e| EtlError::csv(output, e))?;
    writer
        .write_record(source.headers())
        .map_err(|e| EtlError::csv(output, e))?;

    let mut seen = HashSet::new();
    let mut report = DedupeReport {
        rows_read: 0,
        rows_written: 0,
    };
    while let Some(record) = source.next_record()? {
        report.rows_read += 1;
        let key = record
            .get(key_pos)
            .cloned()
            .flatten()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty());
        if let Some(key) = key {
            if !seen.insert(key) {
                continue;
            }
        }
        writer
            .write_record(record.iter().map(|v| v.as_deref().unwrap_or("")))
            .map_err(|e| EtlError::csv(output, e))?;
        report.rows_written += 1;
    }
    writer.flush()?;

    info!(
        "Deduplicated {}: {} rows read, {} written to {}",
        input.display(),
        report.rows_read,
        report.rows_written,
        output.display()
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader() -> ReferenceLoader {
        ReferenceLoader::new(b',', TextEncoding::Utf8, SubstanceNormalizer::default())
    }

    #[test]
    fn test_controlled_mapping_gets_join_key_and_exclusion_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controlados.csv");
        std::fs::write(
            &path,
            "Principio Ativo,Lista,Inclusao Lista\nCloridrato de Sertralina,C1,01/01/2000\n",
        )
        .unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        assert_eq!(loader().load_controlled(&mut db, &path).unwrap(), 1);
        assert_eq!(
            db.table_columns(CONTROLLED_TABLE).unwrap(),
            vec!["principio_ativo", "lista", "inclusao_lista", "exclusao_lista", "join_key"]
        );
        let (key, excl): (String, Option<String>) = db
            .conn()
            .query_row(
                "SELECT join_key, exclusao_lista FROM mapeamento_controlados",
                [],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .unwrap();
        assert_eq!(key, "SERTRALINA");
        assert_eq!(excl, None);
    }

    #[test]
    fn test_municipality_ids_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("municipios.csv");
        std::fs::write(&path, "id_municipio,nome_municipio\n 3550308.0 ,São Paulo\n").unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        loader().load_municipalities(&mut db, &path).unwrap();
        let id: String = db
            .conn()
            .query_row("SELECT id_municipio FROM mapeamento_municipios", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, "3550308");
        assert_eq!(clean_municipality_id("12.05"), "12.05");
    }

    #[test]
    fn test_failure_names_source_and_keeps_previous_table() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("atc.csv");
        std::fs::write(
            &good,
            "principio_ativo,codigo_atc,classe_terapeutica\nSERTRALINA,N06AB06,Antidepressivos\n",
        )
        .unwrap();
        let bad = dir.path().join("atc_bad.csv");
        std::fs::write(&bad, "principio_ativo,classe_terapeutica\nX,Y\n").unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        loader().load_atc(&mut db, &good).unwrap();
        let err = loader().load_atc(&mut db, &bad).unwrap_err();
        assert!(matches!(err, EtlError::Reference { reference: "atc", .. }));
        assert_eq!(db.count_rows(ATC_TABLE).unwrap(), 1);
    }

    #[test]
    fn test_load_all_continue_reports_each_source() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EtlConfig::default();
        config.sources.controlled_csv = dir.path().join("missing.csv");
        config.sources.atc_csv = dir.path().join("atc.csv");
        config.sources.municipalities_csv = dir.path().join("mun.csv");
        std::fs::write(
            &config.sources.atc_csv,
            "principio_ativo,codigo_atc,classe_terapeutica\nA,N01,X\nB,N02,Y\n",
        )
        .unwrap();
        std::fs::write(&config.sources.municipalities_csv, "id_municipio,nome_municipio\n1,A\n")
            .unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        let outcomes = loader()
            .load_all(&mut db, &config, FailurePolicy::Continue)
            .unwrap();
        assert_eq!(outcomes.len(), 3);
        assert!(!outcomes[0].is_success());
        assert_eq!(outcomes[1].rows, Some(2));
        assert_eq!(outcomes[2].rows, Some(1));

        let err = loader()
            .load_all(&mut db, &config, FailurePolicy::Abort)
            .unwrap_err();
        assert!(matches!(err, EtlError::Reference { reference: "controlled", .. }));
    }

    #[test]
    fn test_dedupe_mapping_keeps_first_row_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        std::fs::write(
            &input,
            "principio_ativo,codigo_atc\nSERTRALINA,N06AB06\nSERTRALINA ,N06AB99\n,Z\n,Z\nFLUOXETINA,N06AB03\n",
        )
        .unwrap();

        let report =
            dedupe_mapping_csv(&input, &output, "principio_ativo", b',', TextEncoding::Utf8)
                .unwrap();
        assert_eq!(report.rows_read, 5);
        assert_eq!(report.rows_written, 4);
        let written = std::fs::read_to_string(&output).unwrap();
        assert!(written.contains("SERTRALINA,N06AB06"));
        assert!(!written.contains("N06AB99"));
    }
}
