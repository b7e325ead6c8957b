use metrics::counter;
use rusqlite::params_from_iter;
use serde::Serialize;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

use super::csv_source::{list_csv_files, CsvSource, TextEncoding};
use crate::config::EtlConfig;
use crate::constants::RAW_COLUMNS;
use crate::db::{quote_ident, DatabaseManager};
use crate::error::{EtlError, Result};

/// Rows loaded from one source file
#[derive(Debug, Clone, Serialize)]
pub struct FileIngestReport {
    pub file: String,
    pub rows: u64,
    pub batches: usize,
}

/// Outcome of loading a whole directory into the staging table
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub files: Vec<FileIngestReport>,
    pub total_rows: u64,
}

/// Bulk loader of raw dispensing extracts into the untyped staging table.
pub struct RawIngestor {
    staging_table: String,
    batch_size: usize,
    delimiter: u8,
    encoding: TextEncoding,
}

impl RawIngestor {
    pub fn new(
        staging_table: &str,
        batch_size: usize,
        delimiter: u8,
        encoding: TextEncoding,
    ) -> Self {
        Self {
            staging_table: staging_table.to_string(),
            batch_size: batch_size.max(1),
            delimiter,
            encoding,
        }
    }

    pub fn from_config(config: &EtlConfig) -> Self {
        Self::new(
            &config.database.staging_table,
            config.ingest.batch_size,
            config.delimiter_byte(),
            config.sources.raw_encoding,
        )
    }

    /// Load every CSV file of `dir` into a freshly created staging table.
    ///
    /// Any failure drops the staging table: a partial load is never left behind.
    #[instrument(skip(self, db), fields(dir = %dir.display(), table = %self.staging_table))]
    pub fn ingest_dir(&self, db: &mut DatabaseManager, dir: &Path) -> Result<IngestReport> {
        if !dir.is_dir() {
            return Err(EtlError::NoSourceFiles {
                dir: dir.to_path_buf(),
            });
        }
        let files = list_csv_files(dir)?;
        if files.is_empty() {
            return Err(EtlError::NoSourceFiles {
                dir: dir.to_path_buf(),
            });
        }
        info!("Found {} files to process", files.len());

        self.create_staging_table(db)?;

        let mut report = IngestReport::default();
        for file in &files {
            match self.ingest_file(db, file) {
                Ok(file_report) => {
                    report.total_rows += file_report.rows;
                    report.files.push(file_report);
                }
                Err(e) => {
                    warn!("Ingestion of {} failed, dropping staging table", file.display());
                    db.drop_table(&self.staging_table)?;
                    return Err(e);
                }
            }
        }

        let staged = db.count_rows(&self.staging_table)?;
        info!("✅ {} raw rows loaded into '{}'", staged, self.staging_table);
        counter!("sngpc_raw_files_total").increment(files.len() as u64);
        Ok(report)
    }

    /// Create (or recreate) the staging table with an explicit all-TEXT schema
    pub fn create_staging_table(&self, db: &DatabaseManager) -> Result<()> {
        let columns = RAW_COLUMNS
            .iter()
            .map(|c| format!("{} TEXT", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ");
        let table = quote_ident(&self.staging_table);
        db.conn().execute_batch(&format!(
            "DROP TABLE IF EXISTS {table}; CREATE TABLE {table} ({columns});"
        ))?;
        debug!("Created staging table '{}'", self.staging_table);
        Ok(())
    }

    /// Append one file to the staging table, matching columns by name.
    pub fn ingest_file(&self, db: &mut DatabaseManager, path: &Path) -> Result<FileIngestReport> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        info!("📄 Reading file: {}", file_name);

        let mut source = CsvSource::open(path, self.delimiter, self.encoding)?;
        let positions = source.require_columns(&RAW_COLUMNS)?;

        let extra: Vec<&String> = source
            .headers()
            .iter()
            .filter(|h| !RAW_COLUMNS.contains(&h.as_str()))
            .collect();
        if !extra.is_empty() {
            warn!("{} has columns outside the staging schema, ignoring: {:?}", file_name, extra);
        }

        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&self.staging_table),
            RAW_COLUMNS.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
            (1..=RAW_COLUMNS.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
        );

        let load_err = |e| EtlError::load(path, e);
        let mut rows = 0u64;
        let mut batches = 0usize;
        loop {
            let tx = db.conn_mut().transaction().map_err(load_err)?;
            let mut in_batch = 0usize;
            {
                let mut stmt = tx.prepare_cached(&insert_sql).map_err(load_err)?;
                while in_batch < self.batch_size {
                    let Some(record) = source.next_record()? else {
                        break;
                    };
                    let values = positions
                        .iter()
                        .map(|&i| record.get(i).cloned().flatten());
                    stmt.execute(params_from_iter(values)).map_err(load_err)?;
                    in_batch += 1;
                }
            }
            tx.commit().map_err(load_err)?;

            if in_batch == 0 {
                break;
            }
            batches += 1;
            rows += in_batch as u64;
            debug!("Batch {} of {} ({} rows) committed", batches, file_name, in_batch);
            counter!("sngpc_raw_batches_total").increment(1);
            counter!("sngpc_raw_rows_ingested_total").increment(in_batch as u64);

            if in_batch < self.batch_size {
                break;
            }
        }

        info!("{}: {} rows in {} batches", file_name, rows, batches);
        Ok(FileIngestReport {
            file: file_name,
            rows,
            batches,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "ano,mes,sigla_uf,id_municipio,principio_ativo,descricao_apresentacao,quantidade_vendida,unidade_medida,conselho_prescritor,sigla_uf_conselho_prescritor,tipo_receituario,cid10,sexo,idade,unidade_idade";

    fn ingestor(batch_size: usize) -> RawIngestor {
        RawIngestor::new("staging", batch_size, b',', TextEncoding::Utf8)
    }

    #[test]
    fn test_columns_are_matched_by_name_across_orders() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("a.csv"),
            format!("{HEADER}\n2019,1,SP,3550308,SERTRALINA,X,10,CX,CRM,SP,1,,1,30,1\n"),
        )
        .unwrap();
        // same columns, reversed order and upper-cased headers
        let mut reversed: Vec<&str> = HEADER.split(',').collect();
        reversed.reverse();
        let reversed_header = reversed.join(",").to_uppercase();
        std::fs::write(
            dir.path().join("b.csv"),
            format!("{reversed_header}\n1,45,2,,1,SP,CRM,CX,5,Y,FLUOXETINA,3304557,RJ,2,2020\n"),
        )
        .unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        let report = ingestor(1).ingest_dir(&mut db, dir.path()).unwrap();
        assert_eq!(report.total_rows, 2);
        assert_eq!(report.files.len(), 2);

        let (uf, idade, cid): (String, String, Option<String>) = db
            .conn()
            .query_row(
                "SELECT sigla_uf, idade, cid10 FROM staging WHERE principio_ativo = 'FLUOXETINA'",
                [],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .unwrap();
        assert_eq!(uf, "RJ");
        assert_eq!(idade, "45");
        assert_eq!(cid, None);
    }

    #[test]
    fn test_batches_split_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut content = format!("{HEADER}\n");
        for i in 0..5 {
            content.push_str(&format!("2019,1,SP,1,A{i},X,1,CX,CRM,SP,1,,1,30,1\n"));
        }
        std::fs::write(dir.path().join("a.csv"), content).unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        let report = ingestor(2).ingest_dir(&mut db, dir.path()).unwrap();
        assert_eq!(report.total_rows, 5);
        assert_eq!(report.files[0].batches, 3);
        assert_eq!(db.count_rows("staging").unwrap(), 5);
    }

    #[test]
    fn test_missing_column_fails_and_drops_staging() {
        let dir = tempfile::tempdir().unwrap();
        let header_without_sexo = HEADER.replace(",sexo", "");
        std::fs::write(
            dir.path().join("a.csv"),
            format!("{header_without_sexo}\n2019,1,SP,1,A,X,1,CX,CRM,SP,1,,30,1\n"),
        )
        .unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        let err = ingestor(10).ingest_dir(&mut db, dir.path()).unwrap_err();
        assert!(matches!(err, EtlError::MissingColumn { ref column, .. } if column == "sexo"));
        assert!(!db.table_exists("staging").unwrap());
    }

    #[test]
    fn test_empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut db = DatabaseManager::open_in_memory().unwrap();
        let err = ingestor(10).ingest_dir(&mut db, dir.path()).unwrap_err();
        assert!(matches!(err, EtlError::NoSourceFiles { .. }));
    }

    #[test]
    fn test_insert_failure_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rejected.csv");
        let content = format!("{HEADER}\n2019,1,SP,1,BAD,X,1,CX,CRM,SP,1,,1,30,1\n");
        std::fs::write(&path, content).unwrap();

        let mut db = DatabaseManager::open_in_memory().unwrap();
        let ingestor = ingestor(10);
        ingestor.create_staging_table(&db).unwrap();
        db.conn()
            .execute_batch(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON staging
                 WHEN NEW.principio_ativo = 'BAD'
                 BEGIN SELECT RAISE(ABORT, 'rejected row'); END;",
            )
            .unwrap();

        let err = ingestor.ingest_file(&mut db, &path).unwrap_err();
        assert!(matches!(err, EtlError::Load { path: ref failed, .. } if failed == &path));
        assert!(err.to_string().contains("rejected.csv"));
        assert_eq!(db.count_rows("staging").unwrap(), 0);
    }
}
