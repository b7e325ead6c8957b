use csv::{ByteRecord, ReaderBuilder};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{EtlError, Result};

/// Byte encoding of a CSV source. Government extracts ship as Latin-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextEncoding {
    Latin1,
    Utf8,
}

impl TextEncoding {
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            // Latin-1 maps every byte to the code point of the same value
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Normalize a header cell: lowercase, trim, spaces to underscores.
pub fn normalize_column_name(raw: &str) -> String {
    raw.trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .replace(' ', "_")
}

/// Streaming reader over one CSV file with normalized headers and decoded fields.
pub struct CsvSource {
    path: PathBuf,
    reader: csv::Reader<File>,
    headers: Vec<String>,
    encoding: TextEncoding,
    record: ByteRecord,
}

impl CsvSource {
    pub fn open(path: &Path, delimiter: u8, encoding: TextEncoding) -> Result<Self> {
        let mut reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(false)
            .from_path(path)
            .map_err(|e| EtlError::csv(path, e))?;

        let headers = reader
            .byte_headers()
            .map_err(|e| EtlError::csv(path, e))?
            .iter()
            .map(|h| normalize_column_name(&encoding.decode(h)))
            .collect();

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            headers,
            encoding,
            record: ByteRecord::new(),
        })
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Position of a normalized column name in the header row
    pub fn column_index(&self, column: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == column)
    }

    /// Resolve each wanted column to its position, failing on the first one absent
    pub fn require_columns(&self, columns: &[&str]) -> Result<Vec<usize>> {
        columns
            .iter()
            .map(|column| {
                self.column_index(column).ok_or_else(|| EtlError::MissingColumn {
                    path: self.path.clone(),
                    column: column.to_string(),
                })
            })
            .collect()
    }

    /// Read the next record; empty cells come back as `None`.
    pub fn next_record(&mut self) -> Result<Option<Vec<Option<String>>>> {
        let more = self
            .reader
            .read_byte_record(&mut self.record)
            .map_err(|e| EtlError::csv(&self.path, e))?;
        if !more {
            return Ok(None);
        }
        let fields = self
            .record
            .iter()
            .map(|field| {
                if field.is_empty() {
                    None
                } else {
                    Some(self.encoding.decode(field))
                }
            })
            .collect();
        Ok(Some(fields))
    }
}

/// List `*.csv` files of a directory, sorted so logs are stable between runs.
pub fn list_csv_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_csv = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("csv"))
            .unwrap_or(false);
        if is_csv && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_normalize_column_name() {
        assert_eq!(normalize_column_name("  Principio Ativo "), "principio_ativo");
        assert_eq!(normalize_column_name("\u{feff}ANO"), "ano");
        assert_eq!(normalize_column_name("id_municipio"), "id_municipio");
    }

    #[test]
    fn test_latin1_decoding() {
        // "SÓDICO" encoded as Latin-1
        let bytes = [b'S', 0xD3, b'D', b'I', b'C', b'O'];
        assert_eq!(TextEncoding::Latin1.decode(&bytes), "SÓDICO");
        assert_eq!(TextEncoding::Utf8.decode("SÓDICO".as_bytes()), "SÓDICO");
    }

    #[test]
    fn test_reads_records_with_empty_cells_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.csv");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "Ano,Principio Ativo,CID10").unwrap();
        writeln!(file, "2019,SERTRALINA,").unwrap();

        let mut source = CsvSource::open(&path, b',', TextEncoding::Utf8).unwrap();
        assert_eq!(source.headers(), ["ano", "principio_ativo", "cid10"]);
        assert_eq!(source.require_columns(&["cid10", "ano"]).unwrap(), vec![2, 0]);
        assert!(matches!(
            source.require_columns(&["sexo"]),
            Err(EtlError::MissingColumn { ref column, .. }) if column == "sexo"
        ));

        let record = source.next_record().unwrap().unwrap();
        assert_eq!(
            record,
            vec![Some("2019".to_string()), Some("SERTRALINA".to_string()), None]
        );
        assert!(source.next_record().unwrap().is_none());
    }

    #[test]
    fn test_ragged_row_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(&path, "a,b\n1,2,3\n").unwrap();

        let mut source = CsvSource::open(&path, b',', TextEncoding::Utf8).unwrap();
        assert!(matches!(source.next_record(), Err(EtlError::Csv { .. })));
    }

    #[test]
    fn test_list_csv_files_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.csv"), "x\n").unwrap();
        std::fs::write(dir.path().join("a.CSV"), "x\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "x\n").unwrap();

        let files = list_csv_files(dir.path()).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.CSV", "b.csv"]);
    }
}
