use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants;
use crate::error::{EtlError, Result};
use crate::pipeline::ingestion::csv_source::TextEncoding;

pub const DEFAULT_CONFIG_PATH: &str = "etl.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EtlConfig {
    pub database: DatabaseConfig,
    pub sources: SourcesConfig,
    pub ingest: IngestConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub fact_table: String,
    pub staging_table: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("dados/sngpc_analytics.db"),
            fact_table: constants::FACT_TABLE.to_string(),
            staging_table: constants::STAGING_TABLE.to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub raw_dir: PathBuf,
    pub controlled_csv: PathBuf,
    pub atc_csv: PathBuf,
    pub municipalities_csv: PathBuf,
    pub raw_encoding: TextEncoding,
    pub reference_encoding: TextEncoding,
    pub delimiter: char,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("dados/dados_Originais"),
            controlled_csv: PathBuf::from("dados/mapeamento_Controlados.csv"),
            atc_csv: PathBuf::from("dados/mapeamento_atc.csv"),
            municipalities_csv: PathBuf::from("dados/mapeamento_municipios.csv"),
            raw_encoding: TextEncoding::Latin1,
            reference_encoding: TextEncoding::Utf8,
            delimiter: ',',
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub batch_size: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: constants::DEFAULT_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Prometheus exposition text is written here after a run when set
    pub textfile: Option<PathBuf>,
}

impl EtlConfig {
    /// Load the configuration file if it exists, otherwise fall back to defaults.
    /// Environment overrides are applied afterwards.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path.is_some();
        let config_path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        let mut config = if config_path.exists() {
            let content = fs::read_to_string(config_path).map_err(|e| {
                EtlError::Config(format!(
                    "Failed to read config file '{}': {}",
                    config_path.display(),
                    e
                ))
            })?;
            Self::from_toml_str(&content)?
        } else if explicit {
            return Err(EtlError::Config(format!(
                "Config file '{}' not found",
                config_path.display()
            )));
        } else {
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EtlConfig = toml::from_str(content)?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("SNGPC_DB_PATH") {
            if !path.trim().is_empty() {
                self.database.path = PathBuf::from(path);
            }
        }
        if let Ok(dir) = std::env::var("SNGPC_RAW_DIR") {
            if !dir.trim().is_empty() {
                self.sources.raw_dir = PathBuf::from(dir);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest.batch_size == 0 {
            return Err(EtlError::Config("ingest.batch_size must be greater than zero".to_string()));
        }
        for (key, name) in [
            ("database.fact_table", &self.database.fact_table),
            ("database.staging_table", &self.database.staging_table),
        ] {
            if !is_plain_identifier(name) {
                return Err(EtlError::Config(format!(
                    "{key} must be a non-empty identifier of letters, digits and '_', got '{name}'"
                )));
            }
        }
        if self.database.fact_table == self.database.staging_table {
            return Err(EtlError::Config(
                "database.fact_table and database.staging_table must differ".to_string(),
            ));
        }
        if !self.sources.delimiter.is_ascii() {
            return Err(EtlError::Config(
                "sources.delimiter must be an ASCII character".to_string(),
            ));
        }
        Ok(())
    }

    pub fn delimiter_byte(&self) -> u8 {
        self.sources.delimiter as u8
    }
}

/// Table names end up inside SQL text, so only plain identifiers are accepted
pub fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_reference_layout() {
        let config = EtlConfig::default();
        assert_eq!(config.database.fact_table, "prescricoes");
        assert_eq!(config.ingest.batch_size, 500_000);
        assert_eq!(config.sources.raw_encoding, TextEncoding::Latin1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_other_defaults() {
        let config = EtlConfig::from_toml_str(
            r#"
            [database]
            path = "/tmp/x.db"

            [ingest]
            batch_size = 10

            [sources]
            raw_encoding = "utf8"
            delimiter = ";"
            "#,
        )
        .unwrap();
        assert_eq!(config.database.path, PathBuf::from("/tmp/x.db"));
        assert_eq!(config.database.staging_table, "prescricoes_raw");
        assert_eq!(config.ingest.batch_size, 10);
        assert_eq!(config.sources.raw_encoding, TextEncoding::Utf8);
        assert_eq!(config.delimiter_byte(), b';');
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EtlConfig::default();
        config.ingest.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = EtlConfig::default();
        config.database.fact_table = "drop table; --".to_string();
        assert!(config.validate().is_err());

        let mut config = EtlConfig::default();
        config.database.staging_table = config.database.fact_table.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_identifier_check() {
        assert!(is_plain_identifier("prescricoes_2024"));
        assert!(is_plain_identifier("_tmp"));
        assert!(!is_plain_identifier("1abc"));
        assert!(!is_plain_identifier(""));
        assert!(!is_plain_identifier("a-b"));
    }
}
