use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("CSV error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("Failed to load {path}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("TOML deserialization failed: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No .csv files found in {dir}")]
    NoSourceFiles { dir: PathBuf },

    #[error("{path} is missing required column '{column}'")]
    MissingColumn { path: PathBuf, column: String },

    #[error("Table '{table}' does not exist; load it before running this stage")]
    MissingTable { table: String },

    #[error("Reference '{reference}' failed: {source}")]
    Reference {
        reference: &'static str,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: &'static str,
        #[source]
        source: Box<EtlError>,
    },

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl EtlError {
    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        EtlError::Csv {
            path: path.into(),
            source,
        }
    }

    pub fn load(path: impl Into<PathBuf>, source: rusqlite::Error) -> Self {
        EtlError::Load {
            path: path.into(),
            source,
        }
    }

    pub fn in_stage(stage: &'static str, source: EtlError) -> Self {
        EtlError::Stage {
            stage,
            source: Box::new(source),
        }
    }

    pub fn in_reference(reference: &'static str, source: EtlError) -> Self {
        EtlError::Reference {
            reference,
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, EtlError>;
