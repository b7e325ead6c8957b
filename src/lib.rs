pub mod config;
pub mod constants;
pub mod db;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod report;

pub use config::EtlConfig;
pub use db::DatabaseManager;
pub use error::{EtlError, Result};
pub use pipeline::{Pipeline, PipelineResult};
