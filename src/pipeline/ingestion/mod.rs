// Pipeline ingestion: CSV reading, raw staging loads and reference mappings

pub mod csv_source;
pub mod raw;
pub mod reference;
