// Pipeline processing: canonicalization, derivation, remediation and annotation

pub mod derive;
pub mod fact_builder;
pub mod normalize;
pub mod outliers;
pub mod validity;
