/// Table and column names shared by every stage of the ETL.
/// Defaults can be overridden for the fact and staging tables through `EtlConfig`.

// Default table names
pub const FACT_TABLE: &str = "prescricoes";
pub const STAGING_TABLE: &str = "prescricoes_raw";
pub const CONTROLLED_TABLE: &str = "mapeamento_controlados";
pub const ATC_TABLE: &str = "mapeamento_atc";
pub const MUNICIPALITIES_TABLE: &str = "mapeamento_municipios";

/// Suffix of the table the fact builder writes into before publication
pub const BUILDING_SUFFIX: &str = "__building";

/// Reference value for rows per insert batch during raw ingestion
pub const DEFAULT_BATCH_SIZE: usize = 500_000;

/// Columns of the staging table, in declaration order. Every one is TEXT.
pub const RAW_COLUMNS: [&str; 15] = [
    "ano",
    "mes",
    "sigla_uf",
    "id_municipio",
    "principio_ativo",
    "descricao_apresentacao",
    "quantidade_vendida",
    "unidade_medida",
    "conselho_prescritor",
    "sigla_uf_conselho_prescritor",
    "tipo_receituario",
    "cid10",
    "sexo",
    "idade",
    "unidade_idade",
];

/// Filter columns of the fact table that receive a lookup index
pub const INDEXED_COLUMNS: [&str; 9] = [
    "ano",
    "nome_municipio",
    "principio_ativo",
    "data",
    "faixa_etaria",
    "anvisa_lista",
    "sigla_uf",
    "codigo_atc",
    "classe_terapeutica",
];

// Sentinels that keep downstream grouping total
pub const UNKNOWN_MUNICIPALITY: &str = "Unknown";
pub const NOT_CLASSIFIED: &str = "Not classified";
pub const NOT_MAPPED: &str = "Not mapped";
pub const NOT_INFORMED: &str = "Not informed";
pub const NOT_SPECIFIED: &str = "Not specified";

// Plausible human age range, bounds inclusive
pub const MIN_PLAUSIBLE_AGE: i64 = 0;
pub const MAX_PLAUSIBLE_AGE: i64 = 110;

/// Multiplier of the interquartile range for the upper Tukey fence
pub const TUKEY_K: f64 = 1.5;
