use chrono::NaiveDate;
use metrics::counter;
use rusqlite::{params_from_iter, types::Value, Row};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{info, instrument, warn};

use super::derive;
use crate::constants::{
    ATC_TABLE, BUILDING_SUFFIX, CONTROLLED_TABLE, MUNICIPALITIES_TABLE, NOT_CLASSIFIED,
    NOT_MAPPED, UNKNOWN_MUNICIPALITY,
};
use crate::db::{quote_ident, DatabaseManager};
use crate::error::Result;
use crate::pipeline::ingestion::reference::clean_municipality_id;
use crate::pipeline::processing::normalize::SubstanceNormalizer;

/// Fact table schema in declaration order
pub const FACT_COLUMNS: [(&str, &str); 26] = [
    ("ano", "INTEGER"),
    ("mes", "INTEGER"),
    ("data", "TEXT"),
    ("sigla_uf", "TEXT"),
    ("id_municipio", "TEXT"),
    ("nome_municipio", "TEXT"),
    ("principio_ativo", "TEXT"),
    ("descricao_apresentacao", "TEXT"),
    ("dosagem", "TEXT"),
    ("forma_farmaceutica", "TEXT"),
    ("quantidade_vendida", "REAL"),
    ("unidade_medida", "TEXT"),
    ("conselho_prescritor", "TEXT"),
    ("sigla_uf_conselho_prescritor", "TEXT"),
    ("tipo_receituario", "TEXT"),
    ("cid10", "TEXT"),
    ("sexo", "TEXT"),
    ("idade", "INTEGER"),
    ("unidade_idade", "TEXT"),
    ("codigo_atc", "TEXT"),
    ("classe_terapeutica", "TEXT"),
    ("anvisa_lista", "TEXT"),
    ("faixa_etaria", "TEXT"),
    ("periodo_valido_controlado", "INTEGER"),
    ("idade_modificada_flag", "INTEGER"),
    ("quantidade_modificada_flag", "INTEGER"),
];

/// Name of the table a build writes into before publication
pub fn building_table_name(fact_table: &str) -> String {
    format!("{fact_table}{BUILDING_SUFFIX}")
}

/// The controlled-list membership chosen for one join key
#[derive(Debug, Clone, PartialEq)]
pub struct ControlledEntry {
    pub lista: Option<String>,
    pub inclusion_raw: Option<String>,
    pub exclusion_raw: Option<String>,
    pub inclusion: Option<NaiveDate>,
    pub exclusion: Option<NaiveDate>,
}

impl ControlledEntry {
    pub fn new(
        lista: Option<String>,
        inclusion_raw: Option<String>,
        exclusion_raw: Option<String>,
    ) -> Self {
        let inclusion = derive::parse_reference_date(inclusion_raw.as_deref());
        let exclusion = derive::parse_reference_date(exclusion_raw.as_deref());
        Self {
            lista,
            inclusion_raw,
            exclusion_raw,
            inclusion,
            exclusion,
        }
    }

    /// Latest parsed inclusion first (unparseable last), then lowest list code.
    /// `Ordering::Less` means `self` is preferred.
    fn preference(&self, other: &Self) -> Ordering {
        other
            .inclusion
            .cmp(&self.inclusion)
            .then_with(|| nulls_last(&self.lista, &other.lista))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AtcEntry {
    pub codigo_atc: Option<String>,
    pub classe_terapeutica: Option<String>,
}

fn nulls_last(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Keep the incumbent unless the candidate is strictly preferred, so ties go to
/// the first row read.
fn keep_preferred<T>(
    map: &mut HashMap<String, T>,
    key: String,
    candidate: T,
    prefer: impl Fn(&T, &T) -> Ordering,
) {
    match map.get_mut(&key) {
        Some(current) => {
            if prefer(&candidate, current) == Ordering::Less {
                *current = candidate;
            }
        }
        None => {
            map.insert(key, candidate);
        }
    }
}

/// One deduplicated reference row per key, held in memory for the build.
#[derive(Debug, Default)]
pub struct ReferenceIndex {
    controlled: HashMap<String, ControlledEntry>,
    atc: HashMap<String, AtcEntry>,
    municipalities: HashMap<String, Option<String>>,
}

impl ReferenceIndex {
    /// Read the three reference tables; each must have been loaded.
    pub fn load(db: &DatabaseManager) -> Result<Self> {
        for table in [CONTROLLED_TABLE, ATC_TABLE, MUNICIPALITIES_TABLE] {
            db.require_table(table)?;
        }
        let mut index = Self::default();

        let mut stmt = db.conn().prepare(&format!(
            "SELECT join_key, lista, inclusao_lista, exclusao_lista FROM {} ORDER BY rowid",
            quote_ident(CONTROLLED_TABLE)
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let Some(key) = row.get::<_, Option<String>>(0)? else {
                continue;
            };
            let entry = ControlledEntry::new(row.get(1)?, row.get(2)?, row.get(3)?);
            index.insert_controlled(key, entry);
        }

        let mut stmt = db.conn().prepare(&format!(
            "SELECT join_key, codigo_atc, classe_terapeutica FROM {} ORDER BY rowid",
            quote_ident(ATC_TABLE)
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let Some(key) = row.get::<_, Option<String>>(0)? else {
                continue;
            };
            index.insert_atc(
                key,
                AtcEntry {
                    codigo_atc: row.get(1)?,
                    classe_terapeutica: row.get(2)?,
                },
            );
        }

        let mut stmt = db.conn().prepare(&format!(
            "SELECT id_municipio, nome_municipio FROM {} ORDER BY rowid",
            quote_ident(MUNICIPALITIES_TABLE)
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let Some(id) = row.get::<_, Option<String>>(0)? else {
                continue;
            };
            index.insert_municipality(&id, row.get(1)?);
        }

        info!(
            "Reference index: {} controlled keys, {} ATC keys, {} municipalities",
            index.controlled.len(),
            index.atc.len(),
            index.municipalities.len()
        );
        Ok(index)
    }

    pub fn insert_controlled(&mut self, key: String, entry: ControlledEntry) {
        keep_preferred(&mut self.controlled, key, entry, |a, b| a.preference(b));
    }

    pub fn insert_atc(&mut self, key: String, entry: AtcEntry) {
        keep_preferred(&mut self.atc, key, entry, |a, b| {
            nulls_last(&a.codigo_atc, &b.codigo_atc)
        });
    }

    pub fn insert_municipality(&mut self, id: &str, name: Option<String>) {
        self.municipalities
            .entry(clean_municipality_id(id))
            .or_insert(name);
    }

    pub fn controlled(&self, key: &str) -> Option<&ControlledEntry> {
        self.controlled.get(key)
    }

    pub fn atc(&self, key: &str) -> Option<&AtcEntry> {
        self.atc.get(key)
    }

    /// `None` when the id is unknown; `Some(None)` when mapped without a name.
    pub fn municipality(&self, id: &str) -> Option<&Option<String>> {
        self.municipalities.get(id)
    }
}

/// One staging row as read back from the database
#[derive(Debug, Clone, Default)]
pub struct RawRow {
    pub ano: Option<String>,
    pub mes: Option<String>,
    pub sigla_uf: Option<String>,
    pub id_municipio: Option<String>,
    pub principio_ativo: Option<String>,
    pub descricao_apresentacao: Option<String>,
    pub quantidade_vendida: Option<String>,
    pub unidade_medida: Option<String>,
    pub conselho_prescritor: Option<String>,
    pub sigla_uf_conselho_prescritor: Option<String>,
    pub tipo_receituario: Option<String>,
    pub cid10: Option<String>,
    pub sexo: Option<String>,
    pub idade: Option<String>,
    pub unidade_idade: Option<String>,
    pub join_key: Option<String>,
}

impl RawRow {
    const SELECT_COLUMNS: &'static str = "ano, mes, sigla_uf, id_municipio, principio_ativo, \
        descricao_apresentacao, quantidade_vendida, unidade_medida, conselho_prescritor, \
        sigla_uf_conselho_prescritor, tipo_receituario, cid10, sexo, idade, unidade_idade";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ano: row.get(0)?,
            mes: row.get(1)?,
            sigla_uf: row.get(2)?,
            id_municipio: row.get(3)?,
            principio_ativo: row.get(4)?,
            descricao_apresentacao: row.get(5)?,
            quantidade_vendida: row.get(6)?,
            unidade_medida: row.get(7)?,
            conselho_prescritor: row.get(8)?,
            sigla_uf_conselho_prescritor: row.get(9)?,
            tipo_receituario: row.get(10)?,
            cid10: row.get(11)?,
            sexo: row.get(12)?,
            idade: row.get(13)?,
            unidade_idade: row.get(14)?,
            join_key: row.get(15)?,
        })
    }
}

/// A derived fact row before remediation
#[derive(Debug, Clone, PartialEq)]
pub struct FactRow {
    pub ano: i32,
    pub mes: u32,
    pub data: NaiveDate,
    pub sigla_uf: Option<String>,
    pub id_municipio: Option<String>,
    pub nome_municipio: String,
    pub principio_ativo: Option<String>,
    pub descricao_apresentacao: Option<String>,
    pub dosagem: Option<String>,
    pub forma_farmaceutica: &'static str,
    pub quantidade_vendida: Option<f64>,
    pub unidade_medida: Option<String>,
    pub conselho_prescritor: Option<String>,
    pub sigla_uf_conselho_prescritor: Option<String>,
    pub tipo_receituario: Option<String>,
    pub cid10: String,
    pub sexo: &'static str,
    pub idade: Option<i64>,
    pub unidade_idade: Option<String>,
    pub codigo_atc: String,
    pub classe_terapeutica: String,
    pub anvisa_lista: String,
}

impl FactRow {
    /// Derive the fact row; `None` when year/month do not form a calendar date.
    pub fn derive(raw: &RawRow, refs: &ReferenceIndex) -> Option<Self> {
        let (ano, mes, data) = derive::first_of_month(raw.ano.as_deref(), raw.mes.as_deref())?;

        let id_municipio = raw
            .id_municipio
            .as_deref()
            .map(clean_municipality_id)
            .filter(|id| !id.is_empty());
        let nome_municipio = id_municipio
            .as_deref()
            .and_then(|id| refs.municipality(id))
            .cloned()
            .flatten()
            .unwrap_or_else(|| UNKNOWN_MUNICIPALITY.to_string());

        let key = raw.join_key.as_deref();
        let atc = key.and_then(|k| refs.atc(k));
        let controlled = key.and_then(|k| refs.controlled(k));

        Some(Self {
            ano,
            mes,
            data,
            sigla_uf: derive::normalize_state(raw.sigla_uf.as_deref()),
            id_municipio,
            nome_municipio,
            principio_ativo: raw.principio_ativo.clone(),
            descricao_apresentacao: raw.descricao_apresentacao.clone(),
            dosagem: derive::extract_dosage(raw.descricao_apresentacao.as_deref()),
            forma_farmaceutica: derive::classify_dosage_form(raw.descricao_apresentacao.as_deref()),
            quantidade_vendida: derive::parse_quantity(raw.quantidade_vendida.as_deref()),
            unidade_medida: raw.unidade_medida.clone(),
            conselho_prescritor: raw.conselho_prescritor.clone(),
            sigla_uf_conselho_prescritor: raw.sigla_uf_conselho_prescritor.clone(),
            tipo_receituario: raw.tipo_receituario.clone(),
            cid10: derive::cid_or_sentinel(raw.cid10.as_deref()),
            sexo: derive::map_sex(raw.sexo.as_deref()),
            idade: derive::parse_age(raw.idade.as_deref()),
            unidade_idade: raw.unidade_idade.clone(),
            codigo_atc: atc
                .and_then(|a| a.codigo_atc.clone())
                .unwrap_or_else(|| NOT_CLASSIFIED.to_string()),
            classe_terapeutica: atc
                .and_then(|a| a.classe_terapeutica.clone())
                .unwrap_or_else(|| NOT_CLASSIFIED.to_string()),
            anvisa_lista: controlled
                .and_then(|c| c.lista.clone())
                .unwrap_or_else(|| NOT_MAPPED.to_string()),
        })
    }

    /// Values in `FACT_COLUMNS` order; stage-owned columns start unset.
    fn into_values(self) -> Vec<Value> {
        fn text(v: Option<String>) -> Value {
            v.map(Value::Text).unwrap_or(Value::Null)
        }
        vec![
            Value::Integer(self.ano as i64),
            Value::Integer(self.mes as i64),
            Value::Text(self.data.format("%Y-%m-%d").to_string()),
            text(self.sigla_uf),
            text(self.id_municipio),
            Value::Text(self.nome_municipio),
            text(self.principio_ativo),
            text(self.descricao_apresentacao),
            text(self.dosagem),
            Value::Text(self.forma_farmaceutica.to_string()),
            self.quantidade_vendida.map(Value::Real).unwrap_or(Value::Null),
            text(self.unidade_medida),
            text(self.conselho_prescritor),
            text(self.sigla_uf_conselho_prescritor),
            text(self.tipo_receituario),
            Value::Text(self.cid10),
            Value::Text(self.sexo.to_string()),
            self.idade.map(Value::Integer).unwrap_or(Value::Null),
            text(self.unidade_idade),
            Value::Text(self.codigo_atc),
            Value::Text(self.classe_terapeutica),
            Value::Text(self.anvisa_lista),
            Value::Null,
            Value::Null,
            Value::Integer(0),
            Value::Integer(0),
        ]
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FactBuildReport {
    pub building_table: String,
    pub staging_rows: u64,
    pub inserted_rows: u64,
    pub excluded_invalid_date: u64,
    pub unknown_municipality: u64,
    pub without_atc: u64,
    pub without_controlled_list: u64,
}

/// Builds the fact table from normalized staging rows under a temporary name.
pub struct FactBuilder {
    staging_table: String,
    fact_table: String,
    normalizer: SubstanceNormalizer,
}

impl FactBuilder {
    pub fn new(staging_table: &str, fact_table: &str) -> Self {
        Self {
            staging_table: staging_table.to_string(),
            fact_table: fact_table.to_string(),
            normalizer: SubstanceNormalizer::default(),
        }
    }

    pub fn building_table(&self) -> String {
        building_table_name(&self.fact_table)
    }

    /// Stream staging rows through `FactRow::derive` into the building table.
    /// The production table is not touched.
    #[instrument(skip(self, db, refs), fields(staging = %self.staging_table))]
    pub fn build(
        &self,
        db: &mut DatabaseManager,
        refs: &ReferenceIndex,
    ) -> Result<FactBuildReport> {
        db.require_table(&self.staging_table)?;
        let building = self.building_table();
        let has_join_key = db
            .table_columns(&self.staging_table)?
            .iter()
            .any(|c| c == "join_key");
        if !has_join_key {
            warn!("Staging table has no join_key column, canonicalizing names on the fly");
        }

        let column_defs = FACT_COLUMNS
            .iter()
            .map(|(name, ty)| format!("{} {}", quote_ident(name), ty))
            .collect::<Vec<_>>()
            .join(", ");
        let insert_sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(&building),
            FACT_COLUMNS.iter().map(|(name, _)| quote_ident(name)).collect::<Vec<_>>().join(", "),
            (1..=FACT_COLUMNS.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ")
        );
        let select_sql = format!(
            "SELECT {}, {} FROM {}",
            RawRow::SELECT_COLUMNS,
            if has_join_key { "join_key" } else { "NULL" },
            quote_ident(&self.staging_table)
        );

        let mut report = FactBuildReport {
            building_table: building.clone(),
            ..Default::default()
        };

        let tx = db.conn_mut().transaction()?;
        tx.execute_batch(&format!(
            "DROP TABLE IF EXISTS {b}; CREATE TABLE {b} ({column_defs});",
            b = quote_ident(&building)
        ))?;
        {
            let mut select = tx.prepare(&select_sql)?;
            let mut insert = tx.prepare(&insert_sql)?;
            let mut rows = select.query([])?;
            while let Some(row) = rows.next()? {
                report.staging_rows += 1;
                let mut raw = RawRow::from_row(row)?;
                if !has_join_key {
                    // names are still raw here; canonicalize so validity joins on the same key
                    raw.principio_ativo = raw
                        .principio_ativo
                        .as_deref()
                        .map(|name| self.normalizer.canonicalize(name));
                    raw.join_key = raw
                        .principio_ativo
                        .as_deref()
                        .and_then(|name| self.normalizer.join_key(name));
                }
                let Some(fact) = FactRow::derive(&raw, refs) else {
                    report.excluded_invalid_date += 1;
                    continue;
                };
                if fact.nome_municipio == UNKNOWN_MUNICIPALITY {
                    report.unknown_municipality += 1;
                }
                if fact.codigo_atc == NOT_CLASSIFIED {
                    report.without_atc += 1;
                }
                if fact.anvisa_lista == NOT_MAPPED {
                    report.without_controlled_list += 1;
                }
                insert.execute(params_from_iter(fact.into_values()))?;
                report.inserted_rows += 1;
            }
        }
        tx.commit()?;

        counter!("sngpc_rows_excluded_invalid_date_total").increment(report.excluded_invalid_date);
        counter!("sngpc_fact_rows_built_total").increment(report.inserted_rows);
        if report.excluded_invalid_date > 0 {
            warn!(
                "{} rows excluded: year/month do not form a valid date",
                report.excluded_invalid_date
            );
        }
        info!(
            "✅ Built '{}' with {} rows from {} staging rows",
            building, report.inserted_rows, report.staging_rows
        );
        Ok(report)
    }
}

/// Replace the production table with the building table in one transaction.
#[instrument(skip(db))]
pub fn publish_fact_table(db: &mut DatabaseManager, fact_table: &str) -> Result<u64> {
    let building = building_table_name(fact_table);
    db.require_table(&building)?;

    let tx = db.conn_mut().transaction()?;
    tx.execute_batch(&format!(
        "DROP TABLE IF EXISTS {fact}; ALTER TABLE {building} RENAME TO {fact};",
        fact = quote_ident(fact_table),
        building = quote_ident(&building)
    ))?;
    tx.commit()?;

    let rows = db.count_rows(fact_table)?;
    info!("🚀 Published '{}' ({} rows)", fact_table, rows);
    Ok(rows)
}
