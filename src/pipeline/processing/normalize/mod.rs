pub mod terms;

use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::params;
use serde::Serialize;
use tracing::{debug, info, instrument};
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::db::{quote_ident, DatabaseManager};
use crate::error::Result;
use terms::{QualifierTerm, QUALIFIER_TERMS};

static PLUS_SEPARATOR: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\+\s*").unwrap());
static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Canonicalizes active substance names.
///
/// The same instance backs the staging rewrite and the reference join keys, so a
/// staging row and a reference row join exactly when their canonical names are
/// equal.
#[derive(Debug, Clone, Copy)]
pub struct SubstanceNormalizer {
    terms: &'static [QualifierTerm],
}

impl Default for SubstanceNormalizer {
    fn default() -> Self {
        Self {
            terms: QUALIFIER_TERMS,
        }
    }
}

impl SubstanceNormalizer {
    /// Canonical display name. Repeats the passes until the value is stable,
    /// which makes the transform idempotent.
    pub fn canonicalize(&self, raw: &str) -> String {
        let mut current = self.single_pass(raw);
        loop {
            let next = self.single_pass(&current);
            if next == current {
                return current;
            }
            current = next;
        }
    }

    /// Join key for a raw name; `None` when nothing is left after stripping.
    pub fn join_key(&self, raw: &str) -> Option<String> {
        let canonical = self.canonicalize(raw);
        if canonical.is_empty() {
            None
        } else {
            Some(canonical)
        }
    }

    fn single_pass(&self, value: &str) -> String {
        let mut name = fold_case_and_accents(value);

        for term in self.terms {
            if name.contains(term.pattern) {
                name = name
                    .replace(term.pattern, term.replacement)
                    .trim()
                    .to_string();
            }
        }

        let name = PLUS_SEPARATOR.replace_all(&name, " + ");
        WHITESPACE_RUN.replace_all(&name, " ").trim().to_string()
    }
}

/// Trim, uppercase, then drop combining marks from the NFD decomposition.
fn fold_case_and_accents(value: &str) -> String {
    value
        .trim()
        .to_uppercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect()
}

/// Canonicalize with the default term table
pub fn canonical_name(raw: &str) -> String {
    SubstanceNormalizer::default().canonicalize(raw)
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NormalizeReport {
    pub table: String,
    pub distinct_names: usize,
    pub changed_names: usize,
    pub empty_names: usize,
    pub rows_updated: u64,
}

/// Rewrite `principio_ativo` of the staging table and fill its `join_key`.
#[instrument(skip(db, normalizer))]
pub fn normalize_staging(
    db: &mut DatabaseManager,
    table: &str,
    normalizer: &SubstanceNormalizer,
) -> Result<NormalizeReport> {
    let report = rewrite_substance_names(db, table, normalizer)?;
    info!(
        "✅ Normalized {} distinct substance names in '{}' ({} changed, {} empty)",
        report.distinct_names, table, report.changed_names, report.empty_names
    );
    Ok(report)
}

/// Recompute `principio_ativo` and `join_key` of a reference mapping table
/// with the routine used for staging.
#[instrument(skip(db, normalizer))]
pub fn normalize_reference(
    db: &mut DatabaseManager,
    table: &str,
    normalizer: &SubstanceNormalizer,
) -> Result<NormalizeReport> {
    let report = rewrite_substance_names(db, table, normalizer)?;
    debug!(
        "Reference '{}' keys refreshed: {} names, {} rows",
        table, report.distinct_names, report.rows_updated
    );
    Ok(report)
}

/// One UPDATE driven by a temporary `raw -> canonical` table, computed once per
/// distinct name instead of once per row.
fn rewrite_substance_names(
    db: &mut DatabaseManager,
    table: &str,
    normalizer: &SubstanceNormalizer,
) -> Result<NormalizeReport> {
    db.require_table(table)?;
    if !db.table_columns(table)?.iter().any(|c| c == "join_key") {
        db.conn().execute_batch(&format!(
            "ALTER TABLE {} ADD COLUMN join_key TEXT;",
            quote_ident(table)
        ))?;
    }

    let quoted = quote_ident(table);
    let mut report = NormalizeReport {
        table: table.to_string(),
        ..Default::default()
    };

    let tx = db.conn_mut().transaction()?;
    let raw_names: Vec<String> = {
        let mut stmt = tx.prepare(&format!(
            "SELECT DISTINCT principio_ativo FROM {quoted} WHERE principio_ativo IS NOT NULL"
        ))?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        names
    };

    tx.execute_batch(
        "DROP TABLE IF EXISTS temp.substance_names;
         CREATE TEMP TABLE substance_names (raw TEXT PRIMARY KEY, canonical TEXT NOT NULL, join_key TEXT);",
    )?;
    {
        let mut insert = tx.prepare(
            "INSERT INTO temp.substance_names (raw, canonical, join_key) VALUES (?1, ?2, ?3)",
        )?;
        for raw in &raw_names {
            let canonical = normalizer.canonicalize(raw);
            if canonical != *raw {
                report.changed_names += 1;
            }
            let join_key = if canonical.is_empty() {
                report.empty_names += 1;
                None
            } else {
                Some(canonical.clone())
            };
            insert.execute(params![raw, canonical, join_key])?;
        }
    }
    report.distinct_names = raw_names.len();

    report.rows_updated = tx.execute(
        &format!(
            "UPDATE {quoted} SET principio_ativo = m.canonical, join_key = m.join_key
             FROM temp.substance_names AS m
             WHERE {quoted}.principio_ativo = m.raw"
        ),
        [],
    )? as u64;
    tx.execute_batch("DROP TABLE temp.substance_names;")?;
    tx.commit()?;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_salt_term_and_trailing_space_are_removed() {
        assert_eq!(canonical_name("CLORIDRATO DE SERTRALINA  "), "SERTRALINA");
    }

    #[test]
    fn test_regression_corpus() {
        let corpus = [
            ("cloridrato de fluoxetina", "FLUOXETINA"),
            ("Clonazepam", "CLONAZEPAM"),
            ("  ALPRAZOLAM ", "ALPRAZOLAM"),
            ("OXALATO DE ESCITALOPRAM", "ESCITALOPRAM"),
            ("BROMIDRATO DE CITALOPRAM", "CITALOPRAM"),
            ("SULFATO DE MORFINA", "MORFINA"),
            ("FOSFATO DE CODEÍNA", "CODEINA"),
            ("CLORIDRATO DE TRAMADOL", "TRAMADOL"),
            ("HEMISSULFATO DE ANFETAMINA", "ANFETAMINA"),
            ("AMOXICILINA TRI-HIDRATADO", "AMOXICILINA"),
            ("ÁCIDO VALPRÓICO", "ACIDO VALPROICO"),
            ("CLORIDRATO   METILFENIDATO", "METILFENIDATO"),
            ("DECANOATO DE HALOPERIDOL", "HALOPERIDOL"),
        ];
        for (raw, expected) in corpus {
            assert_eq!(canonical_name(raw), expected, "input: {raw:?}");
        }
    }

    #[test]
    fn test_combination_separator_is_spaced() {
        assert_eq!(canonical_name("PARACETAMOL+CODEINA"), "PARACETAMOL + CODEINA");
        assert_eq!(
            canonical_name("FOSFATO DE CODEINA   +  PARACETAMOL"),
            "CODEINA + PARACETAMOL"
        );
    }

    #[test]
    fn test_longer_term_wins_over_its_prefix() {
        // without ordering the bare CLORIDRATO rule would leave "DE BUPROPIONA"
        assert_eq!(canonical_name("CLORIDRATO DE BUPROPIONA"), "BUPROPIONA");
    }

    #[test]
    fn test_name_made_only_of_qualifiers_becomes_empty() {
        let normalizer = SubstanceNormalizer::default();
        assert_eq!(normalizer.canonicalize("ANIDRO"), "");
        assert_eq!(normalizer.join_key("  anidro "), None);
        assert_eq!(normalizer.join_key("Sertralina"), Some("SERTRALINA".to_string()));
    }

    #[test]
    fn test_normalize_staging_rewrites_names_and_keeps_empty_rows() {
        let mut db = DatabaseManager::open_in_memory().unwrap();
        db.conn()
            .execute_batch(
                "CREATE TABLE staging (principio_ativo TEXT, idade TEXT);
                 INSERT INTO staging VALUES
                    ('CLORIDRATO DE SERTRALINA  ', '30'),
                    ('Sertralina', '31'),
                    ('ANIDRO', '40'),
                    (NULL, '50');",
            )
            .unwrap();

        let report =
            normalize_staging(&mut db, "staging", &SubstanceNormalizer::default()).unwrap();
        assert_eq!(report.distinct_names, 3);
        assert_eq!(report.empty_names, 1);
        assert_eq!(report.rows_updated, 3);
        assert_eq!(db.count_rows("staging").unwrap(), 4);

        let keys: Vec<(Option<String>, Option<String>)> = db
            .conn()
            .prepare("SELECT principio_ativo, join_key FROM staging ORDER BY idade")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(
            keys,
            vec![
                (Some("SERTRALINA".into()), Some("SERTRALINA".into())),
                (Some("SERTRALINA".into()), Some("SERTRALINA".into())),
                (Some(String::new()), None),
                (None, None),
            ]
        );

        // a second pass changes nothing
        let again = normalize_staging(&mut db, "staging", &SubstanceNormalizer::default()).unwrap();
        assert_eq!(again.changed_names, 0);
    }

    proptest! {
        #[test]
        fn prop_canonicalize_is_idempotent(raw in "[A-Za-zÀ-ÿ +\\-]{0,40}") {
            let once = canonical_name(&raw);
            prop_assert_eq!(canonical_name(&once), once);
        }

        #[test]
        fn prop_idempotent_around_qualifier_terms(
            prefix in "[A-Z ]{0,6}",
            idx in 0..QUALIFIER_TERMS.len(),
            suffix in "[A-Z +]{0,12}",
        ) {
            let raw = format!("{prefix}{}{suffix}", QUALIFIER_TERMS[idx].pattern);
            let once = canonical_name(&raw);
            prop_assert_eq!(canonical_name(&once), once.clone());
            prop_assert!(!once.contains("  "));
        }

        #[test]
        fn prop_case_and_spacing_do_not_change_key(
            name in "[A-Z]{1,8}( [A-Z]{1,8}){0,2}",
            pad in " {0,3}",
        ) {
            let variant = format!("{pad}{}{pad}", name.to_lowercase().replace(' ', "   "));
            prop_assert_eq!(canonical_name(&variant), canonical_name(&name));
        }
    }
}
