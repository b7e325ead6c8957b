use serde::Serialize;
use tracing::{debug, info, instrument};

use crate::constants::INDEXED_COLUMNS;
use crate::db::{quote_ident, DatabaseManager};
use crate::error::Result;

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub table: String,
    pub created: Vec<String>,
    pub existing: Vec<String>,
}

pub fn index_name(table: &str, column: &str) -> String {
    format!("idx_{table}_{column}")
}

/// Creates one lookup index per filter column; re-running is a no-op.
pub struct IndexBuilder {
    table: String,
    columns: Vec<String>,
}

impl IndexBuilder {
    pub fn new(table: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn for_fact_table(table: &str) -> Self {
        Self::new(table, &INDEXED_COLUMNS)
    }

    #[instrument(skip(self, db), fields(table = %self.table))]
    pub fn create(&self, db: &mut DatabaseManager) -> Result<IndexReport> {
        db.require_table(&self.table)?;
        let mut report = IndexReport {
            table: self.table.clone(),
            ..Default::default()
        };

        let mut pending = Vec::new();
        for column in &self.columns {
            let name = index_name(&self.table, column);
            if db.index_exists(&name)? {
                debug!("Index {} already exists", name);
                report.existing.push(name);
            } else {
                pending.push((name, column));
            }
        }

        let tx = db.conn_mut().transaction()?;
        for (name, column) in pending {
            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({});",
                quote_ident(&name),
                quote_ident(&self.table),
                quote_ident(column)
            ))?;
            report.created.push(name);
        }
        tx.commit()?;

        info!(
            "✅ Indexes on '{}': {} created, {} already present",
            self.table,
            report.created.len(),
            report.existing.len()
        );
        Ok(report)
    }
}
