use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{EtlError, Result};

/// Handle on the embedded analytic store, passed explicitly to every stage.
pub struct DatabaseManager {
    conn: Connection,
    read_only: bool,
}

impl DatabaseManager {
    /// Open the database for a write-mode ETL pass.
    ///
    /// The connection takes an exclusive file lock on its first write and keeps
    /// it until dropped, so readers cannot observe a run in progress.
    pub fn open_for_etl<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        info!("Opening database for ETL at {}", path.display());
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "locking_mode", "EXCLUSIVE")?;
        // Rollback journal keeps the finished file openable by read-only consumers
        let mode: String = conn.query_row("PRAGMA journal_mode=DELETE", [], |row| row.get(0))?;
        debug!("journal_mode={}", mode);
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn,
            read_only: false,
        })
    }

    /// Open an already built database for read-only consumers.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(EtlError::Config(format!(
                "Database file '{}' does not exist; run the ETL first",
                path.display()
            )));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn,
            read_only: true,
        })
    }

    /// In-memory database, used to exercise single stages in tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn,
            read_only: false,
        })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn table_exists(&self, table: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn require_table(&self, table: &str) -> Result<()> {
        if self.table_exists(table)? {
            Ok(())
        } else {
            Err(EtlError::MissingTable {
                table: table.to_string(),
            })
        }
    }

    pub fn count_rows(&self, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Column names of a table in declaration order
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info({})", quote_ident(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    pub fn index_exists(&self, index: &str) -> Result<bool> {
        let found: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'index' AND name = ?1",
                [index],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn drop_table(&self, table: &str) -> Result<()> {
        self.conn
            .execute_batch(&format!("DROP TABLE IF EXISTS {};", quote_ident(table)))?;
        Ok(())
    }
}

/// Quote an SQL identifier, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
