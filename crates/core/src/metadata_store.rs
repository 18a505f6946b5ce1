//! SQLite-backed `id -> (filepath, content_hash)` table.
//!
//! The store owns its connection; mutations take `&mut self`, so id
//! allocation is serialized by ownership. Every mutation runs in a
//! transaction that rolls back when dropped uncommitted.

use crate::error::Result;
use crate::models::FileRecord;
use crate::traits::MetadataIndex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row, Transaction};
use std::path::Path;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS file_entries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        filepath TEXT NOT NULL UNIQUE,
        content_hash TEXT NOT NULL
    );
"#;

pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        let journal_mode: String =
            conn.pragma_update_and_check(None, "journal_mode", WAL, |row| row.get(0))?;
        tracing::debug!(journal_mode, "configured sqlite journal");
        conn.pragma_update(None, "synchronous", NORMAL)?;

        let store = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "metadata store ready");
        Ok(store)
    }

    /// Opens an existing store without write access. The schema is not
    /// touched; a missing file gives an empty in-memory store.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no metadata store yet");
            return Self::open_in_memory();
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Runs `work` in a transaction: committed on `Ok`, rolled back on `Err`
    /// (the uncommitted transaction is dropped).
    fn with_transaction<T>(
        &mut self,
        work: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let tx = self.conn.transaction()?;
        let value = work(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM file_entries", [], |row| row.get(0))?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        filepath: row.get(1)?,
        content_hash: row.get(2)?,
    })
}

impl MetadataIndex for MetadataStore {
    fn upsert(&mut self, filepath: &str, content_hash: &str) -> Result<u64> {
        let id = self.with_transaction(|tx| {
            let id = tx.query_row(
                "INSERT INTO file_entries (filepath, content_hash)
                 VALUES (?1, ?2)
                 ON CONFLICT(filepath) DO UPDATE SET
                     content_hash = excluded.content_hash
                 RETURNING id",
                params![filepath, content_hash],
                |row| row.get::<_, u64>(0),
            )?;
            Ok(id)
        })?;

        tracing::debug!(id, filepath, "upserted metadata");
        Ok(id)
    }

    fn get(&self, id: u64) -> Result<Option<FileRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, filepath, content_hash FROM file_entries WHERE id = ?1",
                params![id],
                record_from_row,
            )
            .optional()?)
    }

    fn get_by_filepath(&self, filepath: &str) -> Result<Option<FileRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, filepath, content_hash FROM file_entries WHERE filepath = ?1",
                params![filepath],
                record_from_row,
            )
            .optional()?)
    }

    fn delete(&mut self, id: u64) -> Result<bool> {
        let affected = self.with_transaction(|tx| {
            Ok(tx.execute("DELETE FROM file_entries WHERE id = ?1", params![id])?)
        })?;
        Ok(affected > 0)
    }

    fn delete_many(&mut self, ids: &[u64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }

        self.with_transaction(|tx| {
            let mut stmt = tx.prepare("DELETE FROM file_entries WHERE id = ?1")?;
            let mut affected = 0;
            for id in ids {
                affected += stmt.execute(params![id])?;
            }
            Ok(affected)
        })
    }

    fn list(&self) -> Result<Vec<FileRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, filepath, content_hash FROM file_entries ORDER BY filepath")?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn ids(&self) -> Result<Vec<u64>> {
        let mut stmt = self.conn.prepare("SELECT id FROM file_entries ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, u64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ids)
    }
}

// SQL pragma constants
const WAL: &str = "WAL";
const NORMAL: &str = "NORMAL";
