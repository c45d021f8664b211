//! `SQLite`-backed committed storage.
//!
//! Uses WAL mode. Each [`StorageBackend::apply`] is a single SQL
//! transaction, so a crash mid-commit leaves the previous image intact.

// SQLite stores positions as i64; transcript positions never approach 2^63.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection, OpenFlags, OptionalExtension};

use super::{CommitBatch, StorageBackend};
use crate::error::StoreError;

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

/// File name of the database inside a store directory.
pub const DB_FILE_NAME: &str = "swingstore.sqlite";

/// Committed store image in a `SQLite` database.
pub struct SqliteBackend {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteBackend {
    /// Open (creating if needed) the database inside `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or database cannot be opened.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let path = dir.join(DB_FILE_NAME);
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn, path: None })
    }

    /// Path of the database file, if on disk.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl StorageBackend for SqliteBackend {
    fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn kv_next_key(&self, after: &str) -> Result<Option<String>, StoreError> {
        let key = self
            .conn
            .query_row(
                "SELECT key FROM kv WHERE key > ?1 ORDER BY key LIMIT 1",
                params![after],
                |row| row.get(0),
            )
            .optional()?;
        Ok(key)
    }

    fn transcript_item(&self, vat_id: &str, position: u64) -> Result<Option<String>, StoreError> {
        let item = self
            .conn
            .query_row(
                "SELECT item FROM transcript_items WHERE vat_id = ?1 AND position = ?2",
                params![vat_id, position as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(item)
    }

    fn blob_get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self
            .conn
            .query_row("SELECT data FROM blobs WHERE id = ?1", params![id], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(data)
    }

    fn apply(&mut self, batch: &CommitBatch) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        {
            let mut put = tx.prepare("INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)")?;
            let mut del = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
            for (key, value) in &batch.kv {
                match value {
                    Some(v) => put.execute(params![key, v])?,
                    None => del.execute(params![key])?,
                };
            }
        }
        {
            let mut put = tx.prepare(
                "INSERT OR REPLACE INTO transcript_items (vat_id, position, item) VALUES (?1, ?2, ?3)",
            )?;
            let mut del =
                tx.prepare("DELETE FROM transcript_items WHERE vat_id = ?1 AND position = ?2")?;
            for ((vat_id, position), item) in &batch.transcript {
                match item {
                    Some(v) => put.execute(params![vat_id, *position as i64, v])?,
                    None => del.execute(params![vat_id, *position as i64])?,
                };
            }
        }
        {
            let mut put = tx.prepare("INSERT OR REPLACE INTO blobs (id, data) VALUES (?1, ?2)")?;
            let mut del = tx.prepare("DELETE FROM blobs WHERE id = ?1")?;
            for (id, data) in &batch.blobs {
                match data {
                    Some(v) => put.execute(params![id, v])?,
                    None => del.execute(params![id])?,
                };
            }
        }
        tx.commit()?;
        Ok(())
    }
}
