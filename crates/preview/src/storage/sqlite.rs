//! Durable storage engine backed by SQLite.
//!
//! Rows are keyed by `(keyspace, key)`; the keyspace is fixed per
//! deployment so several nodes can share one database file.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};

use crate::error::StoreError;
use crate::model::Record;
use crate::storage::{migrations, Storage};

#[derive(Clone)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    keyspace: String,
}

impl SqliteStorage {
    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path, keyspace: &str) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        migrations::run_all(&conn)?;

        log::info!(
            "Storage opened at {} (keyspace '{}')",
            path.display(),
            keyspace
        );

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            keyspace: keyspace.to_string(),
        })
    }

    pub fn open_in_memory(keyspace: &str) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            keyspace: keyspace.to_string(),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&conn)
    }

    fn read(&self, conn: &Connection, key: &str) -> Result<Option<Record>, StoreError> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE keyspace = ?1 AND key = ?2",
                rusqlite::params![self.keyspace, key],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| decode(key, &b)).transpose()
    }

    fn write(&self, conn: &Connection, key: &str, record: &Record) -> Result<(), StoreError> {
        let body = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        conn.execute(
            "INSERT INTO records (keyspace, key, kind, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(keyspace, key) DO UPDATE SET
                kind = excluded.kind,
                body = excluded.body,
                updated_at = excluded.updated_at",
            rusqlite::params![
                self.keyspace,
                key,
                record.kind(),
                body,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

fn decode(key: &str, body: &str) -> Result<Record, StoreError> {
    serde_json::from_str(body).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

impl Storage for SqliteStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn put(&self, key: &str, record: Record) -> Result<(), StoreError> {
        self.with_conn(|conn| self.write(conn, key, &record))
    }

    fn get(&self, key: &str) -> Result<Option<Record>, StoreError> {
        self.with_conn(|conn| self.read(conn, key))
    }

    fn list(&self, predicate: &dyn Fn(&Record) -> bool) -> Result<Vec<Record>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT key, body FROM records WHERE keyspace = ?1 ORDER BY key")?;
            let rows = stmt.query_map(rusqlite::params![self.keyspace], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut records = Vec::new();
            for row in rows {
                let (key, body) = row?;
                let record = decode(&key, &body)?;
                if predicate(&record) {
                    records.push(record);
                }
            }
            Ok(records)
        })
    }

    fn update(
        &self,
        key: &str,
        apply: &mut dyn FnMut(Option<&Record>) -> Option<Record>,
    ) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let current = self.read(&tx, key)?;
            let written = match apply(current.as_ref()) {
                Some(next) => {
                    self.write(&tx, key, &next)?;
                    true
                }
                None => false,
            };
            tx.commit()?;
            Ok(written)
        })
    }
}
