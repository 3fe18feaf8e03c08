use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{guarded, CursorQuery, StorageBackend, StoredRecord};
use crate::dbkey::DBKey;
use crate::error::StorageError;
use ferry_protocol::TopicType;

/// SQLite archive. One table keyed by the raw [`DBKey`] bytes, so the
/// primary key index serves range scans in time order.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at `path`.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let store = Self { conn: Mutex::new(conn) };
        store.create_schema()?;
        debug!(path = %path.display(), "opened sqlite archive");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.create_schema()?;
        Ok(store)
    }

    fn create_schema(&self) -> Result<(), StorageError> {
        self.conn().execute_batch(
            "
            CREATE TABLE IF NOT EXISTS envelopes (
                id     BLOB PRIMARY KEY,
                topic  BLOB NOT NULL,
                data   BLOB NOT NULL
            );
            ",
        )?;
        Ok(())
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StorageBackend for SqliteStore {
    fn put(&self, key: &DBKey, raw: &[u8]) -> Result<(), StorageError> {
        guarded("put", || {
            self.conn().execute(
                "INSERT OR IGNORE INTO envelopes (id, topic, data) VALUES (?1, ?2, ?3)",
                params![&key.as_bytes()[..], &key.topic().as_bytes()[..], raw],
            )?;
            Ok(())
        })
    }

    fn get(&self, key: &DBKey) -> Result<Option<Vec<u8>>, StorageError> {
        guarded("get", || {
            let data = self
                .conn()
                .query_row(
                    "SELECT data FROM envelopes WHERE id = ?1",
                    params![&key.as_bytes()[..]],
                    |row| row.get::<_, Vec<u8>>(0),
                )
                .optional()?;
            Ok(data)
        })
    }

    fn query(&self, query: &CursorQuery) -> Result<Vec<StoredRecord>, StorageError> {
        guarded("query", || {
            let (sql, from) = match &query.cursor {
                Some(cursor) => (
                    "SELECT id, topic, data FROM envelopes WHERE id > ?1 AND id < ?2 ORDER BY id ASC",
                    cursor,
                ),
                None => (
                    "SELECT id, topic, data FROM envelopes WHERE id >= ?1 AND id < ?2 ORDER BY id ASC",
                    &query.start,
                ),
            };
            let conn = self.conn();
            let mut stmt = conn.prepare(sql)?;
            let mut rows = stmt.query(params![&from.as_bytes()[..], &query.end.as_bytes()[..]])?;

            let mut records = Vec::new();
            while records.len() < query.limit {
                let Some(row) = rows.next()? else { break };
                let topic: Vec<u8> = row.get(1)?;
                if !query.matcher.matches(&TopicType::from_prefix(&topic)) {
                    continue;
                }
                let id: Vec<u8> = row.get(0)?;
                records.push(StoredRecord {
                    key: DBKey::from_slice(&id)?,
                    raw: row.get(2)?,
                });
            }
            Ok(records)
        })
    }

    fn prune(&self, before: u32, batch_size: usize) -> Result<usize, StorageError> {
        guarded("prune", || {
            let bound = DBKey::lower_bound(before);
            let batch_size = batch_size.max(1);
            let mut removed = 0;
            loop {
                let n = self.conn().execute(
                    "DELETE FROM envelopes WHERE id IN
                     (SELECT id FROM envelopes WHERE id < ?1 ORDER BY id LIMIT ?2)",
                    params![&bound.as_bytes()[..], batch_size as i64],
                )?;
                removed += n;
                if n < batch_size {
                    return Ok(removed);
                }
            }
        })
    }

    fn len(&self) -> Result<usize, StorageError> {
        guarded("len", || {
            let count: i64 = self
                .conn()
                .query_row("SELECT COUNT(*) FROM envelopes", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }
}
