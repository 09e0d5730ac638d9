//! `SQLite` persistence layer.

use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};
use scenesync_core::{
    Delta, DeltasRepository, MemoryRepository, MetadataRepository, RepositoryError, SyncMetadata,
};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

/// `SQLite`-backed repository for queued deltas and sync metadata.
///
/// Clones share one connection.
#[derive(Debug, Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteRepository {
    /// Open or create a `SQLite` database.
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be opened or initialized.
    pub fn open(path: &Path) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    ///
    /// # Errors
    ///
    /// Returns error if database cannot be created.
    pub fn in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> SqliteResult<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn with_conn<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> SqliteResult<T>,
    ) -> Result<T, RepositoryError> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        op(&mut conn).map_err(|e| RepositoryError::Storage(e.to_string()))
    }

    /// Rooms that have queued deltas or metadata.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub fn rooms(&self) -> Result<Vec<String>, RepositoryError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT room_id FROM queued_deltas
                UNION
                SELECT room_id FROM sync_metadata
                ORDER BY room_id
                ",
            )?;
            let rooms = stmt
                .query_map([], |row| row.get(0))?
                .collect::<SqliteResult<Vec<String>>>()?;
            Ok(rooms)
        })
    }
}

/// Initialize database schema.
fn init_schema(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        r"
        -- Local deltas not yet acknowledged, in queue order
        CREATE TABLE IF NOT EXISTS queued_deltas (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            room_id TEXT NOT NULL,
            delta_id TEXT NOT NULL,
            delta_json TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            UNIQUE(room_id, delta_id)
        );

        CREATE INDEX IF NOT EXISTS idx_queued_deltas_room ON queued_deltas(room_id, seq);

        -- Resume point per room
        CREATE TABLE IF NOT EXISTS sync_metadata (
            room_id TEXT PRIMARY KEY,
            last_acknowledged_version INTEGER NOT NULL
        );
        ",
    )
}

impl DeltasRepository for SqliteRepository {
    fn load_deltas(&self, room_id: &str) -> Result<Vec<Delta>, RepositoryError> {
        let rows = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT delta_json FROM queued_deltas
                WHERE room_id = ?1
                ORDER BY seq ASC
                ",
            )?;
            let rows = stmt
                .query_map([room_id], |row| row.get(0))?
                .collect::<SqliteResult<Vec<String>>>()?;
            Ok(rows)
        })?;

        rows.iter()
            .map(|json| {
                serde_json::from_str(json).map_err(|e| RepositoryError::Encoding(e.to_string()))
            })
            .collect()
    }

    fn save_deltas(&self, room_id: &str, deltas: &[Delta]) -> Result<(), RepositoryError> {
        let encoded = deltas
            .iter()
            .map(|delta| {
                serde_json::to_string(delta)
                    .map(|json| (delta.id.as_str(), json, delta.created_at.timestamp_millis()))
                    .map_err(|e| RepositoryError::Encoding(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM queued_deltas WHERE room_id = ?1", [room_id])?;
            {
                let mut stmt = tx.prepare(
                    r"
                    INSERT OR REPLACE INTO queued_deltas (room_id, delta_id, delta_json, created_at)
                    VALUES (?1, ?2, ?3, ?4)
                    ",
                )?;
                for (delta_id, json, created_at) in &encoded {
                    stmt.execute((room_id, delta_id, json, created_at))?;
                }
            }
            tx.commit()
        })?;

        tracing::trace!(room_id, queued = deltas.len(), "Persisted delta queue");
        Ok(())
    }
}

impl MetadataRepository for SqliteRepository {
    fn load_metadata(&self, room_id: &str) -> Result<Option<SyncMetadata>, RepositoryError> {
        let version = self.with_conn(|conn| {
            conn.query_row(
                "SELECT last_acknowledged_version FROM sync_metadata WHERE room_id = ?1",
                [room_id],
                |row| row.get::<_, i64>(0),
            )
            .optional()
        })?;

        version
            .map(|version| {
                u64::try_from(version)
                    .map(|last_acknowledged_version| SyncMetadata {
                        last_acknowledged_version,
                    })
                    .map_err(|e| RepositoryError::Encoding(e.to_string()))
            })
            .transpose()
    }

    fn save_metadata(
        &self,
        room_id: &str,
        metadata: &SyncMetadata,
    ) -> Result<(), RepositoryError> {
        let version = i64::try_from(metadata.last_acknowledged_version)
            .map_err(|e| RepositoryError::Encoding(e.to_string()))?;

        self.with_conn(|conn| {
            conn.execute(
                r"
                INSERT OR REPLACE INTO sync_metadata (room_id, last_acknowledged_version)
                VALUES (?1, ?2)
                ",
                (room_id, version),
            )
            .map(|_| ())
        })
    }
}

/// Repository selected by configuration.
#[derive(Debug, Clone)]
pub enum SessionStore {
    /// Durable `SQLite` store
    Sqlite(SqliteRepository),
    /// Volatile in-memory store
    Memory(MemoryRepository),
}

impl DeltasRepository for SessionStore {
    fn load_deltas(&self, room_id: &str) -> Result<Vec<Delta>, RepositoryError> {
        match self {
            SessionStore::Sqlite(store) => store.load_deltas(room_id),
            SessionStore::Memory(store) => store.load_deltas(room_id),
        }
    }

    fn save_deltas(&self, room_id: &str, deltas: &[Delta]) -> Result<(), RepositoryError> {
        match self {
            SessionStore::Sqlite(store) => store.save_deltas(room_id, deltas),
            SessionStore::Memory(store) => store.save_deltas(room_id, deltas),
        }
    }
}

impl MetadataRepository for SessionStore {
    fn load_metadata(&self, room_id: &str) -> Result<Option<SyncMetadata>, RepositoryError> {
        match self {
            SessionStore::Sqlite(store) => store.load_metadata(room_id),
            SessionStore::Memory(store) => store.load_metadata(room_id),
        }
    }

    fn save_metadata(
        &self,
        room_id: &str,
        metadata: &SyncMetadata,
    ) -> Result<(), RepositoryError> {
        match self {
            SessionStore::Sqlite(store) => store.save_metadata(room_id, metadata),
            SessionStore::Memory(store) => store.save_metadata(room_id, metadata),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenesync_core::{DeltaId, LocalDeltaQueue};

    fn delta(id: &str) -> Delta {
        Delta::with_id(id, serde_json::json!({ "id": id }))
    }

    #[test]
    fn sqlite_repository_basic_operations() {
        let store = SqliteRepository::in_memory().unwrap();

        store
            .save_deltas("room1", &[delta("b"), delta("a"), delta("c")])
            .unwrap();
        store.save_deltas("room2", &[delta("z")]).unwrap();

        let ids: Vec<String> = store
            .load_deltas("room1")
            .unwrap()
            .into_iter()
            .map(|d| d.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);

        store.save_deltas("room1", &[delta("c")]).unwrap();
        assert_eq!(store.load_deltas("room1").unwrap(), vec![delta("c")]);
        assert_eq!(store.load_deltas("room2").unwrap().len(), 1);

        assert_eq!(store.load_metadata("room1").unwrap(), None);
        store
            .save_metadata(
                "room1",
                &SyncMetadata {
                    last_acknowledged_version: 42,
                },
            )
            .unwrap();
        assert_eq!(
            store.load_metadata("room1").unwrap(),
            Some(SyncMetadata {
                last_acknowledged_version: 42
            })
        );

        assert_eq!(store.rooms().unwrap(), vec!["room1", "room2"]);
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scenesync.db");

        {
            let store = SqliteRepository::open(&path).unwrap();
            let mut queue = LocalDeltaQueue::create(store, "room").unwrap();
            queue.add(delta("d1")).unwrap();
            queue.add(delta("d2")).unwrap();
            queue.add(delta("d3")).unwrap();
            queue.remove(&DeltaId::from("d2")).unwrap();
        }

        let store = SqliteRepository::open(&path).unwrap();
        let queue = LocalDeltaQueue::create(store, "room").unwrap();
        let ids: Vec<&str> = queue.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "d3"]);
    }

    #[test]
    fn session_store_delegates() {
        let memory = MemoryRepository::new();
        let store = SessionStore::Memory(memory.clone());

        store.save_deltas("r", &[delta("x")]).unwrap();
        assert_eq!(memory.load_deltas("r").unwrap(), vec![delta("x")]);

        let sqlite = SessionStore::Sqlite(SqliteRepository::in_memory().unwrap());
        sqlite
            .save_metadata(
                "r",
                &SyncMetadata {
                    last_acknowledged_version: 3,
                },
            )
            .unwrap();
        assert_eq!(
            sqlite.load_metadata("r").unwrap().map(|m| m.last_acknowledged_version),
            Some(3)
        );
    }
}
