// SQLite backend for the ordered keyed store
// One table per value kind; a key lives in at most one of them.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use crate::codec::StoredValue;
use crate::error::{StoreError, StoreResult, ValueKind};
use crate::keys::KeyPath;
use crate::{KeyedStore, SwapDirection};

const PREFIX_MATCH: &str = "substr(key, 1, length(?1)) = ?1";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open or create a durable store at `db_path`.
    pub async fn open(db_path: &Path) -> StoreResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(Duration::from_secs(10))?;
        // journal_mode returns a row
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: Some(db_path.to_path_buf()),
        };
        store.init_schema().await?;
        tracing::debug!(path = %db_path.display(), "opened keyed store");
        Ok(store)
    }

    /// Private in-memory store, used by tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path: None,
        };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    async fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scalars (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS set_members (
                key TEXT NOT NULL,
                member TEXT NOT NULL,
                PRIMARY KEY (key, member)
            );
            CREATE TABLE IF NOT EXISTS list_items (
                key TEXT NOT NULL,
                position INTEGER NOT NULL,
                value TEXT NOT NULL,
                PRIMARY KEY (key, position)
            );",
        )?;
        Ok(())
    }
}

fn kind_of(conn: &Connection, key: &str) -> rusqlite::Result<Option<ValueKind>> {
    let code = conn
        .query_row(
            "SELECT kind FROM (
                SELECT 0 AS kind FROM scalars WHERE key = ?1
                UNION ALL SELECT 1 FROM set_members WHERE key = ?1
                UNION ALL SELECT 2 FROM list_items WHERE key = ?1
            ) LIMIT 1",
            params![key],
            |row| row.get::<_, i64>(0),
        )
        .optional()?;
    Ok(code.map(|code| match code {
        0 => ValueKind::Scalar,
        1 => ValueKind::Set,
        _ => ValueKind::List,
    }))
}

fn ensure_kind(conn: &Connection, key: &KeyPath, expected: ValueKind) -> StoreResult<()> {
    match kind_of(conn, key.as_str())? {
        Some(actual) if actual != expected => Err(StoreError::WrongKind {
            key: key.to_string(),
            expected,
            actual,
        }),
        _ => Ok(()),
    }
}

fn count_keys(conn: &Connection, table: &str, prefix: &str) -> rusqlite::Result<u64> {
    let sql = format!("SELECT COUNT(DISTINCT key) FROM {table} WHERE {PREFIX_MATCH}");
    conn.query_row(&sql, params![prefix], |row| row.get::<_, i64>(0))
        .map(|count| count as u64)
}

#[async_trait]
impl KeyedStore for SqliteStore {
    async fn set_scalar(&self, key: &KeyPath, value: &StoredValue) -> StoreResult<()> {
        let encoded = value.encode()?;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_kind(&tx, key, ValueKind::Scalar)?;
        tx.execute(
            "INSERT INTO scalars (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key.as_str(), encoded],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn get_scalar(&self, key: &KeyPath) -> StoreResult<Option<StoredValue>> {
        let raw = {
            let conn = self.conn.lock().await;
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM scalars WHERE key = ?1",
                    params![key.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if raw.is_none() {
                ensure_kind(&conn, key, ValueKind::Scalar)?;
            }
            raw
        };
        raw.map(|raw| StoredValue::decode(&raw)).transpose()
    }

    async fn delete_scalar(&self, key: &KeyPath) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        ensure_kind(&conn, key, ValueKind::Scalar)?;
        let removed = conn.execute(
            "DELETE FROM scalars WHERE key = ?1",
            params![key.as_str()],
        )?;
        Ok(removed > 0)
    }

    async fn add_to_set(&self, key: &KeyPath, member: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_kind(&tx, key, ValueKind::Set)?;
        let added = tx.execute(
            "INSERT OR IGNORE INTO set_members (key, member) VALUES (?1, ?2)",
            params![key.as_str(), member],
        )?;
        tx.commit()?;
        Ok(added > 0)
    }

    async fn remove_from_set(&self, key: &KeyPath, member: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().await;
        ensure_kind(&conn, key, ValueKind::Set)?;
        let removed = conn.execute(
            "DELETE FROM set_members WHERE key = ?1 AND member = ?2",
            params![key.as_str(), member],
        )?;
        Ok(removed > 0)
    }

    async fn list_set(&self, key: &KeyPath) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        ensure_kind(&conn, key, ValueKind::Set)?;
        let mut stmt = conn.prepare("SELECT member FROM set_members WHERE key = ?1")?;
        let members = stmt
            .query_map(params![key.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(members)
    }

    async fn append_to_list(&self, key: &KeyPath, value: &str) -> StoreResult<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_kind(&tx, key, ValueKind::List)?;
        tx.execute(
            "INSERT INTO list_items (key, position, value)
             SELECT ?1, COALESCE(MAX(position) + 1, 0), ?2 FROM list_items WHERE key = ?1",
            params![key.as_str(), value],
        )?;
        tx.commit()?;
        Ok(())
    }

    async fn remove_first_occurrence(&self, key: &KeyPath, value: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_kind(&tx, key, ValueKind::List)?;
        let removed = tx.execute(
            "DELETE FROM list_items WHERE key = ?1 AND position = (
                SELECT MIN(position) FROM list_items WHERE key = ?1 AND value = ?2
            )",
            params![key.as_str(), value],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    async fn list_all(&self, key: &KeyPath) -> StoreResult<Vec<String>> {
        let conn = self.conn.lock().await;
        ensure_kind(&conn, key, ValueKind::List)?;
        let mut stmt =
            conn.prepare("SELECT value FROM list_items WHERE key = ?1 ORDER BY position")?;
        let values = stmt
            .query_map(params![key.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(values)
    }

    async fn swap_adjacent(
        &self,
        key: &KeyPath,
        value: &str,
        direction: SwapDirection,
    ) -> StoreResult<bool> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        ensure_kind(&tx, key, ValueKind::List)?;
        let rows = {
            let mut stmt = tx.prepare(
                "SELECT position, value FROM list_items WHERE key = ?1 ORDER BY position",
            )?;
            let rows = stmt
                .query_map(params![key.as_str()], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        let Some(index) = rows.iter().position(|(_, item)| item == value) else {
            return Ok(false);
        };
        let neighbour = match direction {
            SwapDirection::Up if index > 0 => index - 1,
            SwapDirection::Down if index + 1 < rows.len() => index + 1,
            _ => return Ok(false),
        };
        let (position, current) = &rows[index];
        let (neighbour_position, neighbour_value) = &rows[neighbour];
        tx.execute(
            "UPDATE list_items SET value = ?3 WHERE key = ?1 AND position = ?2",
            params![key.as_str(), position, neighbour_value],
        )?;
        tx.execute(
            "UPDATE list_items SET value = ?3 WHERE key = ?1 AND position = ?2",
            params![key.as_str(), neighbour_position, current],
        )?;
        tx.commit()?;
        Ok(true)
    }

    async fn delete_by_prefix(&self, prefix: &KeyPath) -> StoreResult<u64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut removed = 0;
        for table in ["scalars", "set_members", "list_items"] {
            removed += count_keys(&tx, table, prefix.as_str())?;
            tx.execute(
                &format!("DELETE FROM {table} WHERE {PREFIX_MATCH}"),
                params![prefix.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(removed)
    }

    async fn keys_with_prefix(&self, prefix: &KeyPath) -> StoreResult<Vec<KeyPath>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT key FROM scalars WHERE {PREFIX_MATCH}
             UNION SELECT key FROM set_members WHERE {PREFIX_MATCH}
             UNION SELECT key FROM list_items WHERE {PREFIX_MATCH}
             ORDER BY key"
        );
        let mut stmt = conn.prepare(&sql)?;
        let keys = stmt
            .query_map(params![prefix.as_str()], |row| row.get::<_, String>(0))?
            .map(|key| key.map(KeyPath::from_raw))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
