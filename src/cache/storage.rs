//! Durable cache storage trait and SQLite implementation.

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::key::{CacheKey, KeyPrefix};
use super::traits::CacheEntry;

/// Trait for durable cache backends.
pub trait CacheStorage: Send + Sync {
  /// Get an entry regardless of staleness.
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<Value>>>;

  /// Store a single entry.
  fn put(&self, key: &CacheKey, entry: &CacheEntry<Value>) -> Result<()>;

  /// Store every entry of one entity and its key set in one transaction.
  fn write_entity(
    &self,
    canonical: &CacheKey,
    entries: &[(CacheKey, CacheEntry<Value>)],
  ) -> Result<()>;

  /// Key set recorded by the last `write_entity` for this canonical key.
  fn key_set(&self, canonical: &CacheKey) -> Result<Option<Vec<CacheKey>>>;

  /// Remove the given keys.
  ///
  /// With an `owner`, only entries that owner wrote (or that have no owner)
  /// are removed, and the owner's key set is dropped when `keys` holds it.
  fn remove(&self, owner: Option<&CacheKey>, keys: &[CacheKey]) -> Result<()>;

  /// Remove every entry under a prefix. Returns the number of rows removed.
  fn remove_prefix(&self, prefix: &KeyPrefix) -> Result<usize>;

  /// Drop everything.
  fn purge(&self) -> Result<()>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the durable tier is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get(&self, _key: &CacheKey) -> Result<Option<CacheEntry<Value>>> {
    Ok(None) // Always miss
  }

  fn put(&self, _key: &CacheKey, _entry: &CacheEntry<Value>) -> Result<()> {
    Ok(()) // Discard
  }

  fn write_entity(
    &self,
    _canonical: &CacheKey,
    _entries: &[(CacheKey, CacheEntry<Value>)],
  ) -> Result<()> {
    Ok(()) // Discard
  }

  fn key_set(&self, _canonical: &CacheKey) -> Result<Option<Vec<CacheKey>>> {
    Ok(None)
  }

  fn remove(&self, _owner: Option<&CacheKey>, _keys: &[CacheKey]) -> Result<()> {
    Ok(())
  }

  fn remove_prefix(&self, _prefix: &KeyPrefix) -> Result<usize> {
    Ok(0)
  }

  fn purge(&self) -> Result<()> {
    Ok(())
  }
}

/// SQLite-based cache storage implementation.
///
/// The database file can be shared by several processes; SQLite serializes
/// the writers.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open the storage at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open or create the storage at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Private in-memory storage, mostly for tests.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("stride").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    // Databases created before entries carried an owner
    let has_owner: bool = conn
      .query_row(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('cache_entries') WHERE name = 'owner'",
        [],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to inspect cache schema: {}", e))?;
    if !has_owner {
      conn
        .execute("ALTER TABLE cache_entries ADD COLUMN owner TEXT", [])
        .map_err(|e| eyre!("Failed to add owner column: {}", e))?;
    }

    Ok(())
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Entries of every tier-B key, addressed by the SHA-256 of the key
CREATE TABLE IF NOT EXISTS cache_entries (
    key_hash TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    subresource TEXT,
    data BLOB NOT NULL,
    version INTEGER NOT NULL,
    ttl_secs INTEGER NOT NULL,
    cached_at TEXT NOT NULL,
    -- Storage hash of the canonical key whose write produced this entry
    owner TEXT
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_entity
    ON cache_entries(entity_type, entity_id);

-- Keys written for an entity, so invalidation reaches sub-views and indexes
CREATE TABLE IF NOT EXISTS entity_key_sets (
    entity_type TEXT NOT NULL,
    entity_id TEXT NOT NULL,
    keys TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id)
);
"#;

fn insert_entry(
  conn: &Connection,
  key: &CacheKey,
  entry: &CacheEntry<Value>,
  owner: Option<&CacheKey>,
) -> Result<()> {
  let data =
    serde_json::to_vec(&entry.value).map_err(|e| eyre!("Failed to serialize entry: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (key_hash, entity_type, entity_id, subresource, data, version, ttl_secs, cached_at,
          owner)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        key.storage_hash(),
        key.entity_type,
        key.id,
        key.subresource,
        data,
        entry.version,
        entry.ttl.num_seconds(),
        entry.cached_at.to_rfc3339(),
        owner.map(CacheKey::storage_hash),
      ],
    )
    .map_err(|e| eyre!("Failed to store entry {}: {}", key, e))?;

  Ok(())
}

fn delete_key_set(conn: &Connection, canonical: &CacheKey) -> Result<()> {
  conn
    .execute(
      "DELETE FROM entity_key_sets WHERE entity_type = ? AND entity_id = ?",
      params![canonical.entity_type, canonical.id],
    )
    .map_err(|e| eyre!("Failed to delete key set for {}: {}", canonical, e))?;
  Ok(())
}

/// Run `body` inside a transaction, rolling back if it fails.
fn transaction<F>(conn: &Connection, body: F) -> Result<()>
where
  F: FnOnce(&Connection) -> Result<()>,
{
  conn
    .execute("BEGIN TRANSACTION", [])
    .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

  match body(conn) {
    Ok(()) => {
      conn
        .execute("COMMIT", [])
        .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
      Ok(())
    }
    Err(e) => {
      let _ = conn.execute("ROLLBACK", []);
      Err(e)
    }
  }
}

impl CacheStorage for SqliteStorage {
  fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry<Value>>> {
    let conn = self.lock()?;

    let row: Option<(Vec<u8>, u32, i64, String)> = conn
      .query_row(
        "SELECT data, version, ttl_secs, cached_at FROM cache_entries WHERE key_hash = ?",
        params![key.storage_hash()],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry {}: {}", key, e))?;

    match row {
      Some((data, version, ttl_secs, cached_at)) => {
        let value: Value = serde_json::from_slice(&data)
          .map_err(|e| eyre!("Failed to deserialize entry {}: {}", key, e))?;
        Ok(Some(CacheEntry {
          value,
          cached_at: parse_datetime(&cached_at)?,
          ttl: Duration::seconds(ttl_secs),
          version,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, key: &CacheKey, entry: &CacheEntry<Value>) -> Result<()> {
    let conn = self.lock()?;
    insert_entry(&conn, key, entry, None)
  }

  fn write_entity(
    &self,
    canonical: &CacheKey,
    entries: &[(CacheKey, CacheEntry<Value>)],
  ) -> Result<()> {
    let conn = self.lock()?;
    let keys: Vec<&CacheKey> = entries.iter().map(|(key, _)| key).collect();
    let keys_json =
      serde_json::to_string(&keys).map_err(|e| eyre!("Failed to serialize key set: {}", e))?;

    transaction(&conn, |conn| {
      for (key, entry) in entries {
        insert_entry(conn, key, entry, Some(canonical))?;
      }
      conn
        .execute(
          "INSERT OR REPLACE INTO entity_key_sets (entity_type, entity_id, keys)
           VALUES (?, ?, ?)",
          params![canonical.entity_type, canonical.id, keys_json],
        )
        .map_err(|e| eyre!("Failed to store key set for {}: {}", canonical, e))?;
      Ok(())
    })
  }

  fn key_set(&self, canonical: &CacheKey) -> Result<Option<Vec<CacheKey>>> {
    let conn = self.lock()?;

    let keys: Option<String> = conn
      .query_row(
        "SELECT keys FROM entity_key_sets WHERE entity_type = ? AND entity_id = ?",
        params![canonical.entity_type, canonical.id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read key set for {}: {}", canonical, e))?;

    keys
      .map(|json| {
        serde_json::from_str(&json)
          .map_err(|e| eyre!("Failed to parse key set for {}: {}", canonical, e))
      })
      .transpose()
  }

  fn remove(&self, owner: Option<&CacheKey>, keys: &[CacheKey]) -> Result<()> {
    let conn = self.lock()?;
    let owner_hash = owner.map(CacheKey::storage_hash);

    transaction(&conn, |conn| {
      for key in keys {
        conn
          .execute(
            "DELETE FROM cache_entries
             WHERE key_hash = ?1 AND (?2 IS NULL OR owner IS NULL OR owner = ?2)",
            params![key.storage_hash(), owner_hash],
          )
          .map_err(|e| eyre!("Failed to delete entry {}: {}", key, e))?;
      }
      if let Some(owner) = owner.filter(|owner| keys.contains(owner)) {
        delete_key_set(conn, owner)?;
      }
      Ok(())
    })
  }

  fn remove_prefix(&self, prefix: &KeyPrefix) -> Result<usize> {
    let conn = self.lock()?;
    let index_prefix = format!("{}@", prefix.entity_type);

    let removed = match &prefix.id {
      Some(id) => conn.execute(
        "DELETE FROM cache_entries WHERE entity_type = ? AND entity_id = ?",
        params![prefix.entity_type, id],
      ),
      None => conn.execute(
        "DELETE FROM cache_entries
         WHERE entity_type = ?1 OR substr(entity_type, 1, length(?2)) = ?2",
        params![prefix.entity_type, index_prefix],
      ),
    }
    .map_err(|e| eyre!("Failed to delete entries under {:?}: {}", prefix, e))?;

    Ok(removed)
  }

  fn purge(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch("DELETE FROM cache_entries; DELETE FROM entity_key_sets;")
      .map_err(|e| eyre!("Failed to purge cache: {}", e))?;
    Ok(())
  }
}

/// Parse an RFC 3339 timestamp as stored by this module.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
