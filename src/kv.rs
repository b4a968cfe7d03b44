//! Persisted key-value metadata storage.
//!
//! Holds small cross-cutting state: last sync time, cached tenant identity,
//! the scheduler's last push hash, and the degraded queue fallback. The
//! contract is synchronous and always available; callers treat a write
//! failure as the signal to drop to a lower durability tier.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::sync::Mutex;

pub const KEY_LAST_SYNC_TIME: &str = "last_sync_time";
pub const KEY_TENANT_IDENTITY: &str = "tenant_identity";
pub const KEY_LAST_PUSH_HASH: &str = "last_push_hash";
pub const KEY_FALLBACK_SALES: &str = "fallback_sales";

/// Synchronous key-value storage for metadata.
pub trait KvStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;
  fn set(&self, key: &str, value: &str) -> Result<()>;
  fn remove(&self, key: &str) -> Result<()>;
}

/// SQLite-backed implementation, sharing the cache database file.
pub struct SqliteKv {
  conn: Mutex<Connection>,
}

const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

impl SqliteKv {
  pub fn open(path: &std::path::Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| eyre!("Failed to create data directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open metadata database at {}: {}", path.display(), e))?;

    let kv = Self {
      conn: Mutex::new(conn),
    };
    kv.run_migrations()?;

    Ok(kv)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    let kv = Self {
      conn: Mutex::new(conn),
    };
    kv.run_migrations()?;
    Ok(kv)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| eyre!("Failed to run metadata migrations: {}", e))?;
    Ok(())
  }
}

impl KvStore for SqliteKv {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT value FROM kv_meta WHERE key = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let result: Option<String> = stmt.query_row(params![key], |row| row.get(0)).ok();
    Ok(result)
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to store metadata key {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_meta WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove metadata key {}: {}", key, e))?;

    Ok(())
  }
}

/// In-memory implementation for tests and as the lowest durability tier.
#[derive(Default)]
pub struct MemoryKv {
  map: Mutex<HashMap<String, String>>,
}

impl MemoryKv {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KvStore for MemoryKv {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let map = self
      .map
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(map.get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let mut map = self
      .map
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    map.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut map = self
      .map
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    map.remove(key);
    Ok(())
  }
}
