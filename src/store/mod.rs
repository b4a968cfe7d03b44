//! Local product store: durable, embedded cache of product records.
//!
//! Each record is tagged with a priority (how it was obtained) and a
//! last-write timestamp; the two jointly decide eviction order. Tenant
//! scoping is enforced by the callers through the identity resolver; the
//! store itself filters reads by the tenant id it is handed.

pub mod metrics;
pub mod optimizer;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use crate::types::CachedProduct;
use metrics::MetricsTracker;

/// Schema for the product cache.
const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    name TEXT NOT NULL,
    code TEXT,
    price REAL NOT NULL,
    stock REAL NOT NULL,
    updated_at INTEGER NOT NULL,
    priority INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_products_tenant ON products(tenant_id);
CREATE INDEX IF NOT EXISTS idx_products_eviction ON products(priority, updated_at);
CREATE INDEX IF NOT EXISTS idx_products_tenant_name ON products(tenant_id, name);
"#;

/// SQLite-backed local product store.
pub struct ProductStore {
  conn: Mutex<Connection>,
  metrics: MetricsTracker,
}

impl ProductStore {
  /// Open or create the store at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
      metrics: MetricsTracker::new(),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Open an in-memory store (tests).
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    let store = Self {
      conn: Mutex::new(conn),
      metrics: MetricsTracker::new(),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;
    Ok(())
  }

  pub fn metrics(&self) -> &MetricsTracker {
    &self.metrics
  }

  /// Upsert a batch of records at the given priority.
  ///
  /// The whole batch applies or none of it does; a partial write would
  /// leave the derived metrics inconsistent. Bumps `updated_at` on every
  /// record so eviction recency tracks the last write, not the remote
  /// modification time.
  pub fn put(&self, records: &[CachedProduct], priority: u8) -> Result<()> {
    if records.is_empty() {
      return Ok(());
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let now = Utc::now().timestamp_millis();

    conn
      .execute("BEGIN TRANSACTION", [])
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for record in records {
      let result = conn.execute(
        "INSERT OR REPLACE INTO products (id, tenant_id, name, code, price, stock, updated_at, priority)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          record.id,
          record.tenant_id,
          record.name,
          record.code,
          record.price,
          record.stock,
          now,
          priority
        ],
      );

      if let Err(e) = result {
        // Roll back so the batch is all-or-nothing
        let _ = conn.execute("ROLLBACK", []);
        return Err(eyre!("Failed to store product {}: {}", record.id, e));
      }
    }

    conn
      .execute("COMMIT", [])
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    drop(conn);
    self.metrics.invalidate();
    Ok(())
  }

  /// Look up a single product by id, scoped to the given tenant.
  pub fn get(&self, tenant_id: &str, id: &str) -> Result<Option<CachedProduct>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, tenant_id, name, code, price, stock, updated_at, priority
         FROM products WHERE tenant_id = ? AND id = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    // Only an absent row is a miss; storage errors must surface
    let product = stmt
      .query_row(params![tenant_id, id], row_to_product)
      .optional()
      .map_err(|e| eyre!("Failed to look up product {}: {}", id, e))?;

    drop(stmt);
    drop(conn);

    match product {
      Some(p) => {
        self.metrics.record_hit();
        Ok(Some(p))
      }
      None => {
        self.metrics.record_miss();
        Ok(None)
      }
    }
  }

  /// Case-insensitive substring search on name and code, scoped to tenant.
  ///
  /// Results are ordered by relevance (name-prefix matches first), then
  /// priority descending, then name.
  pub fn search(&self, tenant_id: &str, query: &str, limit: usize) -> Result<Vec<CachedProduct>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let needle = query.trim().to_lowercase();
    let substring = format!("%{}%", needle);
    let prefix = format!("{}%", needle);

    let mut stmt = conn
      .prepare(
        "SELECT id, tenant_id, name, code, price, stock, updated_at, priority
         FROM products
         WHERE tenant_id = ?1 AND (lower(name) LIKE ?2 OR lower(code) LIKE ?2)
         ORDER BY CASE WHEN lower(name) LIKE ?3 THEN 0 ELSE 1 END, priority DESC, name
         LIMIT ?4",
      )
      .map_err(|e| eyre!("Failed to prepare search: {}", e))?;

    let results: Vec<CachedProduct> = stmt
      .query_map(params![tenant_id, substring, prefix, limit as i64], row_to_product)
      .map_err(|e| eyre!("Failed to search products: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    drop(stmt);
    drop(conn);

    if results.is_empty() {
      self.metrics.record_miss();
    } else {
      self.metrics.record_hit();
    }

    Ok(results)
  }

  /// Total cached products, served from the metrics cache when valid.
  pub fn count(&self) -> Result<u64> {
    if let Some(total) = self.metrics.cached_total() {
      return Ok(total);
    }

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let total: i64 = conn
      .query_row("SELECT COUNT(*) FROM products", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count products: {}", e))?;

    drop(conn);
    self.metrics.set_total(total as u64);
    Ok(total as u64)
  }

  /// Drop every cached record. Metrics are invalidated, hit/miss counters
  /// are left alone.
  pub fn clear(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM products", [])
      .map_err(|e| eyre!("Failed to clear product cache: {}", e))?;

    drop(conn);
    self.metrics.invalidate();
    Ok(())
  }

  /// Make every subsequent insert fail while reads keep working,
  /// simulating a full or read-only disk.
  #[cfg(test)]
  pub(crate) fn reject_writes(&self) {
    let conn = self.conn.lock().unwrap();
    conn
      .execute_batch(
        "CREATE TRIGGER reject_writes BEFORE INSERT ON products
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
      )
      .unwrap();
  }
}

fn row_to_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedProduct> {
  let updated_millis: i64 = row.get(6)?;
  Ok(CachedProduct {
    id: row.get(0)?,
    tenant_id: row.get(1)?,
    name: row.get(2)?,
    code: row.get(3)?,
    price: row.get(4)?,
    stock: row.get(5)?,
    updated_at: DateTime::<Utc>::from_timestamp_millis(updated_millis).unwrap_or_else(Utc::now),
    priority: row.get::<_, i64>(7)? as u8,
  })
}

#[cfg(test)]
pub(crate) fn test_product(id: &str, tenant: &str, name: &str) -> CachedProduct {
  CachedProduct {
    id: id.to_string(),
    tenant_id: tenant.to_string(),
    name: name.to_string(),
    code: None,
    price: 10.0,
    stock: 5.0,
    updated_at: Utc::now(),
    priority: crate::types::PRIORITY_DELTA_SYNC,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{PRIORITY_DIRECT_LOOKUP, PRIORITY_SEARCH_RESULT};

  #[test]
  fn test_put_and_get() {
    let store = ProductStore::open_in_memory().unwrap();
    store
      .put(&[test_product("p1", "T1", "Margherita Pizza")], PRIORITY_DIRECT_LOOKUP)
      .unwrap();

    let found = store.get("T1", "p1").unwrap().unwrap();
    assert_eq!(found.name, "Margherita Pizza");
    assert_eq!(found.priority, PRIORITY_DIRECT_LOOKUP);

    assert!(store.get("T1", "p2").unwrap().is_none());
  }

  #[test]
  fn test_put_upserts_by_id() {
    let store = ProductStore::open_in_memory().unwrap();
    store
      .put(&[test_product("p1", "T1", "Old Name")], PRIORITY_SEARCH_RESULT)
      .unwrap();
    store
      .put(&[test_product("p1", "T1", "New Name")], PRIORITY_DIRECT_LOOKUP)
      .unwrap();

    assert_eq!(store.count().unwrap(), 1);
    let found = store.get("T1", "p1").unwrap().unwrap();
    assert_eq!(found.name, "New Name");
    assert_eq!(found.priority, PRIORITY_DIRECT_LOOKUP);
  }

  #[test]
  fn test_search_matches_name_and_code_case_insensitive() {
    let store = ProductStore::open_in_memory().unwrap();
    let mut with_code = test_product("p2", "T1", "House Soda");
    with_code.code = Some("PIZZA-99".to_string());

    store
      .put(
        &[test_product("p1", "T1", "Margherita Pizza"), with_code],
        PRIORITY_SEARCH_RESULT,
      )
      .unwrap();

    let results = store.search("T1", "pizza", 10).unwrap();
    assert_eq!(results.len(), 2);

    let results = store.search("T1", "PIZZA", 10).unwrap();
    assert_eq!(results.len(), 2);
  }

  #[test]
  fn test_search_orders_prefix_then_priority() {
    let store = ProductStore::open_in_memory().unwrap();
    store
      .put(&[test_product("p1", "T1", "Veggie Pizza")], PRIORITY_DIRECT_LOOKUP)
      .unwrap();
    store
      .put(&[test_product("p2", "T1", "Pizza Slice")], PRIORITY_SEARCH_RESULT)
      .unwrap();

    // Prefix match on the name outranks higher priority
    let results = store.search("T1", "pizza", 10).unwrap();
    assert_eq!(results[0].id, "p2");
    assert_eq!(results[1].id, "p1");
  }

  #[test]
  fn test_search_respects_limit() {
    let store = ProductStore::open_in_memory().unwrap();
    let batch: Vec<_> = (0..10)
      .map(|i| test_product(&format!("p{}", i), "T1", &format!("Pizza {}", i)))
      .collect();
    store.put(&batch, PRIORITY_SEARCH_RESULT).unwrap();

    let results = store.search("T1", "pizza", 3).unwrap();
    assert_eq!(results.len(), 3);
  }

  #[test]
  fn test_tenant_isolation_on_reads() {
    let store = ProductStore::open_in_memory().unwrap();
    store
      .put(
        &[
          test_product("a1", "T1", "Pizza A"),
          test_product("b1", "T2", "Pizza B"),
        ],
        PRIORITY_SEARCH_RESULT,
      )
      .unwrap();

    let results = store.search("T1", "pizza", 10).unwrap();
    assert!(results.iter().all(|p| p.tenant_id == "T1"));
    assert_eq!(results.len(), 1);

    // A get scoped to T1 never returns T2's record
    assert!(store.get("T1", "b1").unwrap().is_none());
    assert!(store.get("T2", "b1").unwrap().is_some());
  }

  #[test]
  fn test_mutations_invalidate_metrics() {
    let store = ProductStore::open_in_memory().unwrap();
    assert_eq!(store.count().unwrap(), 0);

    store
      .put(&[test_product("p1", "T1", "Pizza")], PRIORITY_SEARCH_RESULT)
      .unwrap();
    assert_eq!(store.count().unwrap(), 1);

    store.clear().unwrap();
    assert_eq!(store.count().unwrap(), 0);
  }

  #[test]
  fn test_get_surfaces_storage_errors_without_counting_a_miss() {
    let store = ProductStore::open_in_memory().unwrap();
    store
      .conn
      .lock()
      .unwrap()
      .execute_batch("DROP TABLE products")
      .unwrap();

    assert!(store.get("T1", "p1").is_err());
    assert_eq!(store.metrics().counters(), (0, 0));
  }

  #[test]
  fn test_hit_miss_counters() {
    let store = ProductStore::open_in_memory().unwrap();
    store
      .put(&[test_product("p1", "T1", "Pizza")], PRIORITY_SEARCH_RESULT)
      .unwrap();

    store.get("T1", "p1").unwrap();
    store.get("T1", "nope").unwrap();
    store.search("T1", "pizza", 10).unwrap();
    store.search("T1", "sushi", 10).unwrap();

    let (hits, misses) = store.metrics().counters();
    assert_eq!(hits, 2);
    assert_eq!(misses, 2);
  }
}
