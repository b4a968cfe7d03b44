//! Two-tier durable storage for queued sales.
//!
//! The primary tier is the embedded SQLite table. When a primary write
//! fails (quota, corruption), the write drops to a lightweight in-memory
//! tier mirrored into the KV metadata store, and the degradation is
//! logged. The facade makes the degraded path a first-class branch rather
//! than a catch-block side effect.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::kv::{KvStore, KEY_FALLBACK_SALES};
use crate::types::{QueuedSale, SyncState};

/// Storage contract shared by both durability tiers.
pub trait SaleStore: Send + Sync {
  fn insert(&self, sale: &QueuedSale) -> Result<()>;
  /// Update sync state bookkeeping for an entry; missing entries are a no-op.
  fn update(&self, sale: &QueuedSale) -> Result<()>;
  fn remove(&self, id: &str) -> Result<()>;
  /// Entries awaiting drain (queued or failed), in FIFO enqueue order.
  fn pending(&self) -> Result<Vec<QueuedSale>>;
  fn depth(&self) -> Result<usize>;
  /// Requeue entries left in the syncing state by an interrupted drain.
  /// Returns how many were reset.
  fn reset_interrupted(&self) -> Result<usize>;
}

const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sales_queue (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    items TEXT NOT NULL,
    total REAL NOT NULL,
    payment_method TEXT NOT NULL,
    created_at_local INTEGER NOT NULL,
    date_override INTEGER NOT NULL,
    sync_state TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT
);
"#;

/// Primary tier: SQLite-backed.
pub struct SqliteSaleStore {
  conn: Mutex<Connection>,
}

impl SqliteSaleStore {
  pub fn open(path: &std::path::Path) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create queue directory: {}", e))?;
    }
    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open queue database at {}: {}", path.display(), e))?;
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    let store = Self {
      conn: Mutex::new(conn),
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
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;
    Ok(())
  }
}

fn row_to_sale(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueuedSale> {
  use chrono::{DateTime, Utc};

  let items_json: String = row.get(3)?;
  let created_millis: i64 = row.get(6)?;
  let override_millis: i64 = row.get(7)?;
  let state_str: String = row.get(8)?;

  Ok(QueuedSale {
    id: row.get(0)?,
    tenant_id: row.get(1)?,
    user_id: row.get(2)?,
    items: serde_json::from_str(&items_json).unwrap_or_default(),
    total: row.get(4)?,
    payment_method: row.get(5)?,
    created_at_local: DateTime::<Utc>::from_timestamp_millis(created_millis)
      .unwrap_or_else(Utc::now),
    date_override: DateTime::<Utc>::from_timestamp_millis(override_millis)
      .unwrap_or_else(Utc::now),
    sync_state: SyncState::parse(&state_str).unwrap_or(SyncState::Queued),
    attempts: row.get::<_, i64>(9)? as u32,
    last_error: row.get(10)?,
  })
}

impl SaleStore for SqliteSaleStore {
  fn insert(&self, sale: &QueuedSale) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let items = serde_json::to_string(&sale.items)
      .map_err(|e| eyre!("Failed to serialize sale items: {}", e))?;

    conn
      .execute(
        "INSERT INTO sales_queue (id, tenant_id, user_id, items, total, payment_method,
                                  created_at_local, date_override, sync_state, attempts, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          sale.id,
          sale.tenant_id,
          sale.user_id,
          items,
          sale.total,
          sale.payment_method,
          sale.created_at_local.timestamp_millis(),
          sale.date_override.timestamp_millis(),
          sale.sync_state.as_str(),
          sale.attempts,
          sale.last_error
        ],
      )
      .map_err(|e| eyre!("Failed to persist sale {}: {}", sale.id, e))?;

    Ok(())
  }

  fn update(&self, sale: &QueuedSale) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "UPDATE sales_queue SET sync_state = ?, attempts = ?, last_error = ? WHERE id = ?",
        params![
          sale.sync_state.as_str(),
          sale.attempts,
          sale.last_error,
          sale.id
        ],
      )
      .map_err(|e| eyre!("Failed to update sale {}: {}", sale.id, e))?;

    Ok(())
  }

  fn remove(&self, id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM sales_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove sale {}: {}", id, e))?;

    Ok(())
  }

  fn pending(&self) -> Result<Vec<QueuedSale>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(
        "SELECT id, tenant_id, user_id, items, total, payment_method,
                created_at_local, date_override, sync_state, attempts, last_error
         FROM sales_queue WHERE sync_state IN ('queued', 'failed')
         ORDER BY rowid",
      )
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let sales: Vec<QueuedSale> = stmt
      .query_map([], row_to_sale)
      .map_err(|e| eyre!("Failed to read sale queue: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(sales)
  }

  fn depth(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let depth: i64 = conn
      .query_row("SELECT COUNT(*) FROM sales_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count sale queue: {}", e))?;

    Ok(depth as usize)
  }

  fn reset_interrupted(&self) -> Result<usize> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let reset = conn
      .execute(
        "UPDATE sales_queue SET sync_state = 'queued' WHERE sync_state = 'syncing'",
        [],
      )
      .map_err(|e| eyre!("Failed to requeue interrupted sales: {}", e))?;

    Ok(reset)
  }
}

/// Fallback tier: in-memory list, best-effort mirrored into the KV store so
/// a crash during degraded operation still has a trace to reconcile from.
pub struct FallbackSaleStore {
  sales: Mutex<Vec<QueuedSale>>,
  kv: Arc<dyn KvStore>,
}

impl FallbackSaleStore {
  pub fn new(kv: Arc<dyn KvStore>) -> Self {
    // Recover anything a previous degraded run left behind
    let recovered: Vec<QueuedSale> = kv
      .get(KEY_FALLBACK_SALES)
      .ok()
      .flatten()
      .and_then(|raw| serde_json::from_str(&raw).ok())
      .unwrap_or_default();

    Self {
      sales: Mutex::new(recovered),
      kv,
    }
  }

  fn mirror(&self, sales: &[QueuedSale]) {
    match serde_json::to_string(sales) {
      Ok(json) => {
        if let Err(e) = self.kv.set(KEY_FALLBACK_SALES, &json) {
          warn!(error = %e, "failed to mirror fallback sale list");
        }
      }
      Err(e) => warn!(error = %e, "failed to serialize fallback sale list"),
    }
  }
}

impl SaleStore for FallbackSaleStore {
  fn insert(&self, sale: &QueuedSale) -> Result<()> {
    let mut sales = self
      .sales
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    sales.push(sale.clone());
    self.mirror(&sales);
    Ok(())
  }

  fn update(&self, sale: &QueuedSale) -> Result<()> {
    let mut sales = self
      .sales
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    if let Some(existing) = sales.iter_mut().find(|s| s.id == sale.id) {
      *existing = sale.clone();
      self.mirror(&sales);
    }
    Ok(())
  }

  fn remove(&self, id: &str) -> Result<()> {
    let mut sales = self
      .sales
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    sales.retain(|s| s.id != id);
    self.mirror(&sales);
    Ok(())
  }

  fn pending(&self) -> Result<Vec<QueuedSale>> {
    let sales = self
      .sales
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      sales
        .iter()
        .filter(|s| matches!(s.sync_state, SyncState::Queued | SyncState::Failed))
        .cloned()
        .collect(),
    )
  }

  fn depth(&self) -> Result<usize> {
    let sales = self
      .sales
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(sales.len())
  }

  fn reset_interrupted(&self) -> Result<usize> {
    let mut sales = self
      .sales
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut reset = 0;
    for sale in sales.iter_mut() {
      if sale.sync_state == SyncState::Syncing {
        sale.sync_state = SyncState::Queued;
        reset += 1;
      }
    }
    if reset > 0 {
      self.mirror(&sales);
    }
    Ok(reset)
  }
}

/// Facade over both tiers. Writes land in the primary store; a primary
/// failure degrades to the fallback instead of losing the sale.
pub struct TieredSaleStore {
  primary: Box<dyn SaleStore>,
  fallback: Box<dyn SaleStore>,
}

impl TieredSaleStore {
  pub fn new(primary: Box<dyn SaleStore>, fallback: Box<dyn SaleStore>) -> Self {
    Self { primary, fallback }
  }

  /// Persist a sale, degrading to the fallback tier on primary failure.
  /// Returns whether the write was degraded.
  pub fn insert(&self, sale: &QueuedSale) -> Result<bool> {
    match self.primary.insert(sale) {
      Ok(()) => Ok(false),
      Err(primary_err) => {
        warn!(
          sale_id = %sale.id,
          error = %primary_err,
          "primary sale store failed, degrading to fallback tier"
        );
        self.fallback.insert(sale)?;
        Ok(true)
      }
    }
  }

  /// Entries awaiting drain across both tiers, primary first (the fallback
  /// only ever holds writes that arrived after the primary failed).
  pub fn pending(&self) -> Result<Vec<QueuedSale>> {
    let mut sales = self.primary.pending().unwrap_or_default();
    sales.extend(self.fallback.pending()?);
    Ok(sales)
  }

  /// Route an update to whichever tier holds the entry. Both calls are
  /// no-ops for absent ids, so applying to both is safe.
  pub fn update(&self, sale: &QueuedSale) -> Result<()> {
    if let Err(e) = self.primary.update(sale) {
      warn!(sale_id = %sale.id, error = %e, "primary sale store update failed");
    }
    self.fallback.update(sale)
  }

  pub fn remove(&self, id: &str) -> Result<()> {
    if let Err(e) = self.primary.remove(id) {
      warn!(sale_id = %id, error = %e, "primary sale store remove failed");
    }
    self.fallback.remove(id)
  }

  pub fn depth(&self) -> usize {
    self.primary.depth().unwrap_or(0) + self.fallback.depth().unwrap_or(0)
  }

  /// Requeue syncing entries an interrupted drain left behind, in both
  /// tiers. A tier failing to reset is logged, not fatal; its entries
  /// get another chance on the next pass.
  pub fn reset_interrupted(&self) -> usize {
    let mut reset = 0;
    match self.primary.reset_interrupted() {
      Ok(n) => reset += n,
      Err(e) => warn!(error = %e, "primary sale store failed to requeue interrupted sales"),
    }
    match self.fallback.reset_interrupted() {
      Ok(n) => reset += n,
      Err(e) => warn!(error = %e, "fallback sale store failed to requeue interrupted sales"),
    }
    reset
  }
}
