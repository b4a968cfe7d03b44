//! Core data model shared across the cache, queue and sync subsystems.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cache priority for a search-result hit (opportunistic, cheapest to reacquire).
pub const PRIORITY_SEARCH_RESULT: u8 = 1;
/// Cache priority for records written by the delta sync engine.
pub const PRIORITY_DELTA_SYNC: u8 = 2;
/// Cache priority for a direct single-product lookup.
pub const PRIORITY_DIRECT_LOOKUP: u8 = 3;
/// Cache priority for preloaded/popular records, evicted last.
pub const PRIORITY_PRELOAD: u8 = 4;

/// A product record held in the local cache.
///
/// Every record belongs to exactly one tenant. Cross-tenant access is
/// rejected at the identity-resolver boundary, not here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedProduct {
  pub id: String,
  pub tenant_id: String,
  pub name: String,
  /// Barcode / SKU, matched by `search` alongside the name
  pub code: Option<String>,
  pub price: f64,
  pub stock: f64,
  pub updated_at: DateTime<Utc>,
  /// 1..=4, see the PRIORITY_* constants. Biases eviction order.
  pub priority: u8,
}

/// Line item of a sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaleItem {
  pub product_id: String,
  pub quantity: f64,
  pub unit_price: f64,
  pub line_subtotal: f64,
}

/// Sync lifecycle of a queued sale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Queued,
  Syncing,
  Synced,
  Failed,
}

impl SyncState {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncState::Queued => "queued",
      SyncState::Syncing => "syncing",
      SyncState::Synced => "synced",
      SyncState::Failed => "failed",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "queued" => Some(SyncState::Queued),
      "syncing" => Some(SyncState::Syncing),
      "synced" => Some(SyncState::Synced),
      "failed" => Some(SyncState::Failed),
      _ => None,
    }
  }
}

/// A point-of-sale transaction persisted locally the instant it occurs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedSale {
  /// Client-generated id: `sale_<millis>_<random suffix>`. Not sent as the
  /// remote primary key; the remote store assigns its own.
  pub id: String,
  pub tenant_id: String,
  pub user_id: String,
  pub items: Vec<SaleItem>,
  pub total: f64,
  pub payment_method: String,
  /// Device clock at enqueue time, informational only
  pub created_at_local: DateTime<Utc>,
  /// Authoritative timestamp assigned at enqueue time. The device clock is
  /// never trusted for the value persisted server-side.
  pub date_override: DateTime<Utc>,
  pub sync_state: SyncState,
  pub attempts: u32,
  pub last_error: Option<String>,
}

/// Sale data as submitted by the caller, before the queue assigns id,
/// timestamps and sync state.
#[derive(Debug, Clone)]
pub struct SaleDraft {
  pub items: Vec<SaleItem>,
  pub total: f64,
  pub payment_method: String,
}

/// Aggregate counters derived from the local product store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheMetrics {
  pub total_products: u64,
  /// Epoch millis of the last successful sync. Only advances monotonically;
  /// a failed sync never updates it.
  pub last_sync_time: Option<i64>,
  pub hits: u64,
  pub misses: u64,
}

impl CacheMetrics {
  /// Hit rate over all lookups since startup, or `None` before any lookup.
  pub fn hit_rate(&self) -> Option<f64> {
    let lookups = self.hits + self.misses;
    if lookups == 0 {
      None
    } else {
      Some(self.hits as f64 / lookups as f64)
    }
  }
}

/// Which tier of the resolution cascade produced a tenant identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedFrom {
  Memory,
  SessionCache,
  LocalCache,
  AuthSession,
  /// Last-resort synthesized id. Data written under it is provisional and
  /// needs reconciliation once a real identity is available.
  EmergencyGenerated,
}

/// A resolved tenant identity, cached across several storage tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantIdentity {
  pub tenant_id: String,
  pub resolved_from: ResolvedFrom,
  pub resolved_at: DateTime<Utc>,
}

impl TenantIdentity {
  pub fn is_provisional(&self) -> bool {
    matches!(self.resolved_from, ResolvedFrom::EmergencyGenerated)
  }
}

/// Result of a sync or drain pass. Routine connectivity failures are
/// reported here rather than as errors, since sync is expected to fail
/// offline.
#[derive(Debug, Clone, Default)]
pub struct SyncOutcome {
  pub success: bool,
  /// Records applied (pull) or sales acknowledged (drain)
  pub synced: usize,
  /// Entries left in a failed state after this pass
  pub failed: usize,
  /// True when a single-flight guard skipped the pass entirely
  pub skipped: bool,
}

impl SyncOutcome {
  pub fn skipped() -> Self {
    Self {
      skipped: true,
      ..Default::default()
    }
  }
}
