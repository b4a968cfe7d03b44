//! Derived cache metrics.
//!
//! Counters are recomputed from the product store rather than persisted;
//! every mutating store call invalidates the cached total so the next read
//! recomputes it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::kv::{KvStore, KEY_LAST_SYNC_TIME};
use crate::types::CacheMetrics;

/// Tracks hit/miss counters and the lazily cached product total.
pub struct MetricsTracker {
  hits: AtomicU64,
  misses: AtomicU64,
  cached_total: Mutex<Option<u64>>,
}

impl MetricsTracker {
  pub fn new() -> Self {
    Self {
      hits: AtomicU64::new(0),
      misses: AtomicU64::new(0),
      cached_total: Mutex::new(None),
    }
  }

  pub fn record_hit(&self) {
    self.hits.fetch_add(1, Ordering::Relaxed);
  }

  pub fn record_miss(&self) {
    self.misses.fetch_add(1, Ordering::Relaxed);
  }

  pub fn counters(&self) -> (u64, u64) {
    (
      self.hits.load(Ordering::Relaxed),
      self.misses.load(Ordering::Relaxed),
    )
  }

  /// Invalidate the cached product total after any store mutation.
  pub fn invalidate(&self) {
    if let Ok(mut cached) = self.cached_total.lock() {
      *cached = None;
    }
  }

  pub fn cached_total(&self) -> Option<u64> {
    self.cached_total.lock().ok().and_then(|c| *c)
  }

  pub fn set_total(&self, total: u64) {
    if let Ok(mut cached) = self.cached_total.lock() {
      *cached = Some(total);
    }
  }

  /// Assemble a metrics snapshot from the given total and the persisted
  /// last sync time.
  pub fn snapshot(&self, total_products: u64, kv: &dyn KvStore) -> CacheMetrics {
    let (hits, misses) = self.counters();
    CacheMetrics {
      total_products,
      last_sync_time: read_last_sync_time(kv),
      hits,
      misses,
    }
  }
}

impl Default for MetricsTracker {
  fn default() -> Self {
    Self::new()
  }
}

/// Read the persisted last sync time (epoch millis), if any.
pub fn read_last_sync_time(kv: &dyn KvStore) -> Option<i64> {
  kv.get(KEY_LAST_SYNC_TIME)
    .ok()
    .flatten()
    .and_then(|v| v.parse::<i64>().ok())
}

/// Advance the persisted last sync time, keeping it monotonic. A value
/// older than the stored one is ignored.
pub fn advance_last_sync_time(kv: &dyn KvStore, now_millis: i64) -> color_eyre::Result<()> {
  if let Some(existing) = read_last_sync_time(kv) {
    if now_millis <= existing {
      return Ok(());
    }
  }
  kv.set(KEY_LAST_SYNC_TIME, &now_millis.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kv::MemoryKv;

  #[test]
  fn test_hit_rate() {
    let tracker = MetricsTracker::new();
    let kv = MemoryKv::new();

    let metrics = tracker.snapshot(0, &kv);
    assert_eq!(metrics.hit_rate(), None);

    tracker.record_hit();
    tracker.record_hit();
    tracker.record_miss();

    let metrics = tracker.snapshot(0, &kv);
    assert_eq!(metrics.hits, 2);
    assert_eq!(metrics.misses, 1);
    assert!((metrics.hit_rate().unwrap() - 2.0 / 3.0).abs() < f64::EPSILON);
  }

  #[test]
  fn test_last_sync_time_is_monotonic() {
    let kv = MemoryKv::new();

    assert_eq!(read_last_sync_time(&kv), None);

    advance_last_sync_time(&kv, 1000).unwrap();
    assert_eq!(read_last_sync_time(&kv), Some(1000));

    // Going backwards is ignored
    advance_last_sync_time(&kv, 500).unwrap();
    assert_eq!(read_last_sync_time(&kv), Some(1000));

    advance_last_sync_time(&kv, 2000).unwrap();
    assert_eq!(read_last_sync_time(&kv), Some(2000));
  }

  #[test]
  fn test_total_cache_invalidation() {
    let tracker = MetricsTracker::new();
    assert_eq!(tracker.cached_total(), None);

    tracker.set_total(42);
    assert_eq!(tracker.cached_total(), Some(42));

    tracker.invalidate();
    assert_eq!(tracker.cached_total(), None);
  }
}
