//! Cache eviction.
//!
//! Reclaims space by dropping lowest-priority, least-recently-written
//! entries once the store exceeds its row budget. Eviction is never pure
//! LRU: a high-priority older entry outranks a low-priority newer one,
//! because priority reflects how the entry was obtained.

use tracing::{debug, warn};

use super::ProductStore;

impl ProductStore {
  /// Evict entries until the store is under `budget` rows.
  ///
  /// Housekeeping only: failures are logged and swallowed, leaving the
  /// store oversized rather than surfacing an error to the caller.
  /// Returns the number of evicted rows.
  pub fn optimize(&self, budget: u64) -> usize {
    match self.evict_to_budget(budget) {
      Ok(evicted) => {
        if evicted > 0 {
          debug!(evicted, budget, "cache optimize pass evicted entries");
        }
        evicted
      }
      Err(e) => {
        warn!(error = %e, "cache optimize pass failed, store left oversized");
        0
      }
    }
  }

  fn evict_to_budget(&self, budget: u64) -> color_eyre::Result<usize> {
    use color_eyre::eyre::eyre;

    let total = self.count()?;
    if total <= budget {
      return Ok(0);
    }
    let overage = total - budget;

    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Lowest priority first, oldest first within a priority band
    let evicted = conn
      .execute(
        "DELETE FROM products WHERE rowid IN (
           SELECT rowid FROM products ORDER BY priority ASC, updated_at ASC LIMIT ?
         )",
        rusqlite::params![overage as i64],
      )
      .map_err(|e| eyre!("Failed to evict cache entries: {}", e))?;

    drop(conn);
    self.metrics().invalidate();
    Ok(evicted)
  }
}
