//! Offline sale queue.
//!
//! Sales are persisted locally the instant they occur, independent of
//! connectivity, then drained asynchronously to the remote store with
//! retry and backoff. The per-entry state machine is
//! `queued -> syncing -> { synced | failed -> queued (retry) }`; a synced
//! entry is removed from the local queue so it is never replayed.

pub mod tiered;

use chrono::{DateTime, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QueueConfig;
use crate::remote::RemoteStore;
use crate::types::{QueuedSale, SaleDraft, SyncOutcome, SyncState, TenantIdentity};
use tiered::TieredSaleStore;

/// Receipt returned to the caller by `enqueue`. `success` is always true
/// when any durability tier accepted the write.
#[derive(Debug, Clone)]
pub struct EnqueueReceipt {
  pub success: bool,
  pub sale_id: String,
  /// True when the primary store failed and the sale landed in the
  /// fallback tier
  pub degraded: bool,
  /// True when the sale was recorded under an emergency-generated tenant
  /// id and needs reconciliation
  pub provisional: bool,
}

pub struct SaleQueue {
  store: TieredSaleStore,
  config: QueueConfig,
  drain_in_flight: AtomicBool,
}

impl SaleQueue {
  pub fn new(store: TieredSaleStore, config: QueueConfig) -> Self {
    Self {
      store,
      config,
      drain_in_flight: AtomicBool::new(false),
    }
  }

  /// Persist a sale locally before any network attempt.
  ///
  /// Never fails: a primary-store error degrades to the fallback tier.
  /// `date_override` is assigned here from this host's monotonic view of
  /// now, regardless of any client-supplied date; the device clock is only
  /// recorded as informational `created_at_local`.
  pub fn enqueue(
    &self,
    tenant: &TenantIdentity,
    user_id: &str,
    draft: SaleDraft,
    client_date: Option<DateTime<Utc>>,
  ) -> EnqueueReceipt {
    let now = Utc::now();
    let sale = QueuedSale {
      id: generate_sale_id(now),
      tenant_id: tenant.tenant_id.clone(),
      user_id: user_id.to_string(),
      items: draft.items,
      total: draft.total,
      payment_method: draft.payment_method,
      created_at_local: client_date.unwrap_or(now),
      date_override: now,
      sync_state: SyncState::Queued,
      attempts: 0,
      last_error: None,
    };

    let degraded = match self.store.insert(&sale) {
      Ok(degraded) => degraded,
      Err(e) => {
        // Both tiers refusing is not expected; the fallback is memory-backed.
        warn!(sale_id = %sale.id, error = %e, "sale landed in no durable tier");
        false
      }
    };

    debug!(sale_id = %sale.id, degraded, "sale enqueued");

    EnqueueReceipt {
      success: true,
      sale_id: sale.id,
      degraded,
      provisional: tenant.is_provisional(),
    }
  }

  /// Attempt remote insertion for each pending entry in FIFO order.
  ///
  /// Single-flight: a second drain while one is running is a no-op. A
  /// failing entry is retried within the pass with linear backoff
  /// (`base_delay * attempts`) up to `max_retries`, then parked as failed
  /// for the next scheduled drain; it never blocks the entries behind it.
  pub async fn drain(&self, remote: &dyn RemoteStore) -> SyncOutcome {
    if self.drain_in_flight.swap(true, Ordering::SeqCst) {
      debug!("drain already in flight, skipping");
      return SyncOutcome::skipped();
    }

    let outcome = self.drain_inner(remote).await;
    self.drain_in_flight.store(false, Ordering::SeqCst);
    outcome
  }

  async fn drain_inner(&self, remote: &dyn RemoteStore) -> SyncOutcome {
    // A crash mid-drain leaves entries stuck in the syncing state;
    // requeue them so they are retried instead of stranded
    let reset = self.store.reset_interrupted();
    if reset > 0 {
      info!(reset, "requeued sales left syncing by an interrupted drain");
    }

    let pending = match self.store.pending() {
      Ok(pending) => pending,
      Err(e) => {
        warn!(error = %e, "failed to read sale queue, skipping drain");
        return SyncOutcome::default();
      }
    };

    if pending.is_empty() {
      return SyncOutcome {
        success: true,
        ..Default::default()
      };
    }

    let mut synced = 0;
    let mut failed = 0;

    for mut sale in pending {
      sale.sync_state = SyncState::Syncing;
      if let Err(e) = self.store.update(&sale) {
        warn!(sale_id = %sale.id, error = %e, "failed to mark sale syncing");
      }

      let mut tries_this_pass = 0u32;
      loop {
        // A retry after an ack-lost timeout can double-insert server-side;
        // no idempotency key is sent, which is a known accepted risk.
        match remote.insert_sale(&sale).await {
          Ok(()) => {
            if let Err(e) = self.store.remove(&sale.id) {
              warn!(sale_id = %sale.id, error = %e, "failed to remove acknowledged sale");
            }
            info!(sale_id = %sale.id, "sale synced to remote store");
            synced += 1;
            break;
          }
          Err(e) => {
            sale.attempts += 1;
            sale.last_error = Some(e.to_string());
            sale.sync_state = SyncState::Failed;
            if let Err(update_err) = self.store.update(&sale) {
              warn!(sale_id = %sale.id, error = %update_err, "failed to record sale failure");
            }

            tries_this_pass += 1;
            if tries_this_pass >= self.config.max_retries {
              warn!(
                sale_id = %sale.id,
                attempts = sale.attempts,
                error = %e,
                "sale parked as failed until next drain"
              );
              failed += 1;
              break;
            }

            let backoff =
              Duration::from_millis(self.config.retry_base_delay_ms * u64::from(sale.attempts));
            debug!(sale_id = %sale.id, ?backoff, "retrying sale after backoff");
            tokio::time::sleep(backoff).await;
          }
        }
      }
    }

    SyncOutcome {
      success: failed == 0,
      synced,
      failed,
      skipped: false,
    }
  }

  /// Entries awaiting drain, FIFO.
  pub fn pending(&self) -> Vec<QueuedSale> {
    self.store.pending().unwrap_or_default()
  }

  /// Total entries across both durability tiers.
  pub fn depth(&self) -> usize {
    self.store.depth()
  }
}

/// Client-generated, globally unique sale id: timestamp + random suffix.
fn generate_sale_id(now: DateTime<Utc>) -> String {
  let suffix: String = rand::rng()
    .sample_iter(&Alphanumeric)
    .take(6)
    .map(char::from)
    .collect();
  format!("sale_{}_{}", now.timestamp_millis(), suffix.to_lowercase())
}
