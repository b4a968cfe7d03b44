//! Background sync scheduling.
//!
//! Cooperative and debounced: local mutations schedule a push after a
//! quiet period instead of pushing on every change, and a periodic loop
//! pulls remote changes only when the device reports online and the cache
//! is old enough. Single-flight guarantees live in the sync engine and
//! the sale queue; this controller decides *when* to trigger them.
//!
//! All state that was implicit module scope in ancestors of this design
//! (in-progress flags, last push hash, debounce timer) lives on one
//! explicitly constructed controller instance.

use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SchedulerConfig;
use crate::identity::IdentityResolver;
use crate::kv::{KvStore, KEY_LAST_PUSH_HASH};
use crate::queue::SaleQueue;
use crate::remote::RemoteStore;
use crate::store::metrics::read_last_sync_time;
use crate::store::ProductStore;
use crate::sync::DeltaSyncEngine;
use crate::types::SyncOutcome;

pub struct SyncController {
  engine: Arc<DeltaSyncEngine>,
  queue: Arc<SaleQueue>,
  store: Arc<ProductStore>,
  remote: Arc<dyn RemoteStore>,
  identity: Arc<IdentityResolver>,
  kv: Arc<dyn KvStore>,
  config: SchedulerConfig,
  online: AtomicBool,
  last_push_hash: Mutex<Option<String>>,
  /// Pending debounced push; replaced (and the old one cancelled) on each
  /// new trigger
  debounce: Mutex<Option<JoinHandle<()>>>,
}

impl SyncController {
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    engine: Arc<DeltaSyncEngine>,
    queue: Arc<SaleQueue>,
    store: Arc<ProductStore>,
    remote: Arc<dyn RemoteStore>,
    identity: Arc<IdentityResolver>,
    kv: Arc<dyn KvStore>,
    config: SchedulerConfig,
  ) -> Arc<Self> {
    let last_push_hash = kv.get(KEY_LAST_PUSH_HASH).ok().flatten();
    Arc::new(Self {
      engine,
      queue,
      store,
      remote,
      identity,
      kv,
      config,
      online: AtomicBool::new(false),
      last_push_hash: Mutex::new(last_push_hash),
      debounce: Mutex::new(None),
    })
  }

  /// The host app reports connectivity; the core never probes for it.
  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// A local mutation occurred. Schedules a push after the quiet period,
  /// cancelling any previously scheduled (not in-flight) push so bursts
  /// coalesce into one network call.
  pub fn note_local_mutation(self: &Arc<Self>) {
    let mut debounce = match self.debounce.lock() {
      Ok(d) => d,
      Err(_) => return,
    };

    if let Some(handle) = debounce.take() {
      handle.abort();
    }

    let controller = Arc::clone(self);
    let quiet = std::time::Duration::from_millis(self.config.push_debounce_ms);
    *debounce = Some(tokio::spawn(async move {
      tokio::time::sleep(quiet).await;
      controller.push(false).await;
    }));
  }

  /// Push local changes (drain the sale queue).
  ///
  /// Unless forced, an unchanged structural hash skips the network call
  /// entirely, and an offline device is a silent no-op.
  pub async fn push(&self, force: bool) -> SyncOutcome {
    if !self.is_online() {
      debug!("push skipped: device offline");
      return SyncOutcome::default();
    }

    let hash = self.structural_hash();
    if !force {
      let last = self.last_push_hash.lock().ok().and_then(|h| h.clone());
      if last.as_deref() == Some(hash.as_str()) {
        debug!("push skipped: structural hash unchanged");
        return SyncOutcome::skipped();
      }
    }

    let outcome = self.queue.drain(&*self.remote).await;

    if !outcome.skipped {
      // Re-hash after the drain so the stored value reflects the drained
      // queue, not the pre-push state
      let post_hash = self.structural_hash();
      if let Ok(mut last) = self.last_push_hash.lock() {
        *last = Some(post_hash.clone());
      }
      if let Err(e) = self.kv.set(KEY_LAST_PUSH_HASH, &post_hash) {
        warn!(error = %e, "failed to persist push hash");
      }
    }

    outcome
  }

  /// Pull remote changes into the product cache.
  ///
  /// Unless forced, runs only when online and the last successful sync is
  /// older than the pull interval. Refuses to run without a resolvable
  /// (non-provisional) tenant identity.
  pub async fn pull(&self, force: bool) -> SyncOutcome {
    if !self.is_online() {
      debug!("pull skipped: device offline");
      return SyncOutcome::default();
    }

    if !force && !self.pull_due() {
      debug!("pull skipped: cache still fresh");
      return SyncOutcome::skipped();
    }

    let tenant = match self.identity.resolve().await {
      Some(tenant) => tenant,
      None => {
        warn!("pull refused: no tenant identity resolvable");
        return SyncOutcome::default();
      }
    };

    self.engine.sync(&tenant.tenant_id, force).await
  }

  /// Spawn the periodic check loop. Each wakeup considers a pull and a
  /// queue drain; both are cheap no-ops when nothing is due.
  pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
    let controller = Arc::clone(self);
    tokio::spawn(async move {
      let period = std::time::Duration::from_secs(controller.config.check_interval_secs);
      let mut ticker = tokio::time::interval(period);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      // First tick fires immediately; skip it so startup isn't a sync storm
      ticker.tick().await;

      loop {
        ticker.tick().await;
        if !controller.is_online() {
          continue;
        }

        controller.pull(false).await;
        if !controller.queue.pending().is_empty() {
          controller.push(true).await;
        }
      }
    })
  }

  fn pull_due(&self) -> bool {
    let Some(last_millis) = read_last_sync_time(&*self.kv) else {
      return true;
    };
    let elapsed_ms = chrono::Utc::now().timestamp_millis() - last_millis;
    elapsed_ms >= (self.config.pull_interval_secs as i64) * 1000
  }

  /// Lightweight structural hash: record counts and serialized settings
  /// length, not a deep diff.
  fn structural_hash(&self) -> String {
    let product_count = self.store.count().unwrap_or(0);
    let queue_depth = self.queue.depth();
    let settings_len = format!("{:?}", self.config).len();

    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", product_count, queue_depth, settings_len).as_bytes());
    hex::encode(hasher.finalize())
  }
}
