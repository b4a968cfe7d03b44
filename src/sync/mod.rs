//! Delta synchronization of the local product cache against the remote
//! store.
//!
//! A non-forced sync inside the delta window only asks the remote for
//! records changed since the last successful sync; anything else fetches
//! the full tenant-scoped set. Sync is routinely expected to fail offline,
//! so failures surface as a [`SyncOutcome`], never as an error past this
//! boundary.

pub mod scheduler;

use chrono::{DateTime, Duration, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::CacheConfig;
use crate::kv::KvStore;
use crate::remote::RemoteStore;
use crate::store::metrics::{advance_last_sync_time, read_last_sync_time};
use crate::store::ProductStore;
use crate::types::{SyncOutcome, PRIORITY_DELTA_SYNC};

pub struct DeltaSyncEngine {
  store: Arc<ProductStore>,
  kv: Arc<dyn KvStore>,
  remote: Arc<dyn RemoteStore>,
  config: CacheConfig,
  in_flight: AtomicBool,
}

impl DeltaSyncEngine {
  pub fn new(
    store: Arc<ProductStore>,
    kv: Arc<dyn KvStore>,
    remote: Arc<dyn RemoteStore>,
    config: CacheConfig,
  ) -> Self {
    Self {
      store,
      kv,
      remote,
      config,
      in_flight: AtomicBool::new(false),
    }
  }

  /// Reconcile the local cache for a tenant.
  ///
  /// Single-flight: a concurrent call observes the in-progress flag and
  /// returns immediately without network I/O. On success the persisted
  /// last-sync time advances; on failure it is left untouched.
  pub async fn sync(&self, tenant_id: &str, force: bool) -> SyncOutcome {
    if self.in_flight.swap(true, Ordering::SeqCst) {
      debug!("sync already in flight, skipping");
      return SyncOutcome::skipped();
    }

    let outcome = self.sync_inner(tenant_id, force).await;
    self.in_flight.store(false, Ordering::SeqCst);
    outcome
  }

  async fn sync_inner(&self, tenant_id: &str, force: bool) -> SyncOutcome {
    let updated_since = if force { None } else { self.delta_cursor() };

    match updated_since {
      Some(since) => debug!(tenant_id, %since, "delta sync: fetching changes since last sync"),
      None => debug!(tenant_id, force, "full sync: fetching entire tenant set"),
    }

    let rows = match self.remote.fetch_products(tenant_id, updated_since).await {
      Ok(rows) => rows,
      Err(e) => {
        // Routine when offline: preserve last good state, report failure
        warn!(tenant_id, error = %e, "product sync failed, keeping last sync time");
        return SyncOutcome::default();
      }
    };

    let count = rows.len();

    // Applied in arrival order: a later duplicate for the same id
    // overwrites an earlier one, since the remote is the source of truth
    // for "latest".
    let records: Vec<_> = rows
      .into_iter()
      .map(|r| r.into_cached(PRIORITY_DELTA_SYNC))
      .collect();

    if let Err(e) = self.store.put(&records, PRIORITY_DELTA_SYNC) {
      warn!(tenant_id, error = %e, "failed to apply synced products, keeping last sync time");
      return SyncOutcome::default();
    }

    if let Err(e) = advance_last_sync_time(&*self.kv, Utc::now().timestamp_millis()) {
      warn!(error = %e, "failed to persist last sync time");
    }

    // Large batches are the moment the store is most likely over budget
    if count >= self.config.optimize_batch_threshold {
      self.store.optimize(self.config.max_cached_products);
    }

    info!(tenant_id, synced = count, "product sync complete");
    SyncOutcome {
      success: true,
      synced: count,
      failed: 0,
      skipped: false,
    }
  }

  /// Timestamp to fetch changes from, or `None` when a full fetch is due.
  fn delta_cursor(&self) -> Option<DateTime<Utc>> {
    let last_millis = read_last_sync_time(&*self.kv)?;
    let last = DateTime::<Utc>::from_timestamp_millis(last_millis)?;

    let window = Duration::seconds(self.config.sync_window_secs as i64);
    if Utc::now() - last < window {
      Some(last)
    } else {
      None
    }
  }

  pub fn last_sync_time(&self) -> Option<i64> {
    read_last_sync_time(&*self.kv)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kv::{KvStore, MemoryKv, KEY_LAST_SYNC_TIME};
  use crate::remote::RemoteProduct;
  use crate::types::QueuedSale;
  use async_trait::async_trait;
  use color_eyre::{eyre::eyre, Result};
  use std::sync::atomic::AtomicUsize;
  use std::sync::Mutex;

  struct FakeRemote {
    products: Vec<RemoteProduct>,
    offline: bool,
    /// Records the updated_since argument of each fetch
    cursors: Mutex<Vec<Option<DateTime<Utc>>>>,
    fetches: AtomicUsize,
  }

  impl FakeRemote {
    fn with_products(products: Vec<RemoteProduct>) -> Self {
      Self {
        products,
        offline: false,
        cursors: Mutex::new(vec![]),
        fetches: AtomicUsize::new(0),
      }
    }

    fn offline() -> Self {
      let mut remote = Self::with_products(vec![]);
      remote.offline = true;
      remote
    }

    fn last_cursor(&self) -> Option<DateTime<Utc>> {
      self.cursors.lock().unwrap().last().cloned().flatten()
    }
  }

  fn remote_product(id: &str, name: &str) -> RemoteProduct {
    RemoteProduct {
      id: id.to_string(),
      tenant_id: "T1".to_string(),
      name: name.to_string(),
      code: None,
      price: 5.0,
      stock: 10.0,
      updated_at: Utc::now(),
    }
  }

  #[async_trait]
  impl RemoteStore for FakeRemote {
    async fn fetch_products(
      &self,
      _tenant_id: &str,
      updated_since: Option<DateTime<Utc>>,
    ) -> Result<Vec<RemoteProduct>> {
      self.cursors.lock().unwrap().push(updated_since);
      self.fetches.fetch_add(1, Ordering::SeqCst);
      if self.offline {
        return Err(eyre!("network unreachable"));
      }
      Ok(self.products.clone())
    }

    async fn fetch_product(&self, _tenant_id: &str, _id: &str) -> Result<Option<RemoteProduct>> {
      Ok(None)
    }

    async fn search_products(
      &self,
      _tenant_id: &str,
      _query: &str,
      _limit: usize,
    ) -> Result<Vec<RemoteProduct>> {
      Ok(vec![])
    }

    async fn insert_sale(&self, _sale: &QueuedSale) -> Result<()> {
      Ok(())
    }
  }

  fn engine(remote: Arc<FakeRemote>) -> (DeltaSyncEngine, Arc<ProductStore>, Arc<MemoryKv>) {
    let store = Arc::new(ProductStore::open_in_memory().unwrap());
    let kv = Arc::new(MemoryKv::new());
    let engine = DeltaSyncEngine::new(
      store.clone(),
      kv.clone(),
      remote,
      CacheConfig {
        max_cached_products: 1000,
        sync_window_secs: 6 * 60 * 60,
        optimize_batch_threshold: 100,
      },
    );
    (engine, store, kv)
  }

  #[tokio::test]
  async fn test_successful_sync_writes_records_and_advances_time() {
    let remote = Arc::new(FakeRemote::with_products(vec![
      remote_product("p1", "Pizza"),
      remote_product("p2", "Soda"),
    ]));
    let (engine, store, _kv) = engine(remote);

    let before = engine.last_sync_time();
    assert_eq!(before, None);

    let outcome = engine.sync("T1", true).await;
    assert!(outcome.success);
    assert_eq!(outcome.synced, 2);
    assert_eq!(store.count().unwrap(), 2);

    let stored = store.get("T1", "p1").unwrap().unwrap();
    assert_eq!(stored.priority, PRIORITY_DELTA_SYNC);
    assert!(engine.last_sync_time().is_some());
  }

  #[tokio::test]
  async fn test_failed_sync_preserves_last_sync_time() {
    let remote = Arc::new(FakeRemote::offline());
    let (engine, store, kv) = engine(remote);
    kv.set(KEY_LAST_SYNC_TIME, "1724900000000").unwrap();

    let outcome = engine.sync("T1", false).await;
    assert!(!outcome.success);
    assert!(!outcome.skipped);
    assert_eq!(engine.last_sync_time(), Some(1724900000000));
    assert_eq!(store.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_last_sync_time_strictly_increases_on_success() {
    let remote = Arc::new(FakeRemote::with_products(vec![remote_product("p1", "A")]));
    let (engine, _store, _kv) = engine(remote);

    engine.sync("T1", true).await;
    let first = engine.last_sync_time().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    engine.sync("T1", true).await;
    let second = engine.last_sync_time().unwrap();

    assert!(second > first);
  }

  #[tokio::test]
  async fn test_delta_fetch_inside_window() {
    let remote = Arc::new(FakeRemote::with_products(vec![]));
    let (engine, _store, kv) = engine(remote.clone());

    // Last sync one minute ago, well inside the six-hour window
    let recent = (Utc::now() - Duration::minutes(1)).timestamp_millis();
    kv.set(KEY_LAST_SYNC_TIME, &recent.to_string()).unwrap();

    engine.sync("T1", false).await;
    let cursor = remote.last_cursor().unwrap();
    assert_eq!(cursor.timestamp_millis(), recent);
  }

  #[tokio::test]
  async fn test_full_fetch_outside_window_or_forced() {
    let remote = Arc::new(FakeRemote::with_products(vec![]));
    let (engine, _store, kv) = engine(remote.clone());

    // Stale last sync: full fetch
    let stale = (Utc::now() - Duration::hours(7)).timestamp_millis();
    kv.set(KEY_LAST_SYNC_TIME, &stale.to_string()).unwrap();
    engine.sync("T1", false).await;
    assert_eq!(remote.last_cursor(), None);

    // Recent last sync but forced: still a full fetch
    let recent = (Utc::now() - Duration::minutes(1)).timestamp_millis();
    kv.set(KEY_LAST_SYNC_TIME, &recent.to_string()).unwrap();
    engine.sync("T1", true).await;
    assert_eq!(remote.last_cursor(), None);
  }

  #[tokio::test]
  async fn test_later_duplicate_wins_by_arrival_order() {
    let remote = Arc::new(FakeRemote::with_products(vec![
      remote_product("p1", "Old Name"),
      remote_product("p1", "New Name"),
    ]));
    let (engine, store, _kv) = engine(remote);

    engine.sync("T1", true).await;
    assert_eq!(store.count().unwrap(), 1);
    assert_eq!(store.get("T1", "p1").unwrap().unwrap().name, "New Name");
  }

  #[tokio::test]
  async fn test_large_batch_triggers_opportunistic_eviction() {
    let products: Vec<_> = (0..10)
      .map(|i| remote_product(&format!("p{}", i), &format!("Item {}", i)))
      .collect();
    let remote = Arc::new(FakeRemote::with_products(products));

    let store = Arc::new(ProductStore::open_in_memory().unwrap());
    let kv = Arc::new(MemoryKv::new());
    let engine = DeltaSyncEngine::new(
      store.clone(),
      kv,
      remote,
      CacheConfig {
        max_cached_products: 5,
        sync_window_secs: 6 * 60 * 60,
        optimize_batch_threshold: 10,
      },
    );

    let outcome = engine.sync("T1", true).await;
    assert_eq!(outcome.synced, 10);
    // The post-sync optimize pass brought the store back under budget
    assert_eq!(store.count().unwrap(), 5);
  }

  #[tokio::test]
  async fn test_sync_is_single_flight() {
    struct BlockingRemote {
      release: tokio::sync::Notify,
      fetches: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for BlockingRemote {
      async fn fetch_products(
        &self,
        _tenant_id: &str,
        _updated_since: Option<DateTime<Utc>>,
      ) -> Result<Vec<RemoteProduct>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.release.notified().await;
        Ok(vec![])
      }
      async fn fetch_product(&self, _tenant_id: &str, _id: &str) -> Result<Option<RemoteProduct>> {
        Ok(None)
      }
      async fn search_products(
        &self,
        _tenant_id: &str,
        _query: &str,
        _limit: usize,
      ) -> Result<Vec<RemoteProduct>> {
        Ok(vec![])
      }
      async fn insert_sale(&self, _sale: &QueuedSale) -> Result<()> {
        Ok(())
      }
    }

    let remote = Arc::new(BlockingRemote {
      release: tokio::sync::Notify::new(),
      fetches: AtomicUsize::new(0),
    });
    let store = Arc::new(ProductStore::open_in_memory().unwrap());
    let kv = Arc::new(MemoryKv::new());
    let engine = Arc::new(DeltaSyncEngine::new(
      store,
      kv,
      remote.clone(),
      CacheConfig::default(),
    ));

    let first = {
      let engine = engine.clone();
      tokio::spawn(async move { engine.sync("T1", true).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    // Only the first call performs network I/O
    let second = engine.sync("T1", true).await;
    assert!(second.skipped);
    assert_eq!(remote.fetches.load(Ordering::SeqCst), 1);

    remote.release.notify_one();
    let outcome = first.await.unwrap();
    assert!(outcome.success);
  }
}
