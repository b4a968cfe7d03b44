//! The facade the rest of the application consumes.
//!
//! Wires the local product store, delta sync engine, offline sale queue,
//! identity resolver and background controller into one object constructed
//! once at startup and passed by reference. Reads are served cache-first;
//! a miss falls through to the remote store only while online, and the
//! result is written back with a priority reflecting how it was obtained.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::identity::IdentityResolver;
use crate::kv::{KvStore, MemoryKv, SqliteKv};
use crate::queue::tiered::{FallbackSaleStore, SqliteSaleStore, TieredSaleStore};
use crate::queue::{EnqueueReceipt, SaleQueue};
use crate::remote::{RemoteStore, SessionProvider};
use crate::store::ProductStore;
use crate::sync::scheduler::SyncController;
use crate::sync::DeltaSyncEngine;
use crate::types::{CacheMetrics, CachedProduct, SaleDraft, SyncOutcome};
use crate::types::{PRIORITY_DIRECT_LOOKUP, PRIORITY_SEARCH_RESULT};

const DEFAULT_SEARCH_LIMIT: usize = 50;

pub struct PosEngine {
  store: Arc<ProductStore>,
  kv: Arc<dyn KvStore>,
  queue: Arc<SaleQueue>,
  identity: Arc<IdentityResolver>,
  remote: Arc<dyn RemoteStore>,
  sync: Arc<DeltaSyncEngine>,
  controller: Arc<SyncController>,
  session: Arc<dyn SessionProvider>,
}

impl PosEngine {
  /// Open the engine with durable storage at the default data directory.
  pub fn open(
    config: Config,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn SessionProvider>,
  ) -> Result<Arc<Self>> {
    let data_dir = Self::default_data_dir()?;
    let store = Arc::new(ProductStore::open(&data_dir.join("cache.db"))?);
    let kv: Arc<dyn KvStore> = Arc::new(SqliteKv::open(&data_dir.join("meta.db"))?);
    let primary = SqliteSaleStore::open(&data_dir.join("queue.db"))?;

    Self::assemble(config, remote, session, store, kv, Box::new(primary))
  }

  /// Fully in-memory engine (tests).
  pub fn open_in_memory(
    config: Config,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn SessionProvider>,
  ) -> Result<Arc<Self>> {
    let store = Arc::new(ProductStore::open_in_memory()?);
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let primary = SqliteSaleStore::open_in_memory()?;

    Self::assemble(config, remote, session, store, kv, Box::new(primary))
  }

  fn assemble(
    config: Config,
    remote: Arc<dyn RemoteStore>,
    session: Arc<dyn SessionProvider>,
    store: Arc<ProductStore>,
    kv: Arc<dyn KvStore>,
    primary: Box<dyn crate::queue::tiered::SaleStore>,
  ) -> Result<Arc<Self>> {
    let queue = Arc::new(SaleQueue::new(
      TieredSaleStore::new(primary, Box::new(FallbackSaleStore::new(kv.clone()))),
      config.queue.clone(),
    ));

    // Session-cache tier is per-run by design; only the local tier persists
    let identity = Arc::new(IdentityResolver::new(
      Arc::new(MemoryKv::new()),
      kv.clone(),
      session.clone(),
    ));

    let sync = Arc::new(DeltaSyncEngine::new(
      store.clone(),
      kv.clone(),
      remote.clone(),
      config.cache.clone(),
    ));

    let controller = SyncController::new(
      sync.clone(),
      queue.clone(),
      store.clone(),
      remote.clone(),
      identity.clone(),
      kv.clone(),
      config.scheduler.clone(),
    );

    Ok(Arc::new(Self {
      store,
      kv,
      queue,
      identity,
      remote,
      sync,
      controller,
      session,
    }))
  }

  fn default_data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;
    Ok(data_dir.join("tillsync"))
  }

  /// Background scheduler handle, to spawn the periodic loop.
  pub fn controller(&self) -> &Arc<SyncController> {
    &self.controller
  }

  /// The host app reports connectivity changes here.
  pub fn set_online(&self, online: bool) {
    self.controller.set_online(online);
  }

  /// Search cached products; on a miss while online, fall through to the
  /// remote store and cache the results as search hits.
  ///
  /// Refuses (empty result) when no tenant identity is resolvable.
  pub async fn search_products(&self, query: &str) -> Result<Vec<CachedProduct>> {
    let Some(tenant) = self.identity.resolve().await else {
      debug!("search refused: no tenant identity");
      return Ok(vec![]);
    };

    let local = self
      .store
      .search(&tenant.tenant_id, query, DEFAULT_SEARCH_LIMIT)?;
    if !local.is_empty() || !self.controller.is_online() {
      return Ok(local);
    }

    match self
      .remote
      .search_products(&tenant.tenant_id, query, DEFAULT_SEARCH_LIMIT)
      .await
    {
      Ok(rows) => {
        let records: Vec<CachedProduct> = rows
          .into_iter()
          .map(|r| r.into_cached(PRIORITY_SEARCH_RESULT))
          .collect();
        // The fetched rows are already in hand; failing to cache them
        // degrades future reads, never this one
        if let Err(e) = self.store.put(&records, PRIORITY_SEARCH_RESULT) {
          warn!(error = %e, "failed to cache remote search results");
        }
        Ok(records)
      }
      Err(e) => {
        // Offline-equivalent: serve what the cache had (nothing)
        debug!(error = %e, "remote search failed, serving cache only");
        Ok(local)
      }
    }
  }

  /// Get a product by id, cache-first with remote fallback while online.
  pub async fn get_product(&self, id: &str) -> Result<Option<CachedProduct>> {
    let Some(tenant) = self.identity.resolve().await else {
      debug!("lookup refused: no tenant identity");
      return Ok(None);
    };

    if let Some(product) = self.store.get(&tenant.tenant_id, id)? {
      return Ok(Some(product));
    }

    if !self.controller.is_online() {
      return Ok(None);
    }

    match self.remote.fetch_product(&tenant.tenant_id, id).await {
      Ok(Some(row)) => {
        let record = row.into_cached(PRIORITY_DIRECT_LOOKUP);
        if let Err(e) = self.store.put(std::slice::from_ref(&record), PRIORITY_DIRECT_LOOKUP) {
          warn!(error = %e, "failed to cache fetched product");
        }
        Ok(Some(record))
      }
      Ok(None) => Ok(None),
      Err(e) => {
        debug!(error = %e, "remote lookup failed, treating as miss");
        Ok(None)
      }
    }
  }

  /// Reconcile the product cache against the remote store.
  pub async fn sync_products(&self, force: bool) -> SyncOutcome {
    let Some(tenant) = self.identity.resolve().await else {
      debug!("sync refused: no tenant identity");
      return SyncOutcome::default();
    };
    self.sync.sync(&tenant.tenant_id, force).await
  }

  /// Record a sale. Always succeeds locally, even offline or without a
  /// resolvable tenant (an emergency id flags the sale provisional), and
  /// schedules a debounced push.
  pub async fn enqueue_sale(&self, draft: SaleDraft) -> EnqueueReceipt {
    let tenant = self.identity.resolve_or_emergency().await;
    let user_id = match self.session.session().await {
      Some(session) => session.user_id,
      None => "offline_user".to_string(),
    };

    let receipt = self.queue.enqueue(&tenant, &user_id, draft, None);
    self.controller.note_local_mutation();
    receipt
  }

  /// Drain the sale queue now, bypassing debounce and hash checks.
  pub async fn drain_sales(&self) -> SyncOutcome {
    self.controller.push(true).await
  }

  pub async fn resolved_tenant_id(&self) -> Option<String> {
    self.identity.resolve().await.map(|i| i.tenant_id)
  }

  /// Reject operations carrying a tenant id that does not match the
  /// resolved identity.
  pub async fn validate_tenant(&self, explicit_tenant: &str) -> bool {
    self.identity.validate_tenant(explicit_tenant).await
  }

  pub fn cache_metrics(&self) -> Result<CacheMetrics> {
    let total = self.store.count()?;
    Ok(self.store.metrics().snapshot(total, &*self.kv))
  }

  /// Entries still awaiting drain.
  pub fn pending_sales(&self) -> Vec<crate::types::QueuedSale> {
    self.queue.pending()
  }

  /// Drop all cached products. The sale queue is untouched.
  pub fn clear_cache(&self) -> Result<()> {
    self.store.clear()
  }
}
