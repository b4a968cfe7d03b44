//! Tenant identity resolution.
//!
//! Correct tenant scoping is required before any read or write, so the
//! resolver tries a cascade of tiers, fastest first: in-memory value,
//! per-run session cache, persisted local cache (if younger than 24h),
//! then the authenticated session. Each tier that succeeds backfills the
//! earlier tiers so subsequent calls are O(1). A hit from the auth session
//! overwrites every cached tier; identity must track the authoritative
//! session once it is available.
//!
//! When every tier fails, callers that cannot afford to lose a write (the
//! sale queue) fall back to an emergency-generated id, flagged so data
//! written under it is treated as provisional.

use chrono::{Duration, Utc};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::kv::{KvStore, KEY_TENANT_IDENTITY};
use crate::remote::SessionProvider;
use crate::types::{ResolvedFrom, TenantIdentity};

/// Marker prefix for last-resort synthesized tenant ids.
pub const EMERGENCY_TENANT_PREFIX: &str = "emergency_tenant_";

/// Maximum age of the persisted local-cache tier.
const LOCAL_CACHE_MAX_AGE_HOURS: i64 = 24;

pub struct IdentityResolver {
  memory: Mutex<Option<TenantIdentity>>,
  session_cache: Arc<dyn KvStore>,
  local_cache: Arc<dyn KvStore>,
  session_provider: Arc<dyn SessionProvider>,
}

impl IdentityResolver {
  pub fn new(
    session_cache: Arc<dyn KvStore>,
    local_cache: Arc<dyn KvStore>,
    session_provider: Arc<dyn SessionProvider>,
  ) -> Self {
    Self {
      memory: Mutex::new(None),
      session_cache,
      local_cache,
      session_provider,
    }
  }

  /// One pass through the cascade, first hit wins. Returns `None` when no
  /// tier can produce an identity; callers that must not lose data use
  /// [`resolve_or_emergency`](Self::resolve_or_emergency) instead.
  pub async fn resolve(&self) -> Option<TenantIdentity> {
    // Tier 1: in-memory. A provisional (emergency) value never satisfies
    // the strict path; keep walking the cascade to look for a real one.
    if let Some(identity) = self.memory_tier() {
      if !identity.is_provisional() {
        return Some(identity);
      }
    }

    // Tier 2: per-run session cache
    if let Some(identity) = self.kv_tier(&*self.session_cache, ResolvedFrom::SessionCache, None) {
      if !identity.is_provisional() {
        self.backfill_memory(&identity);
        return Some(identity);
      }
    }

    // Tier 3: persisted local cache, only trusted while young
    if let Some(identity) = self.kv_tier(
      &*self.local_cache,
      ResolvedFrom::LocalCache,
      Some(Duration::hours(LOCAL_CACHE_MAX_AGE_HOURS)),
    ) {
      if !identity.is_provisional() {
        self.backfill_memory(&identity);
        self.backfill_kv(&*self.session_cache, &identity);
        return Some(identity);
      }
    }

    // Tier 4: authenticated session, authoritative
    self.refresh_from_auth().await
  }

  /// Resolve, synthesizing an emergency id when the whole cascade fails.
  /// The emergency value is kept in memory only, so one terminal session
  /// queues its provisional writes under a consistent id.
  pub async fn resolve_or_emergency(&self) -> TenantIdentity {
    if let Some(identity) = self.resolve().await {
      return identity;
    }

    // Reuse an earlier emergency id from this run if one exists
    if let Some(existing) = self.memory_tier() {
      if existing.is_provisional() {
        return existing;
      }
    }

    let identity = TenantIdentity {
      tenant_id: format!("{}{}", EMERGENCY_TENANT_PREFIX, Utc::now().timestamp_millis()),
      resolved_from: ResolvedFrom::EmergencyGenerated,
      resolved_at: Utc::now(),
    };
    warn!(
      tenant_id = %identity.tenant_id,
      "no tenant identity obtainable, generated emergency id; data written under it is provisional"
    );
    self.backfill_memory(&identity);
    identity
  }

  /// Query the authenticated session directly. A success overwrites every
  /// cached tier, including a previously satisfied one.
  pub async fn refresh_from_auth(&self) -> Option<TenantIdentity> {
    let session = self.session_provider.session().await?;
    let tenant_id = session.tenant_id?;

    let identity = TenantIdentity {
      tenant_id,
      resolved_from: ResolvedFrom::AuthSession,
      resolved_at: Utc::now(),
    };

    info!(tenant_id = %identity.tenant_id, "tenant identity resolved from auth session");
    self.backfill_memory(&identity);
    self.backfill_kv(&*self.session_cache, &identity);
    self.backfill_kv(&*self.local_cache, &identity);
    Some(identity)
  }

  /// Reject any operation whose explicit tenant id does not match the
  /// resolved identity. A mismatch is a security violation: logged
  /// distinctly and blocked, never merely warned about.
  pub async fn validate_tenant(&self, explicit_tenant: &str) -> bool {
    match self.resolve().await {
      Some(identity) => {
        if identity.tenant_id == explicit_tenant {
          true
        } else {
          error!(
            target: "security",
            expected = %identity.tenant_id,
            got = %explicit_tenant,
            "cross-tenant operation blocked"
          );
          false
        }
      }
      None => {
        warn!("tenant validation refused: no identity resolvable");
        false
      }
    }
  }

  fn memory_tier(&self) -> Option<TenantIdentity> {
    self.memory.lock().ok().and_then(|m| m.clone())
  }

  /// Read a tier backed by a KV store. `max_age` guards the persisted
  /// local cache; the serving tier is stamped into `resolved_from` unless
  /// the stored value is an emergency id, whose flag must stick.
  fn kv_tier(
    &self,
    kv: &dyn KvStore,
    tier: ResolvedFrom,
    max_age: Option<Duration>,
  ) -> Option<TenantIdentity> {
    let raw = kv.get(KEY_TENANT_IDENTITY).ok().flatten()?;
    let mut identity: TenantIdentity = match serde_json::from_str(&raw) {
      Ok(i) => i,
      Err(e) => {
        debug!(error = %e, "discarding unparseable cached tenant identity");
        return None;
      }
    };

    if let Some(max_age) = max_age {
      if Utc::now() - identity.resolved_at > max_age {
        debug!("cached tenant identity expired, ignoring tier");
        return None;
      }
    }

    if !identity.is_provisional() {
      identity.resolved_from = tier;
    }
    Some(identity)
  }

  fn backfill_memory(&self, identity: &TenantIdentity) {
    if let Ok(mut memory) = self.memory.lock() {
      *memory = Some(identity.clone());
    }
  }

  fn backfill_kv(&self, kv: &dyn KvStore, identity: &TenantIdentity) {
    match serde_json::to_string(identity) {
      Ok(json) => {
        if let Err(e) = kv.set(KEY_TENANT_IDENTITY, &json) {
          warn!(error = %e, "failed to backfill tenant identity tier");
        }
      }
      Err(e) => warn!(error = %e, "failed to serialize tenant identity"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::kv::MemoryKv;
  use crate::remote::AuthSession;
  use async_trait::async_trait;

  struct FakeSession {
    session: Option<AuthSession>,
  }

  #[async_trait]
  impl SessionProvider for FakeSession {
    async fn session(&self) -> Option<AuthSession> {
      self.session.clone()
    }
  }

  fn resolver(session: Option<AuthSession>) -> IdentityResolver {
    IdentityResolver::new(
      Arc::new(MemoryKv::new()),
      Arc::new(MemoryKv::new()),
      Arc::new(FakeSession { session }),
    )
  }

  fn seeded_identity(tenant: &str, from: ResolvedFrom, age_hours: i64) -> String {
    serde_json::to_string(&TenantIdentity {
      tenant_id: tenant.to_string(),
      resolved_from: from,
      resolved_at: Utc::now() - Duration::hours(age_hours),
    })
    .unwrap()
  }

  #[tokio::test]
  async fn test_resolves_from_auth_session_when_caches_empty() {
    let r = resolver(Some(AuthSession {
      user_id: "u1".to_string(),
      tenant_id: Some("T1".to_string()),
    }));

    let identity = r.resolve().await.unwrap();
    assert_eq!(identity.tenant_id, "T1");
    assert_eq!(identity.resolved_from, ResolvedFrom::AuthSession);
  }

  #[tokio::test]
  async fn test_auth_hit_backfills_all_tiers() {
    let r = resolver(Some(AuthSession {
      user_id: "u1".to_string(),
      tenant_id: Some("T1".to_string()),
    }));

    r.resolve().await.unwrap();

    // Second pass is served from memory without touching auth
    let identity = r.resolve().await.unwrap();
    assert_eq!(identity.resolved_from, ResolvedFrom::AuthSession);
    assert!(r.session_cache.get(KEY_TENANT_IDENTITY).unwrap().is_some());
    assert!(r.local_cache.get(KEY_TENANT_IDENTITY).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_session_cache_tier_hit() {
    let r = resolver(None);
    r.session_cache
      .set(
        KEY_TENANT_IDENTITY,
        &seeded_identity("T2", ResolvedFrom::AuthSession, 0),
      )
      .unwrap();

    let identity = r.resolve().await.unwrap();
    assert_eq!(identity.tenant_id, "T2");
    assert_eq!(identity.resolved_from, ResolvedFrom::SessionCache);
  }

  #[tokio::test]
  async fn test_local_cache_tier_expires_after_24h() {
    let r = resolver(None);
    r.local_cache
      .set(
        KEY_TENANT_IDENTITY,
        &seeded_identity("T3", ResolvedFrom::AuthSession, 25),
      )
      .unwrap();

    assert!(r.resolve().await.is_none());

    // A young value is accepted and backfills the faster tiers
    r.local_cache
      .set(
        KEY_TENANT_IDENTITY,
        &seeded_identity("T3", ResolvedFrom::AuthSession, 1),
      )
      .unwrap();
    let identity = r.resolve().await.unwrap();
    assert_eq!(identity.tenant_id, "T3");
    assert_eq!(identity.resolved_from, ResolvedFrom::LocalCache);
    assert!(r.session_cache.get(KEY_TENANT_IDENTITY).unwrap().is_some());
  }

  #[tokio::test]
  async fn test_auth_overwrites_previously_cached_value() {
    let r = resolver(Some(AuthSession {
      user_id: "u1".to_string(),
      tenant_id: Some("T_real".to_string()),
    }));
    r.session_cache
      .set(
        KEY_TENANT_IDENTITY,
        &seeded_identity("T_stale", ResolvedFrom::AuthSession, 0),
      )
      .unwrap();

    // Cascade is satisfied by the stale session cache first
    let identity = r.resolve().await.unwrap();
    assert_eq!(identity.tenant_id, "T_stale");

    // Forcing the authoritative path overwrites every tier
    let identity = r.refresh_from_auth().await.unwrap();
    assert_eq!(identity.tenant_id, "T_real");
    let identity = r.resolve().await.unwrap();
    assert_eq!(identity.tenant_id, "T_real");
  }

  #[tokio::test]
  async fn test_emergency_id_is_flagged_and_stable_within_run() {
    let r = resolver(None);

    assert!(r.resolve().await.is_none());

    let first = r.resolve_or_emergency().await;
    assert!(first.tenant_id.starts_with(EMERGENCY_TENANT_PREFIX));
    assert!(first.is_provisional());

    // Same provisional id is reused for the rest of the run
    let second = r.resolve_or_emergency().await;
    assert_eq!(first.tenant_id, second.tenant_id);

    // The strict path still refuses to serve it
    assert!(r.resolve().await.is_none());
  }

  #[tokio::test]
  async fn test_validate_tenant_blocks_mismatch() {
    let r = resolver(Some(AuthSession {
      user_id: "u1".to_string(),
      tenant_id: Some("T1".to_string()),
    }));

    assert!(r.validate_tenant("T1").await);
    assert!(!r.validate_tenant("T_other").await);
  }

  #[tokio::test]
  async fn test_validate_tenant_refuses_without_identity() {
    let r = resolver(None);
    assert!(!r.validate_tenant("T1").await);
  }
}
