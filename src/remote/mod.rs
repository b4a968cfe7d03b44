//! Consumed collaborator interfaces.
//!
//! The hosted data store and the authenticated session provider are opaque
//! request/response collaborators, reachable only when online. Traits keep
//! them swappable; tests run against in-memory fakes.

pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::types::{CachedProduct, QueuedSale};

/// A product row as the remote store returns it. Priority is a purely
/// local concept assigned at write-back time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteProduct {
  pub id: String,
  pub tenant_id: String,
  pub name: String,
  #[serde(default)]
  pub code: Option<String>,
  pub price: f64,
  #[serde(default)]
  pub stock: f64,
  pub updated_at: DateTime<Utc>,
}

impl RemoteProduct {
  pub fn into_cached(self, priority: u8) -> CachedProduct {
    CachedProduct {
      id: self.id,
      tenant_id: self.tenant_id,
      name: self.name,
      code: self.code,
      price: self.price,
      stock: self.stock,
      updated_at: self.updated_at,
      priority,
    }
  }
}

/// Remote hosted data store. All reads are tenant-filtered; the product
/// fetch supports an updated-since filter for delta sync.
#[async_trait]
pub trait RemoteStore: Send + Sync {
  /// Fetch products for a tenant, optionally only those changed since the
  /// given timestamp.
  async fn fetch_products(
    &self,
    tenant_id: &str,
    updated_since: Option<DateTime<Utc>>,
  ) -> Result<Vec<RemoteProduct>>;

  /// Fetch a single product by id.
  async fn fetch_product(&self, tenant_id: &str, id: &str) -> Result<Option<RemoteProduct>>;

  /// Search products by name/code substring.
  async fn search_products(
    &self,
    tenant_id: &str,
    query: &str,
    limit: usize,
  ) -> Result<Vec<RemoteProduct>>;

  /// Insert a sale row. The remote assigns its own primary key; the
  /// client-generated queue id is not sent as one.
  async fn insert_sale(&self, sale: &QueuedSale) -> Result<()>;
}

/// An authenticated session, when one exists.
#[derive(Debug, Clone)]
pub struct AuthSession {
  pub user_id: String,
  /// Tenant id from the session metadata, when the account carries one
  pub tenant_id: Option<String>,
}

/// Authenticated session provider (auth SDK in the host app).
#[async_trait]
pub trait SessionProvider: Send + Sync {
  async fn session(&self) -> Option<AuthSession>;
}
