//! REST implementation of the remote store against a PostgREST-style API.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use url::Url;

use crate::config::RemoteConfig;
use crate::types::{QueuedSale, SaleItem};

use super::{RemoteProduct, RemoteStore};

/// Remote client backed by reqwest.
#[derive(Clone)]
pub struct RestRemote {
  client: reqwest::Client,
  base_url: Url,
  products_table: String,
  sales_table: String,
}

/// Shape of a sale row as the remote sales table expects it. The remote
/// assigns its own primary key; the local queue id is deliberately absent.
#[derive(Debug, Serialize)]
struct SaleRow<'a> {
  tenant_id: &'a str,
  user_id: &'a str,
  items: &'a [SaleItem],
  total: f64,
  payment_method: &'a str,
  sale_date: String,
}

impl RestRemote {
  pub fn new(config: &RemoteConfig, api_key: String) -> Result<Self> {
    let base_url =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid remote URL {}: {}", config.url, e))?;

    let mut headers = reqwest::header::HeaderMap::new();
    let mut auth = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", api_key))
      .map_err(|e| eyre!("Invalid API key: {}", e))?;
    auth.set_sensitive(true);
    headers.insert(reqwest::header::AUTHORIZATION, auth);

    let client = reqwest::Client::builder()
      .default_headers(headers)
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      products_table: config.products_table.clone(),
      sales_table: config.sales_table.clone(),
    })
  }

  fn table_url(&self, table: &str) -> Result<Url> {
    self
      .base_url
      .join(table)
      .map_err(|e| eyre!("Failed to build URL for table {}: {}", table, e))
  }

  async fn fetch_rows(&self, url: Url) -> Result<Vec<RemoteProduct>> {
    let response = self
      .client
      .get(url)
      .send()
      .await
      .map_err(|e| eyre!("Remote fetch failed: {}", e))?;

    if !response.status().is_success() {
      return Err(eyre!("Remote fetch rejected: HTTP {}", response.status()));
    }

    response
      .json::<Vec<RemoteProduct>>()
      .await
      .map_err(|e| eyre!("Failed to parse remote rows: {}", e))
  }
}

#[async_trait]
impl RemoteStore for RestRemote {
  async fn fetch_products(
    &self,
    tenant_id: &str,
    updated_since: Option<DateTime<Utc>>,
  ) -> Result<Vec<RemoteProduct>> {
    let mut url = self.table_url(&self.products_table)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("tenant_id", &format!("eq.{}", tenant_id));
      if let Some(since) = updated_since {
        query.append_pair(
          "updated_at",
          &format!("gt.{}", since.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
      }
      query.append_pair("order", "updated_at.asc");
    }

    self.fetch_rows(url).await
  }

  async fn fetch_product(&self, tenant_id: &str, id: &str) -> Result<Option<RemoteProduct>> {
    let mut url = self.table_url(&self.products_table)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("tenant_id", &format!("eq.{}", tenant_id));
      query.append_pair("id", &format!("eq.{}", id));
      query.append_pair("limit", "1");
    }

    let mut rows = self.fetch_rows(url).await?;
    Ok(if rows.is_empty() {
      None
    } else {
      Some(rows.remove(0))
    })
  }

  async fn search_products(
    &self,
    tenant_id: &str,
    query_text: &str,
    limit: usize,
  ) -> Result<Vec<RemoteProduct>> {
    let mut url = self.table_url(&self.products_table)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("tenant_id", &format!("eq.{}", tenant_id));
      query.append_pair(
        "or",
        &format!("(name.ilike.*{0}*,code.ilike.*{0}*)", query_text.trim()),
      );
      query.append_pair("limit", &limit.to_string());
    }

    self.fetch_rows(url).await
  }

  async fn insert_sale(&self, sale: &QueuedSale) -> Result<()> {
    let url = self.table_url(&self.sales_table)?;

    let row = SaleRow {
      tenant_id: &sale.tenant_id,
      user_id: &sale.user_id,
      items: &sale.items,
      total: sale.total,
      payment_method: &sale.payment_method,
      sale_date: sale
        .date_override
        .to_rfc3339_opts(SecondsFormat::Millis, true),
    };

    let response = self
      .client
      .post(url)
      .json(&row)
      .send()
      .await
      .map_err(|e| eyre!("Remote sale insert failed: {}", e))?;

    if !response.status().is_success() {
      return Err(eyre!("Remote sale insert rejected: HTTP {}", response.status()));
    }

    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::RemoteConfig;

  fn test_config() -> RemoteConfig {
    RemoteConfig {
      url: "https://store.example.com/rest/v1/".to_string(),
      products_table: "products".to_string(),
      sales_table: "sales".to_string(),
    }
  }

  #[test]
  fn test_table_url_joins_base() {
    let remote = RestRemote::new(&test_config(), "key".to_string()).unwrap();
    let url = remote.table_url("products").unwrap();
    assert_eq!(url.as_str(), "https://store.example.com/rest/v1/products");
  }

  #[test]
  fn test_sale_row_omits_client_id() {
    use crate::types::{QueuedSale, SyncState};
    use chrono::Utc;

    let sale = QueuedSale {
      id: "sale_123_abc".to_string(),
      tenant_id: "T1".to_string(),
      user_id: "u1".to_string(),
      items: vec![],
      total: 9.5,
      payment_method: "cash".to_string(),
      created_at_local: Utc::now(),
      date_override: Utc::now(),
      sync_state: SyncState::Queued,
      attempts: 0,
      last_error: None,
    };

    let row = SaleRow {
      tenant_id: &sale.tenant_id,
      user_id: &sale.user_id,
      items: &sale.items,
      total: sale.total,
      payment_method: &sale.payment_method,
      sale_date: sale.date_override.to_rfc3339(),
    };

    let json = serde_json::to_value(&row).unwrap();
    // Remote assigns its own key; the queue id must not leak into the row
    assert!(json.get("id").is_none());
    assert_eq!(json["tenant_id"], "T1");
  }
}
