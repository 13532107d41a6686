//! Installation, activation and purge of cache generations.

use chrono::Utc;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use super::storage::CacheStore;
use super::types::{CacheEntry, CacheKey, GenerationState};
use crate::error::GenerationError;
use crate::net::{Fetcher, Request};

/// Owns the lifecycle of the generation this build ships.
pub struct GenerationManager {
  store: Arc<dyn CacheStore>,
  fetcher: Arc<dyn Fetcher>,
  tag: String,
  manifest: Vec<Url>,
  vary_headers: Vec<String>,
}

impl GenerationManager {
  pub fn new(
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    tag: impl Into<String>,
    manifest: Vec<Url>,
    vary_headers: Vec<String>,
  ) -> Self {
    Self {
      store,
      fetcher,
      tag: tag.into(),
      manifest,
      vary_headers,
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  /// Precache the whole manifest into this generation.
  ///
  /// Every asset is fetched before anything is written; a single failure
  /// aborts the install and leaves the live generation untouched.
  pub async fn install(&self) -> Result<usize, GenerationError> {
    info!(generation = %self.tag, assets = self.manifest.len(), "installing cache generation");

    let fetches = self.manifest.iter().map(|url| self.precache_one(url));
    let entries = match try_join_all(fetches).await {
      Ok(entries) => entries,
      Err(e) => {
        warn!(generation = %self.tag, error = %e, "install aborted");
        return Err(e);
      }
    };

    self.store.put_generation(&self.tag, &entries)?;
    info!(generation = %self.tag, "cache generation installed");
    Ok(entries.len())
  }

  async fn precache_one(&self, url: &Url) -> Result<CacheEntry, GenerationError> {
    let request = Request::get(url.clone());
    let response = self
      .fetcher
      .fetch(&request)
      .await
      .map_err(|e| GenerationError::Precache {
        url: url.to_string(),
        reason: e.to_string(),
      })?;

    if !response.is_success() {
      return Err(GenerationError::Precache {
        url: url.to_string(),
        reason: format!("status {}", response.status),
      });
    }

    Ok(CacheEntry {
      key: CacheKey::for_request(&request, &self.vary_headers),
      response,
      generation: self.tag.clone(),
      precached: true,
      stored_at: Utc::now(),
    })
  }

  /// Whether this generation is installed but not yet live.
  pub fn is_waiting(&self) -> Result<bool, GenerationError> {
    Ok(
      self
        .store
        .generations()?
        .iter()
        .any(|g| g.tag == self.tag && g.state == GenerationState::Waiting),
    )
  }

  /// Make this generation live and delete every other one.
  /// Returns the tags that were purged.
  pub fn activate(&self) -> Result<Vec<String>, GenerationError> {
    let installed = self.store.generations()?.iter().any(|g| g.tag == self.tag);
    if !installed {
      return Err(GenerationError::NothingToActivate);
    }
    Ok(self.store.activate(&self.tag)?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::storage::SqliteCacheStore;
  use crate::db::Database;
  use crate::error::DeliveryError;
  use crate::net::Response;
  use async_trait::async_trait;

  /// Serves every URL with its path as the body, except paths listed as broken.
  struct StaticSite {
    broken: Vec<&'static str>,
    version: &'static str,
  }

  #[async_trait]
  impl Fetcher for StaticSite {
    async fn fetch(&self, request: &Request) -> Result<Response, DeliveryError> {
      let path = request.url.path();
      if self.broken.contains(&path) {
        return Ok(Response::new(404, Vec::new()));
      }
      Ok(Response::new(200, format!("{}{}", self.version, path).into_bytes()))
    }
  }

  fn manifest() -> Vec<Url> {
    let base = Url::parse("https://collect.example.org").unwrap();
    ["/", "/collect", "/manifest.json"]
      .iter()
      .map(|p| base.join(p).unwrap())
      .collect()
  }

  fn manager(
    store: Arc<dyn CacheStore>,
    tag: &str,
    version: &'static str,
    broken: Vec<&'static str>,
  ) -> GenerationManager {
    GenerationManager::new(
      store,
      Arc::new(StaticSite { broken, version }),
      tag,
      manifest(),
      Vec::new(),
    )
  }

  fn root_key() -> CacheKey {
    CacheKey::for_request(
      &Request::get(Url::parse("https://collect.example.org/").unwrap()),
      &[],
    )
  }

  #[tokio::test]
  async fn test_install_then_activate() {
    let store: Arc<dyn CacheStore> =
      Arc::new(SqliteCacheStore::new(Arc::new(Database::open_in_memory().unwrap())));
    let v1 = manager(store.clone(), "v1", "one", vec![]);

    assert_eq!(v1.install().await.unwrap(), 3);
    assert!(v1.is_waiting().unwrap());
    assert_eq!(store.live_generation().unwrap(), None);

    v1.activate().unwrap();
    assert!(!v1.is_waiting().unwrap());
    let shell = store.get("v1", &root_key()).unwrap().unwrap();
    assert_eq!(shell.response.body, b"one/");
  }

  #[tokio::test]
  async fn test_failed_precache_keeps_previous_generation() {
    let store: Arc<dyn CacheStore> =
      Arc::new(SqliteCacheStore::new(Arc::new(Database::open_in_memory().unwrap())));
    let v1 = manager(store.clone(), "v1", "one", vec![]);
    v1.install().await.unwrap();
    v1.activate().unwrap();

    let v2 = manager(store.clone(), "v2", "two", vec!["/manifest.json"]);
    let err = v2.install().await.unwrap_err();
    assert!(matches!(err, GenerationError::Precache { .. }));
    assert!(matches!(v2.activate(), Err(GenerationError::NothingToActivate)));

    assert_eq!(store.live_generation().unwrap().as_deref(), Some("v1"));
    assert!(store.get("v2", &root_key()).unwrap().is_none());
    let shell = store.get("v1", &root_key()).unwrap().unwrap();
    assert_eq!(shell.response.body, b"one/");
  }

  #[tokio::test]
  async fn test_activation_purges_previous_generation() {
    let store: Arc<dyn CacheStore> =
      Arc::new(SqliteCacheStore::new(Arc::new(Database::open_in_memory().unwrap())));
    let v1 = manager(store.clone(), "v1", "one", vec![]);
    v1.install().await.unwrap();
    v1.activate().unwrap();

    let v2 = manager(store.clone(), "v2", "two", vec![]);
    v2.install().await.unwrap();
    assert_eq!(v2.activate().unwrap(), vec!["v1".to_string()]);

    assert!(store.get("v1", &root_key()).unwrap().is_none());
    assert_eq!(
      store.get("v2", &root_key()).unwrap().unwrap().response.body,
      b"two/"
    );
  }
}
