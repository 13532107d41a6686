//! Classifies intercepted requests and applies the caching strategy for each kind.

use chrono::Utc;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use url::{Origin, Url};

use crate::cache::{CacheEntry, CacheKey, CacheStore};
use crate::net::{Fetcher, Request, RequestMode, Response};

/// Request categories, each with its own caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  /// Non-GET or under the API prefix: never cached
  Api,
  /// Full page load: network first, app shell fallback
  Navigation,
  /// Everything else: stale-while-revalidate
  Asset,
}

/// Where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Cached app shell served in place of a failed navigation
  ShellFallback,
  /// Built locally because the network was unreachable
  Offline,
}

#[derive(Debug)]
pub struct Routed {
  pub response: Response,
  pub source: ResponseSource,
  /// Background refresh to run after the cached response has been returned
  pub revalidate: Option<Request>,
}

impl Routed {
  fn new(response: Response, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      revalidate: None,
    }
  }
}

pub struct Router {
  store: Arc<dyn CacheStore>,
  fetcher: Arc<dyn Fetcher>,
  origin: Origin,
  api_prefix: String,
  /// Navigation fallbacks in order: offline page, then root
  shell_fallbacks: Vec<Url>,
  vary_headers: Vec<String>,
}

impl Router {
  pub fn new(
    store: Arc<dyn CacheStore>,
    fetcher: Arc<dyn Fetcher>,
    base_url: &Url,
    api_prefix: impl Into<String>,
    shell_fallbacks: Vec<Url>,
    vary_headers: Vec<String>,
  ) -> Self {
    Self {
      store,
      fetcher,
      origin: base_url.origin(),
      api_prefix: api_prefix.into(),
      shell_fallbacks,
      vary_headers,
    }
  }

  pub fn classify(&self, request: &Request) -> RequestKind {
    if request.method != Method::GET || request.url.path().starts_with(&self.api_prefix) {
      RequestKind::Api
    } else if request.mode == RequestMode::Navigate {
      RequestKind::Navigation
    } else {
      RequestKind::Asset
    }
  }

  pub async fn handle(&self, request: &Request) -> Routed {
    let kind = self.classify(request);
    debug!(url = %request.url, method = %request.method, ?kind, "routing request");

    match kind {
      RequestKind::Api => self.handle_api(request).await,
      RequestKind::Navigation => self.handle_navigation(request).await,
      RequestKind::Asset => self.handle_asset(request).await,
    }
  }

  async fn handle_api(&self, request: &Request) -> Routed {
    match self.fetcher.fetch(request).await {
      Ok(response) => Routed::new(response, ResponseSource::Network),
      Err(e) => {
        debug!(url = %request.url, error = %e, "api request failed, answering offline");
        Routed::new(offline_api_response(), ResponseSource::Offline)
      }
    }
  }

  async fn handle_navigation(&self, request: &Request) -> Routed {
    match self.fetcher.fetch(request).await {
      Ok(response) => Routed::new(response, ResponseSource::Network),
      Err(e) => {
        debug!(url = %request.url, error = %e, "navigation failed, serving app shell");
        for fallback in &self.shell_fallbacks {
          if let Some(cached) = self.lookup(&Request::get(fallback.clone())) {
            return Routed::new(cached, ResponseSource::ShellFallback);
          }
        }
        Routed::new(
          Response::new(503, b"You are offline".to_vec()),
          ResponseSource::Offline,
        )
      }
    }
  }

  async fn handle_asset(&self, request: &Request) -> Routed {
    if let Some(cached) = self.lookup(request) {
      return Routed {
        response: cached,
        source: ResponseSource::Cache,
        revalidate: Some(request.clone()),
      };
    }

    match self.fetcher.fetch(request).await {
      Ok(response) => {
        self.store_if_cacheable(request, &response);
        Routed::new(response, ResponseSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "asset fetch failed with no cached copy");
        Routed::new(Response::new(503, Vec::new()), ResponseSource::Offline)
      }
    }
  }

  /// Refetch an asset and overwrite its cached copy on success.
  /// Failures are silent: the cached copy stays.
  pub async fn revalidate(&self, request: &Request) {
    match self.fetcher.fetch(request).await {
      Ok(response) => self.store_if_cacheable(request, &response),
      Err(e) => debug!(url = %request.url, error = %e, "revalidation failed"),
    }
  }

  /// Cache read from the live generation. Errors degrade to a miss.
  fn lookup(&self, request: &Request) -> Option<Response> {
    let key = CacheKey::for_request(request, &self.vary_headers);
    let result = self.store.live_generation().and_then(|live| match live {
      Some(generation) => self.store.get(&generation, &key),
      None => Ok(None),
    });

    match result {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!(url = %request.url, error = %e, "cache read failed");
        None
      }
    }
  }

  /// Only same-origin 2xx responses are written, so a foreign or error
  /// response can never poison the cache.
  fn store_if_cacheable(&self, request: &Request, response: &Response) {
    if !response.is_success() || request.url.origin() != self.origin {
      return;
    }

    let generation = match self.store.live_generation() {
      Ok(Some(generation)) => generation,
      Ok(None) => return,
      Err(e) => {
        warn!(error = %e, "cache unavailable");
        return;
      }
    };

    let entry = CacheEntry {
      key: CacheKey::for_request(request, &self.vary_headers),
      response: response.clone(),
      generation,
      precached: false,
      stored_at: Utc::now(),
    };
    if let Err(e) = self.store.put(&entry) {
      warn!(url = %request.url, error = %e, "cache write failed");
    }
  }
}

/// Structured body telling callers the failure is connectivity, not the app.
pub fn offline_api_response() -> Response {
  Response::json(
    503,
    &json!({ "error": "offline", "message": "You are offline" }),
  )
}
