//! Core types for the response cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::{Request, Response};

/// Identity of a cached request: method, normalized URL and vary header values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheKey {
  /// SHA256 of the identity, used as the storage key
  pub hash: String,
  pub method: String,
  pub url: String,
}

impl CacheKey {
  /// Build the key for `request`, folding in the values of `vary_headers`.
  pub fn for_request(request: &Request, vary_headers: &[String]) -> Self {
    let method = request.method.as_str().to_uppercase();
    let url = normalize_url(&request.url);

    let mut input = format!("{}:{}", method, url);
    for name in vary_headers {
      let value = request.header(name).unwrap_or("");
      input.push_str(&format!("|{}={}", name.to_lowercase(), value));
    }

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Self { hash, method, url }
  }
}

/// Fragments never reach the server, so they never split cache entries.
fn normalize_url(url: &Url) -> String {
  let mut url = url.clone();
  url.set_fragment(None);
  url.to_string()
}

/// A stored response. Immutable once written; replaced only by a new write
/// under the same key and generation.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub response: Response,
  pub generation: String,
  /// Written by install rather than at runtime
  pub precached: bool,
  pub stored_at: DateTime<Utc>,
}

/// Lifecycle of a cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
  /// Fully precached, waiting to be activated
  Waiting,
  /// The one generation requests are served from
  Live,
}

impl GenerationState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Waiting => "waiting",
      Self::Live => "live",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "waiting" => Some(Self::Waiting),
      "live" => Some(Self::Live),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
  pub tag: String,
  pub state: GenerationState,
  pub created_at: DateTime<Utc>,
  pub entries: usize,
}
