//! Error taxonomy for delivery attempts and durable storage.

use rusqlite::ErrorCode;

/// Why a network attempt did not produce an acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
  #[error("network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("server rejected the request ({status}): {message}")]
  ServerRejected { status: u16, message: String },

  #[error("server error ({status}): {message}")]
  ServerError { status: u16, message: String },

  #[error("request timed out")]
  Timeout,

  #[error("malformed response: {0}")]
  MalformedResponse(String),
}

impl DeliveryError {
  /// Classify a non-success HTTP status.
  ///
  /// 408 and 429 are transient even though they sit in the 4xx range.
  pub fn from_status(status: u16, message: impl Into<String>) -> Self {
    let message = message.into();
    match status {
      408 | 429 => Self::ServerError { status, message },
      400..=499 => Self::ServerRejected { status, message },
      _ => Self::ServerError { status, message },
    }
  }

  /// Whether the record may be attempted again under backoff.
  pub fn is_retryable(&self) -> bool {
    !matches!(self, Self::ServerRejected { .. })
  }

  /// Whether the server could not be reached at all.
  pub fn is_unreachable(&self) -> bool {
    matches!(self, Self::NetworkUnavailable(_))
  }
}

impl From<reqwest::Error> for DeliveryError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      Self::Timeout
    } else if e.is_decode() {
      Self::MalformedResponse(e.to_string())
    } else if let Some(status) = e.status() {
      Self::from_status(status.as_u16(), e.to_string())
    } else {
      Self::NetworkUnavailable(e.to_string())
    }
  }
}

/// Failures of the local durable store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("local storage quota exceeded")]
  QuotaExceeded,

  #[error("submission {0} not found")]
  NotFound(String),

  #[error("submission {0} was already synced")]
  AlreadySynced(String),

  #[error("lock poisoned")]
  LockPoisoned,

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("sqlite error: {0}")]
  Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    match e.sqlite_error_code() {
      Some(ErrorCode::DiskFull) => Self::QuotaExceeded,
      _ => Self::Sqlite(e),
    }
  }
}

impl<T> From<std::sync::PoisonError<T>> for StoreError {
  fn from(_: std::sync::PoisonError<T>) -> Self {
    Self::LockPoisoned
  }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Failures while installing or activating a cache generation.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
  #[error("failed to precache {url}: {reason}")]
  Precache { url: String, reason: String },

  #[error("no installed generation to activate")]
  NothingToActivate,

  #[error(transparent)]
  Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_status_classification() {
    assert!(!DeliveryError::from_status(422, "invalid").is_retryable());
    assert!(!DeliveryError::from_status(404, "missing form").is_retryable());
    assert!(DeliveryError::from_status(500, "boom").is_retryable());
    assert!(DeliveryError::from_status(503, "down").is_retryable());
    assert!(DeliveryError::from_status(429, "slow down").is_retryable());
    assert!(DeliveryError::from_status(408, "timeout").is_retryable());
  }

  #[test]
  fn test_malformed_and_timeout_are_retryable() {
    assert!(DeliveryError::MalformedResponse("bad json".into()).is_retryable());
    assert!(DeliveryError::Timeout.is_retryable());
    assert!(DeliveryError::NetworkUnavailable("dns".into()).is_unreachable());
    assert!(!DeliveryError::Timeout.is_unreachable());
  }

  #[test]
  fn test_disk_full_maps_to_quota() {
    let err = rusqlite::Error::SqliteFailure(
      rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
      None,
    );
    assert!(matches!(StoreError::from(err), StoreError::QuotaExceeded));
  }
}
