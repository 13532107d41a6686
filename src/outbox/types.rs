//! Submission records held by the outbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Delivery state of a queued submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionState {
  /// Never attempted, or released after the server could not be reached
  Pending,
  /// Claimed by a running sync pass
  InFlight,
  /// Last attempt failed; retried once `next_retry_at` has elapsed
  Failed,
  /// Acknowledged by the server
  Synced,
  /// Out of retries or rejected; needs user action
  DeadLetter,
}

impl SubmissionState {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Pending => "PENDING",
      Self::InFlight => "IN_FLIGHT",
      Self::Failed => "FAILED",
      Self::Synced => "SYNCED",
      Self::DeadLetter => "DEAD_LETTER",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "PENDING" => Some(Self::Pending),
      "IN_FLIGHT" => Some(Self::InFlight),
      "FAILED" => Some(Self::Failed),
      "SYNCED" => Some(Self::Synced),
      "DEAD_LETTER" => Some(Self::DeadLetter),
      _ => None,
    }
  }

  /// Whether a sync pass may pick the record up.
  pub fn is_pending(&self) -> bool {
    matches!(self, Self::Pending | Self::Failed)
  }
}

impl std::fmt::Display for SubmissionState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// A submission as captured by the page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSubmission {
  /// Client-generated id; one is generated when absent
  #[serde(default)]
  pub id: Option<String>,
  pub form_id: String,
  #[serde(default)]
  pub form_version: Option<String>,
  pub payload: serde_json::Value,
}

impl NewSubmission {
  pub fn new(form_id: impl Into<String>, payload: serde_json::Value) -> Self {
    Self {
      id: None,
      form_id: form_id.into(),
      form_version: None,
      payload,
    }
  }

  pub fn with_id(mut self, id: impl Into<String>) -> Self {
    self.id = Some(id.into());
    self
  }

  pub fn with_form_version(mut self, version: impl Into<String>) -> Self {
    self.form_version = Some(version.into());
    self
  }
}

/// A durable outbox record. The id doubles as the server's idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueuedSubmission {
  pub id: String,
  pub form_id: String,
  pub form_version: Option<String>,
  pub payload: serde_json::Value,
  pub device_id: String,
  pub created_at: DateTime<Utc>,
  pub state: SubmissionState,
  pub retry_count: u32,
  pub next_retry_at: DateTime<Utc>,
  pub last_error: Option<String>,
}

/// Record counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
  pub pending: usize,
  pub in_flight: usize,
  pub failed: usize,
  pub dead_letter: usize,
  /// Receipts of acknowledged submissions
  pub synced: usize,
}

impl OutboxStats {
  /// Records still held in the outbox.
  pub fn queued(&self) -> usize {
    self.pending + self.in_flight + self.failed + self.dead_letter
  }
}
