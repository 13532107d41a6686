//! Submission endpoints and their wire types.
//!
//! Bulk results are correlated to the sent records by position: result
//! `index` i answers the i-th submission of the request body.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;
use url::Url;

use crate::error::DeliveryError;
use crate::outbox::QueuedSubmission;

/// One submission as sent over the wire.
#[derive(Debug, Serialize)]
pub struct SubmissionBody<'a> {
  pub id: &'a str,
  pub form_id: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub form_version: Option<&'a str>,
  pub data: &'a serde_json::Value,
  pub device_id: &'a str,
  pub created_at: DateTime<Utc>,
}

impl<'a> From<&'a QueuedSubmission> for SubmissionBody<'a> {
  fn from(s: &'a QueuedSubmission) -> Self {
    Self {
      id: &s.id,
      form_id: &s.form_id,
      form_version: s.form_version.as_deref(),
      data: &s.payload,
      device_id: &s.device_id,
      created_at: s.created_at,
    }
  }
}

#[derive(Debug, Serialize)]
pub struct BulkRequest<'a> {
  pub submissions: Vec<SubmissionBody<'a>>,
  pub async_processing: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubmitResponse {
  pub id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkResponse {
  pub success_count: usize,
  pub results: Vec<BulkItemResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkItemResult {
  pub index: usize,
  /// HTTP-style status for this item
  pub status: u16,
  #[serde(default)]
  pub id: Option<String>,
  #[serde(default)]
  pub error: Option<String>,
}

impl BulkItemResult {
  fn outcome(&self) -> Result<String, DeliveryError> {
    if (200..300).contains(&self.status) {
      match &self.id {
        Some(id) if !id.is_empty() => Ok(id.clone()),
        _ => Err(DeliveryError::MalformedResponse(format!(
          "result {} acknowledged without an id",
          self.index
        ))),
      }
    } else {
      Err(DeliveryError::from_status(
        self.status,
        self.error.clone().unwrap_or_default(),
      ))
    }
  }
}

impl BulkResponse {
  /// Per-record outcome for a request that carried `sent` submissions.
  ///
  /// A record without a result is treated as a malformed (retryable) answer.
  pub fn correlate(&self, sent: usize) -> Vec<Result<String, DeliveryError>> {
    let mut by_index: HashMap<usize, &BulkItemResult> = HashMap::new();
    for result in &self.results {
      if result.index >= sent {
        warn!(index = result.index, sent, "bulk result index out of range");
        continue;
      }
      by_index.entry(result.index).or_insert(result);
    }

    (0..sent)
      .map(|i| match by_index.get(&i) {
        Some(result) => result.outcome(),
        None => Err(DeliveryError::MalformedResponse(format!(
          "no result for submission {}",
          i
        ))),
      })
      .collect()
  }
}

/// Server endpoints that accept submissions.
#[async_trait]
pub trait SubmissionApi: Send + Sync {
  /// Deliver one submission. `Ok` carries the server's acknowledgment id.
  async fn submit(&self, submission: &QueuedSubmission) -> Result<String, DeliveryError>;

  /// Deliver many submissions in one call.
  async fn submit_bulk(
    &self,
    submissions: &[QueuedSubmission],
  ) -> Result<BulkResponse, DeliveryError>;
}

/// reqwest client for `POST /submissions` and `POST /submissions/bulk`.
#[derive(Clone)]
pub struct HttpSubmissionApi {
  client: reqwest::Client,
  submit_url: Url,
  bulk_url: Url,
  token: Option<String>,
  async_processing: bool,
}

impl HttpSubmissionApi {
  pub fn new(
    client: reqwest::Client,
    submit_url: Url,
    token: Option<String>,
    async_processing: bool,
  ) -> Result<Self, url::ParseError> {
    let bulk_url = Url::parse(&format!(
      "{}/bulk",
      submit_url.as_str().trim_end_matches('/')
    ))?;
    Ok(Self {
      client,
      submit_url,
      bulk_url,
      token,
      async_processing,
    })
  }

  fn post(&self, url: &Url) -> reqwest::RequestBuilder {
    let builder = self.client.post(url.clone());
    match &self.token {
      Some(token) => builder.bearer_auth(token),
      None => builder,
    }
  }

  async fn read_body(response: reqwest::Response) -> Result<Vec<u8>, DeliveryError> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
      return Err(DeliveryError::from_status(
        status.as_u16(),
        String::from_utf8_lossy(&body).into_owned(),
      ));
    }
    Ok(body.to_vec())
  }
}

#[async_trait]
impl SubmissionApi for HttpSubmissionApi {
  async fn submit(&self, submission: &QueuedSubmission) -> Result<String, DeliveryError> {
    let response = self
      .post(&self.submit_url)
      .header("Idempotency-Key", &submission.id)
      .json(&SubmissionBody::from(submission))
      .send()
      .await?;

    let body = Self::read_body(response).await?;
    let ack: SubmitResponse = serde_json::from_slice(&body)
      .map_err(|e| DeliveryError::MalformedResponse(e.to_string()))?;
    if ack.id.is_empty() {
      return Err(DeliveryError::MalformedResponse("empty id".to_string()));
    }
    Ok(ack.id)
  }

  async fn submit_bulk(
    &self,
    submissions: &[QueuedSubmission],
  ) -> Result<BulkResponse, DeliveryError> {
    let request = BulkRequest {
      submissions: submissions.iter().map(SubmissionBody::from).collect(),
      async_processing: self.async_processing,
    };
    let response = self.post(&self.bulk_url).json(&request).send().await?;

    let body = Self::read_body(response).await?;
    serde_json::from_slice(&body).map_err(|e| DeliveryError::MalformedResponse(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn response(json: serde_json::Value) -> BulkResponse {
    serde_json::from_value(json).unwrap()
  }

  #[test]
  fn test_correlates_by_index_not_order() {
    let bulk = response(serde_json::json!({
      "success_count": 2,
      "results": [
        { "index": 2, "status": 201, "id": "s-2" },
        { "index": 0, "status": 201, "id": "s-0" },
        { "index": 1, "status": 422, "error": "missing field" }
      ]
    }));

    let outcomes = bulk.correlate(3);
    assert_eq!(outcomes[0], Ok("s-0".to_string()));
    assert!(matches!(
      outcomes[1],
      Err(DeliveryError::ServerRejected { status: 422, .. })
    ));
    assert_eq!(outcomes[2], Ok("s-2".to_string()));
  }

  #[test]
  fn test_missing_results_are_retryable() {
    let bulk = response(serde_json::json!({
      "success_count": 1,
      "results": [
        { "index": 0, "status": 200, "id": "s-0" },
        { "index": 7, "status": 200, "id": "stray" },
        { "index": 1, "status": 200 }
      ]
    }));

    let outcomes = bulk.correlate(3);
    assert!(outcomes[0].is_ok());
    assert!(matches!(outcomes[1], Err(DeliveryError::MalformedResponse(_))));
    assert!(matches!(outcomes[2], Err(DeliveryError::MalformedResponse(_))));
    assert!(outcomes.iter().filter_map(|o| o.as_ref().err()).all(|e| e.is_retryable()));
  }

  #[test]
  fn test_bulk_url_derived_from_submit_url() {
    let api = HttpSubmissionApi::new(
      reqwest::Client::new(),
      Url::parse("https://collect.example.org/api/submissions").unwrap(),
      None,
      true,
    )
    .unwrap();
    assert_eq!(
      api.bulk_url.as_str(),
      "https://collect.example.org/api/submissions/bulk"
    );
  }
}
