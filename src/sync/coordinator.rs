//! Drains the outbox against the server.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::api::SubmissionApi;
use crate::config::SyncConfig;
use crate::error::{DeliveryError, StoreResult};
use crate::notify::{NotificationChannel, WorkerMessage};
use crate::outbox::{Outbox, QueuedSubmission, SubmissionState};

/// What woke the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  ConnectivityRestored,
  BackgroundSync,
  Poll,
  UserRetry,
}

impl SyncTrigger {
  /// Connectivity and explicit retries do not wait out backoff schedules.
  fn ignores_schedule(&self) -> bool {
    matches!(self, Self::ConnectivityRestored | Self::UserRetry)
  }
}

/// Outcome of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Records this pass claimed
  pub claimed: usize,
  /// Records another pass already held
  pub skipped: usize,
  pub synced: usize,
  /// Scheduled for another attempt
  pub failed: usize,
  pub dead_lettered: usize,
  /// Returned to PENDING because the server was unreachable
  pub released: usize,
  pub single_calls: usize,
  pub bulk_calls: usize,
  /// The pass stopped early on a network failure
  pub aborted: bool,
}

/// Ids claimed by the running pass. Lives only as long as the pass.
#[derive(Default)]
struct SyncSession {
  in_flight: HashSet<String>,
}

impl SyncSession {
  fn claim(&mut self, id: &str) {
    self.in_flight.insert(id.to_string());
  }

  fn resolve(&mut self, id: &str) {
    self.in_flight.remove(id);
  }
}

pub struct SyncCoordinator {
  outbox: Arc<Outbox>,
  api: Arc<dyn SubmissionApi>,
  channel: NotificationChannel,
  batch_threshold: usize,
  max_batch_size: usize,
  single_timeout: Duration,
  bulk_timeout: Duration,
}

impl SyncCoordinator {
  pub fn new(
    outbox: Arc<Outbox>,
    api: Arc<dyn SubmissionApi>,
    channel: NotificationChannel,
    config: &SyncConfig,
  ) -> Self {
    Self {
      outbox,
      api,
      channel,
      batch_threshold: config.batch_threshold.max(1),
      max_batch_size: config.max_batch_size.max(1),
      single_timeout: config.single_timeout(),
      bulk_timeout: config.bulk_timeout(),
    }
  }

  pub fn outbox(&self) -> &Arc<Outbox> {
    &self.outbox
  }

  /// Run one pass over the eligible records.
  ///
  /// Every record is marked IN_FLIGHT before any network call; a record some
  /// other pass already holds is skipped, never resent.
  pub async fn run_pass(&self, trigger: SyncTrigger) -> StoreResult<SyncReport> {
    let mut report = SyncReport::default();

    let snapshot = if trigger.ignores_schedule() {
      self.outbox.list_retryable()?
    } else {
      self.outbox.list_pending(Utc::now())?
    };
    if snapshot.is_empty() {
      debug!(?trigger, "nothing to sync");
      return Ok(report);
    }

    let mut session = SyncSession::default();
    let mut claimed = Vec::with_capacity(snapshot.len());
    for record in snapshot {
      match self.outbox.mark_in_flight(&record.id) {
        Ok(true) => {
          session.claim(&record.id);
          claimed.push(record);
        }
        Ok(false) => report.skipped += 1,
        Err(e) => {
          // Claims made so far must not outlive the pass
          self.release_all(
            &session,
            &DeliveryError::NetworkUnavailable(format!("sync pass interrupted: {}", e)),
          );
          return Err(e);
        }
      }
    }
    report.claimed = claimed.len();
    if claimed.is_empty() {
      return Ok(report);
    }

    info!(?trigger, records = claimed.len(), "sync pass started");
    self.channel.broadcast(WorkerMessage::SyncSubmissions);

    let delivered = if claimed.len() >= self.batch_threshold {
      self.deliver_bulk(&claimed, &mut session, &mut report).await
    } else {
      self.deliver_each(&claimed, &mut session, &mut report).await
    };

    let abort_reason = match delivered {
      Ok(reason) => reason,
      Err(e) => {
        self.release_all(&session, &DeliveryError::NetworkUnavailable(e.to_string()));
        return Err(e);
      }
    };

    if let Some(reason) = abort_reason {
      warn!(error = %reason, remaining = session.in_flight.len(), "server unreachable, aborting pass");
      report.released = self.release_all(&session, &reason);
      report.aborted = true;
    }

    if report.synced > 0 {
      self.channel.broadcast(WorkerMessage::SyncComplete {
        count: report.synced,
      });
    }

    info!(
      synced = report.synced,
      failed = report.failed,
      dead_lettered = report.dead_lettered,
      released = report.released,
      "sync pass finished"
    );
    Ok(report)
  }

  /// One call per record. Returns the failure that made the server
  /// unreachable, if the pass has to stop.
  async fn deliver_each(
    &self,
    records: &[QueuedSubmission],
    session: &mut SyncSession,
    report: &mut SyncReport,
  ) -> StoreResult<Option<DeliveryError>> {
    for record in records {
      report.single_calls += 1;
      let result = timeout(self.single_timeout, self.api.submit(record))
        .await
        .unwrap_or(Err(DeliveryError::Timeout));

      match result {
        Ok(server_id) => self.acknowledge(record, &server_id, session, report)?,
        Err(e) if e.is_unreachable() => return Ok(Some(e)),
        Err(e) => self.fail(record, &e, session, report)?,
      }
    }
    Ok(None)
  }

  /// Bulk calls of at most `max_batch_size` records, correlated by index.
  async fn deliver_bulk(
    &self,
    records: &[QueuedSubmission],
    session: &mut SyncSession,
    report: &mut SyncReport,
  ) -> StoreResult<Option<DeliveryError>> {
    for chunk in records.chunks(self.max_batch_size) {
      report.bulk_calls += 1;
      let result = timeout(self.bulk_timeout, self.api.submit_bulk(chunk))
        .await
        .unwrap_or(Err(DeliveryError::Timeout));

      match result {
        Ok(response) => {
          let outcomes = response.correlate(chunk.len());
          let acked = outcomes.iter().filter(|o| o.is_ok()).count();
          if acked != response.success_count {
            warn!(
              reported = response.success_count,
              acked, "bulk success_count disagrees with results"
            );
          }
          for (record, outcome) in chunk.iter().zip(outcomes) {
            match outcome {
              Ok(server_id) => self.acknowledge(record, &server_id, session, report)?,
              Err(e) => self.fail(record, &e, session, report)?,
            }
          }
        }
        Err(e) if e.is_unreachable() => return Ok(Some(e)),
        Err(e @ DeliveryError::ServerRejected { .. }) => {
          // The batch as a whole was refused; let each record get its own verdict
          warn!(error = %e, records = chunk.len(), "bulk call rejected, delivering individually");
          if let Some(reason) = self.deliver_each(chunk, session, report).await? {
            return Ok(Some(reason));
          }
        }
        Err(e) => {
          for record in chunk {
            self.fail(record, &e, session, report)?;
          }
        }
      }
    }
    Ok(None)
  }

  fn acknowledge(
    &self,
    record: &QueuedSubmission,
    server_id: &str,
    session: &mut SyncSession,
    report: &mut SyncReport,
  ) -> StoreResult<()> {
    self.outbox.mark_synced(&record.id, Some(server_id))?;
    session.resolve(&record.id);
    report.synced += 1;
    Ok(())
  }

  fn fail(
    &self,
    record: &QueuedSubmission,
    error: &DeliveryError,
    session: &mut SyncSession,
    report: &mut SyncReport,
  ) -> StoreResult<()> {
    let state = self.outbox.mark_failed(&record.id, error, Utc::now())?;
    session.resolve(&record.id);

    if state == SubmissionState::DeadLetter {
      report.dead_lettered += 1;
      self.channel.broadcast(WorkerMessage::SubmissionFailed {
        id: record.id.clone(),
        error: error.to_string(),
      });
    } else {
      report.failed += 1;
    }
    Ok(())
  }

  /// Return every unresolved record of the session to PENDING.
  fn release_all(&self, session: &SyncSession, reason: &DeliveryError) -> usize {
    let now = Utc::now();
    let mut released = 0;
    for id in &session.in_flight {
      match self.outbox.release(id, reason, now) {
        Ok(()) => released += 1,
        Err(e) => warn!(id = %id, error = %e, "failed to release submission"),
      }
    }
    released
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Database;
  use crate::outbox::{Backoff, NewSubmission};
  use crate::sync::api::{BulkItemResult, BulkResponse};
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::HashMap;
  use std::sync::Mutex;

  /// In-process server that deduplicates on submission id.
  #[derive(Default)]
  struct FakeServer {
    state: Mutex<ServerState>,
  }

  #[derive(Default)]
  struct ServerState {
    offline: bool,
    /// Status returned for the whole call
    fail_status: Option<u16>,
    /// Forms whose submissions fail validation
    invalid_forms: HashSet<String>,
    /// Calls whose acknowledgment is lost after the server stored the data
    lost_acks: usize,
    delay: Option<Duration>,
    records: HashMap<String, String>,
    single_calls: Vec<String>,
    bulk_calls: Vec<Vec<String>>,
  }

  impl FakeServer {
    fn with(f: impl FnOnce(&mut ServerState)) -> Arc<Self> {
      let server = Self::default();
      f(&mut server.state.lock().unwrap());
      Arc::new(server)
    }

    fn set(&self, f: impl FnOnce(&mut ServerState)) {
      f(&mut self.state.lock().unwrap());
    }

    fn delay(&self) -> Option<Duration> {
      self.state.lock().unwrap().delay
    }

    fn sent_ids(&self) -> Vec<String> {
      let state = self.state.lock().unwrap();
      let mut ids = state.single_calls.clone();
      ids.extend(state.bulk_calls.iter().flatten().cloned());
      ids
    }
  }

  impl ServerState {
    fn accept(&mut self, submission: &QueuedSubmission) -> Result<String, DeliveryError> {
      if self.invalid_forms.contains(&submission.form_id) {
        return Err(DeliveryError::ServerRejected {
          status: 422,
          message: "validation failed".into(),
        });
      }
      let server_id = format!("srv-{}", submission.id);
      Ok(self.records.entry(submission.id.clone()).or_insert(server_id).clone())
    }

    fn gate(&mut self) -> Result<(), DeliveryError> {
      if self.offline {
        return Err(DeliveryError::NetworkUnavailable("connection refused".into()));
      }
      if let Some(status) = self.fail_status {
        return Err(DeliveryError::from_status(status, "scripted failure"));
      }
      Ok(())
    }

    fn lose_ack(&mut self) -> bool {
      if self.lost_acks > 0 {
        self.lost_acks -= 1;
        true
      } else {
        false
      }
    }
  }

  #[async_trait]
  impl SubmissionApi for FakeServer {
    async fn submit(&self, submission: &QueuedSubmission) -> Result<String, DeliveryError> {
      if let Some(delay) = self.delay() {
        tokio::time::sleep(delay).await;
      }
      let mut state = self.state.lock().unwrap();
      state.single_calls.push(submission.id.clone());
      state.gate()?;
      let result = state.accept(submission);
      if state.lose_ack() {
        return Err(DeliveryError::NetworkUnavailable("connection reset".into()));
      }
      result
    }

    async fn submit_bulk(
      &self,
      submissions: &[QueuedSubmission],
    ) -> Result<BulkResponse, DeliveryError> {
      if let Some(delay) = self.delay() {
        tokio::time::sleep(delay).await;
      }
      let mut state = self.state.lock().unwrap();
      state
        .bulk_calls
        .push(submissions.iter().map(|s| s.id.clone()).collect());
      state.gate()?;

      let results: Vec<BulkItemResult> = submissions
        .iter()
        .enumerate()
        .map(|(index, s)| match state.accept(s) {
          Ok(id) => BulkItemResult {
            index,
            status: 201,
            id: Some(id),
            error: None,
          },
          Err(e) => BulkItemResult {
            index,
            status: 422,
            id: None,
            error: Some(e.to_string()),
          },
        })
        .collect();
      if state.lose_ack() {
        return Err(DeliveryError::NetworkUnavailable("connection reset".into()));
      }

      Ok(BulkResponse {
        success_count: results.iter().filter(|r| r.status < 300).count(),
        results,
      })
    }
  }

  struct Harness {
    outbox: Arc<Outbox>,
    server: Arc<FakeServer>,
    coordinator: SyncCoordinator,
    channel: NotificationChannel,
  }

  fn harness_with(db: Arc<Database>, server: Arc<FakeServer>, config: SyncConfig) -> Harness {
    let outbox = Arc::new(Outbox::new(db, Backoff::default()).unwrap());
    let (channel, _inbound) = NotificationChannel::new(16);
    let coordinator = SyncCoordinator::new(outbox.clone(), server.clone(), channel.clone(), &config);
    Harness {
      outbox,
      server,
      coordinator,
      channel,
    }
  }

  fn harness(server: Arc<FakeServer>) -> Harness {
    harness_with(
      Arc::new(Database::open_in_memory().unwrap()),
      server,
      SyncConfig::default(),
    )
  }

  fn enqueue(outbox: &Outbox, form: &str, n: usize) -> Vec<String> {
    (0..n)
      .map(|i| {
        outbox
          .enqueue(NewSubmission::new(form, json!({ "visit": i })))
          .unwrap()
          .id
      })
      .collect()
  }

  #[tokio::test]
  async fn test_offline_backlog_syncs_in_one_bulk_call() {
    let server = FakeServer::with(|s| s.offline = true);
    let h = harness(server.clone());
    let mut page = h.channel.connect();
    enqueue(&h.outbox, "visit", 3);

    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.released, 3);
    assert_eq!(h.outbox.stats().unwrap().pending, 3);

    server.set(|s| s.offline = false);
    let report = h
      .coordinator
      .run_pass(SyncTrigger::ConnectivityRestored)
      .await
      .unwrap();
    assert_eq!(report.bulk_calls, 1);
    assert_eq!(report.single_calls, 0);
    assert_eq!(report.synced, 3);
    assert_eq!(server.state.lock().unwrap().bulk_calls.last().unwrap().len(), 3);
    assert_eq!(h.outbox.stats().unwrap().queued(), 0);

    let mut messages = Vec::new();
    while let Some(m) = page.try_recv() {
      messages.push(m);
    }
    assert_eq!(
      messages.last(),
      Some(&WorkerMessage::SyncComplete { count: 3 })
    );
  }

  #[tokio::test]
  async fn test_server_error_schedules_retry() {
    let server = FakeServer::with(|s| s.fail_status = Some(500));
    let h = harness(server);
    let id = enqueue(&h.outbox, "visit", 1).remove(0);

    let before = Utc::now();
    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.single_calls, 1);
    assert_eq!(report.failed, 1);

    let record = h.outbox.get(&id).unwrap().unwrap();
    assert!(record.state.is_pending());
    assert_eq!(record.retry_count, 1);
    let delay = record.next_retry_at - before;
    assert!(delay >= chrono::Duration::seconds(4));
    assert!(delay <= chrono::Duration::seconds(7));

    // Not due yet for a scheduled pass
    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.claimed, 0);
  }

  #[tokio::test]
  async fn test_large_backlog_uses_single_bulk_call() {
    let server = FakeServer::with(|_| {});
    let h = harness(server.clone());
    enqueue(&h.outbox, "visit", 15);

    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.bulk_calls, 1);
    assert_eq!(report.single_calls, 0);
    assert_eq!(report.synced, 15);
    assert!(server.state.lock().unwrap().single_calls.is_empty());
  }

  #[tokio::test]
  async fn test_bulk_chunks_respect_max_batch_size() {
    let server = FakeServer::with(|_| {});
    let config = SyncConfig {
      max_batch_size: 4,
      ..SyncConfig::default()
    };
    let h = harness_with(Arc::new(Database::open_in_memory().unwrap()), server.clone(), config);
    enqueue(&h.outbox, "visit", 10);

    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.bulk_calls, 3);
    let sizes: Vec<usize> = server
      .state
      .lock()
      .unwrap()
      .bulk_calls
      .iter()
      .map(Vec::len)
      .collect();
    assert_eq!(sizes, vec![4, 4, 2]);
  }

  #[tokio::test]
  async fn test_validation_error_in_bulk_dead_letters_only_that_record() {
    let server = FakeServer::with(|s| {
      s.invalid_forms.insert("broken-form".to_string());
    });
    let h = harness(server);
    let mut page = h.channel.connect();
    let good = enqueue(&h.outbox, "visit", 2);
    let bad = enqueue(&h.outbox, "broken-form", 1).remove(0);

    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.bulk_calls, 1);
    assert_eq!(report.synced, 2);
    assert_eq!(report.dead_lettered, 1);

    for id in &good {
      assert!(h.outbox.is_synced(id).unwrap());
    }
    let dead = h.outbox.get(&bad).unwrap().unwrap();
    assert_eq!(dead.state, SubmissionState::DeadLetter);

    let mut saw_failure = false;
    while let Some(m) = page.try_recv() {
      if let WorkerMessage::SubmissionFailed { id, .. } = m {
        assert_eq!(id, bad);
        saw_failure = true;
      }
    }
    assert!(saw_failure);
  }

  #[tokio::test]
  async fn test_bulk_rejected_as_a_whole_falls_back_to_singles() {
    let server = FakeServer::with(|s| s.fail_status = Some(413));
    let h = harness(server.clone());
    enqueue(&h.outbox, "visit", 2);

    // Whole-call 413 also applies to the single calls, so both dead-letter
    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.bulk_calls, 1);
    assert_eq!(report.single_calls, 2);
    assert_eq!(report.dead_lettered, 2);
  }

  #[tokio::test]
  async fn test_network_failure_aborts_and_releases_everything() {
    let server = FakeServer::with(|s| s.offline = true);
    let config = SyncConfig {
      batch_threshold: 100,
      ..SyncConfig::default()
    };
    let h = harness_with(Arc::new(Database::open_in_memory().unwrap()), server.clone(), config);
    enqueue(&h.outbox, "visit", 4);

    let report = h.coordinator.run_pass(SyncTrigger::UserRetry).await.unwrap();
    assert!(report.aborted);
    // First call failed, the remaining three were never attempted
    assert_eq!(server.state.lock().unwrap().single_calls.len(), 1);
    assert_eq!(report.released, 4);

    let stats = h.outbox.stats().unwrap();
    assert_eq!(stats.pending, 4);
    assert_eq!(stats.in_flight, 0);
    for record in h.outbox.list_retryable().unwrap() {
      assert_eq!(record.state, SubmissionState::Pending);
      assert_eq!(record.retry_count, 0);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_counts_as_retryable_failure() {
    let server = FakeServer::with(|s| s.delay = Some(Duration::from_secs(120)));
    let h = harness(server);
    let id = enqueue(&h.outbox, "visit", 1).remove(0);

    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.failed, 1);
    let record = h.outbox.get(&id).unwrap().unwrap();
    assert_eq!(record.state, SubmissionState::Failed);
    assert_eq!(record.last_error.as_deref(), Some("request timed out"));
  }

  #[tokio::test]
  async fn test_concurrent_passes_never_resend() {
    let server = FakeServer::with(|s| s.delay = Some(Duration::from_millis(50)));
    let h = harness(server.clone());
    let ids = enqueue(&h.outbox, "visit", 6);

    let (a, b) = tokio::join!(
      h.coordinator.run_pass(SyncTrigger::Poll),
      h.coordinator.run_pass(SyncTrigger::UserRetry)
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.synced + b.synced, 6);

    let mut sent = server.sent_ids();
    sent.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(sent, expected);
  }

  #[tokio::test]
  async fn test_lost_ack_replay_creates_one_server_record() {
    let server = FakeServer::with(|s| s.lost_acks = 1);
    let h = harness(server.clone());
    let id = enqueue(&h.outbox, "visit", 1).remove(0);

    // Server stored it but the ack never arrived: the record stays queued
    let report = h.coordinator.run_pass(SyncTrigger::Poll).await.unwrap();
    assert_eq!(report.synced, 0);
    assert!(h.outbox.get(&id).unwrap().is_some());

    let report = h.coordinator.run_pass(SyncTrigger::UserRetry).await.unwrap();
    assert_eq!(report.synced, 1);

    let state = server.state.lock().unwrap();
    assert_eq!(state.single_calls, vec![id.clone(), id.clone()]);
    assert_eq!(state.records.len(), 1);
  }

  #[tokio::test]
  async fn test_queue_drains_after_offline_periods_and_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("worker.db");
    let server = FakeServer::with(|s| s.offline = true);

    let mut all = Vec::new();
    for round in 0..3 {
      let db = Arc::new(Database::open(&path, None).unwrap());
      let h = harness_with(db, server.clone(), SyncConfig::default());
      h.outbox.recover_in_flight().unwrap();
      all.extend(enqueue(&h.outbox, "visit", round + 1));
      let report = h.coordinator.run_pass(SyncTrigger::UserRetry).await.unwrap();
      assert_eq!(report.synced, 0);
      // Process "dies" with records claimed mid-pass
      if round == 1 {
        h.outbox.mark_in_flight(&all[0]).unwrap();
      }
    }

    server.set(|s| s.offline = false);
    let db = Arc::new(Database::open(&path, None).unwrap());
    let h = harness_with(db, server.clone(), SyncConfig::default());
    h.outbox.recover_in_flight().unwrap();

    for _ in 0..5 {
      if h.outbox.stats().unwrap().queued() == 0 {
        break;
      }
      h.coordinator
        .run_pass(SyncTrigger::ConnectivityRestored)
        .await
        .unwrap();
    }

    assert_eq!(h.outbox.stats().unwrap().queued(), 0);
    for id in &all {
      assert!(h.outbox.is_synced(id).unwrap());
    }
    assert_eq!(server.state.lock().unwrap().records.len(), all.len());
  }

  #[tokio::test]
  async fn test_store_failure_while_claiming_releases_earlier_claims() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let server = FakeServer::with(|_| {});
    let h = harness_with(db.clone(), server.clone(), SyncConfig::default());
    for id in ["first", "second"] {
      h.outbox
        .enqueue(NewSubmission::new("visit", json!({})).with_id(id))
        .unwrap();
    }
    db.conn()
      .unwrap()
      .execute_batch(
        "CREATE TRIGGER refuse_second BEFORE UPDATE OF state ON outbox
         WHEN NEW.id = 'second' AND NEW.state = 'IN_FLIGHT'
         BEGIN SELECT RAISE(ABORT, 'device storage failure'); END;",
      )
      .unwrap();

    assert!(h.coordinator.run_pass(SyncTrigger::UserRetry).await.is_err());
    assert!(server.sent_ids().is_empty());

    let first = h.outbox.get("first").unwrap().unwrap();
    assert_eq!(first.state, SubmissionState::Pending);
    assert_eq!(h.outbox.stats().unwrap().in_flight, 0);

    // Once the store recovers the same process drains the queue
    db.conn()
      .unwrap()
      .execute_batch("DROP TRIGGER refuse_second;")
      .unwrap();
    let report = h.coordinator.run_pass(SyncTrigger::UserRetry).await.unwrap();
    assert_eq!(report.synced, 2);
  }

  #[tokio::test]
  async fn test_repeated_failures_dead_letter_once() {
    let server = FakeServer::with(|s| s.fail_status = Some(503));
    let h = harness(server.clone());
    let mut page = h.channel.connect();
    let id = enqueue(&h.outbox, "visit", 1).remove(0);

    for _ in 0..12 {
      h.coordinator.run_pass(SyncTrigger::UserRetry).await.unwrap();
    }

    assert_eq!(server.state.lock().unwrap().single_calls.len(), 9);
    let record = h.outbox.get(&id).unwrap().unwrap();
    assert_eq!(record.state, SubmissionState::DeadLetter);

    let mut failures = 0;
    while let Some(m) = page.try_recv() {
      if matches!(m, WorkerMessage::SubmissionFailed { .. }) {
        failures += 1;
      }
    }
    assert_eq!(failures, 1);
  }
}
