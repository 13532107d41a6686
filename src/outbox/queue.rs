//! Durable outbox of submissions awaiting server acknowledgment.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::types::{NewSubmission, OutboxStats, QueuedSubmission, SubmissionState};
use crate::cache::CacheStore;
use crate::db::Database;
use crate::error::{DeliveryError, StoreError, StoreResult};

/// Sync receipts kept by default; older ones are pruned on acknowledgment.
pub const DEFAULT_RECEIPT_LIMIT: usize = 10_000;

const SELECT_COLUMNS: &str = "id, form_id, form_version, payload, device_id, created_at, \
                              state, retry_count, next_retry_at, last_error";

/// Outbox backed by the worker database.
///
/// Records are only appended, moved between states, or removed once the
/// server has acknowledged them.
pub struct Outbox {
  db: Arc<Database>,
  backoff: Backoff,
  device_id: String,
  /// Cache that gives up space when the database is full
  reclaim: Option<Arc<dyn CacheStore>>,
  receipt_limit: usize,
}

impl Outbox {
  pub fn new(db: Arc<Database>, backoff: Backoff) -> StoreResult<Self> {
    let device_id = db.device_id()?;
    Ok(Self {
      db,
      backoff,
      device_id,
      reclaim: None,
      receipt_limit: DEFAULT_RECEIPT_LIMIT,
    })
  }

  /// Evict cache generations before refusing a submission for lack of space.
  pub fn with_cache_eviction(mut self, cache: Arc<dyn CacheStore>) -> Self {
    self.reclaim = Some(cache);
    self
  }

  /// Keep at most `limit` sync receipts.
  pub fn with_receipt_limit(mut self, limit: usize) -> Self {
    self.receipt_limit = limit.max(1);
    self
  }

  pub fn device_id(&self) -> &str {
    &self.device_id
  }

  pub fn backoff(&self) -> &Backoff {
    &self.backoff
  }

  /// Durably append a submission. Never touches the network.
  ///
  /// Re-enqueueing a queued id returns the existing record; an id that was
  /// already acknowledged fails with `AlreadySynced`. `QuotaExceeded` means the
  /// record was NOT saved and the user must be told.
  pub fn enqueue(&self, submission: NewSubmission) -> StoreResult<QueuedSubmission> {
    let id = submission
      .id
      .clone()
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    loop {
      match self.try_enqueue(&id, &submission) {
        Err(StoreError::QuotaExceeded) => {
          if !self.reclaim_space()? {
            error!(id = %id, form_id = %submission.form_id, "outbox full, submission not saved");
            return Err(StoreError::QuotaExceeded);
          }
          warn!(id = %id, "storage quota reached, freed space for submission");
        }
        other => return other,
      }
    }
  }

  fn try_enqueue(&self, id: &str, submission: &NewSubmission) -> StoreResult<QueuedSubmission> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let synced: Option<String> = tx
      .query_row(
        "SELECT id FROM sync_receipts WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()?;
    if synced.is_some() {
      return Err(StoreError::AlreadySynced(id.to_string()));
    }

    let existing = tx
      .query_row(
        &format!("SELECT {} FROM outbox WHERE id = ?", SELECT_COLUMNS),
        params![id],
        RawRow::from_row,
      )
      .optional()?;
    if let Some(raw) = existing {
      debug!(id, "submission already queued");
      return raw.into_submission();
    }

    let now = Utc::now();
    let record = QueuedSubmission {
      id: id.to_string(),
      form_id: submission.form_id.clone(),
      form_version: submission.form_version.clone(),
      payload: submission.payload.clone(),
      device_id: self.device_id.clone(),
      created_at: now,
      state: SubmissionState::Pending,
      retry_count: 0,
      next_retry_at: now,
      last_error: None,
    };

    tx.execute(
      "INSERT INTO outbox (id, form_id, form_version, payload, device_id, created_at,
                           state, retry_count, next_retry_at, last_error)
       VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, NULL)",
      params![
        record.id,
        record.form_id,
        record.form_version,
        serde_json::to_string(&record.payload)?,
        record.device_id,
        now.timestamp_millis(),
        SubmissionState::Pending.as_str(),
        now.timestamp_millis(),
      ],
    )?;
    tx.commit()?;

    info!(id = %record.id, form_id = %record.form_id, "submission queued");
    Ok(record)
  }

  pub fn get(&self, id: &str) -> StoreResult<Option<QueuedSubmission>> {
    let conn = self.db.conn()?;
    let raw = conn
      .query_row(
        &format!("SELECT {} FROM outbox WHERE id = ?", SELECT_COLUMNS),
        params![id],
        RawRow::from_row,
      )
      .optional()?;
    raw.map(RawRow::into_submission).transpose()
  }

  /// Pending records whose retry time has elapsed, in creation order.
  pub fn list_pending(&self, now: DateTime<Utc>) -> StoreResult<Vec<QueuedSubmission>> {
    self.query(
      &format!(
        "SELECT {} FROM outbox WHERE state IN (?, ?) AND next_retry_at <= ? ORDER BY seq",
        SELECT_COLUMNS
      ),
      params![
        SubmissionState::Pending.as_str(),
        SubmissionState::Failed.as_str(),
        now.timestamp_millis()
      ],
    )
  }

  /// Pending records regardless of their retry schedule, in creation order.
  pub fn list_retryable(&self) -> StoreResult<Vec<QueuedSubmission>> {
    self.query(
      &format!(
        "SELECT {} FROM outbox WHERE state IN (?, ?) ORDER BY seq",
        SELECT_COLUMNS
      ),
      params![
        SubmissionState::Pending.as_str(),
        SubmissionState::Failed.as_str()
      ],
    )
  }

  /// Records waiting for user action.
  pub fn dead_letters(&self) -> StoreResult<Vec<QueuedSubmission>> {
    self.query(
      &format!("SELECT {} FROM outbox WHERE state = ? ORDER BY seq", SELECT_COLUMNS),
      params![SubmissionState::DeadLetter.as_str()],
    )
  }

  fn query(
    &self,
    sql: &str,
    params: impl rusqlite::Params,
  ) -> StoreResult<Vec<QueuedSubmission>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
      .query_map(params, RawRow::from_row)?
      .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RawRow::into_submission).collect()
  }

  /// Claim a record for delivery. Returns false if another pass holds it or
  /// it is no longer pending; the caller must then skip it.
  pub fn mark_in_flight(&self, id: &str) -> StoreResult<bool> {
    let conn = self.db.conn()?;
    let changed = conn.execute(
      "UPDATE outbox SET state = ? WHERE id = ? AND state IN (?, ?)",
      params![
        SubmissionState::InFlight.as_str(),
        id,
        SubmissionState::Pending.as_str(),
        SubmissionState::Failed.as_str()
      ],
    )?;
    Ok(changed == 1)
  }

  /// Remove an acknowledged record and keep a receipt of it.
  ///
  /// Under a full quota the record is still removed: space is reclaimed first,
  /// and if none can be found the receipt is dropped instead of the record
  /// being left to resend forever.
  pub fn mark_synced(&self, id: &str, server_id: Option<&str>) -> StoreResult<()> {
    loop {
      match self.try_mark_synced(id, server_id, true) {
        Err(StoreError::QuotaExceeded) => {
          if !self.reclaim_space()? {
            warn!(id, "storage full, dropping sync receipt");
            return self.try_mark_synced(id, server_id, false);
          }
        }
        other => return other,
      }
    }
  }

  fn try_mark_synced(&self, id: &str, server_id: Option<&str>, receipt: bool) -> StoreResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let removed = tx.execute("DELETE FROM outbox WHERE id = ?", params![id])?;
    if removed == 0 {
      return Err(StoreError::NotFound(id.to_string()));
    }
    if receipt {
      tx.execute(
        "INSERT OR REPLACE INTO sync_receipts (id, server_id, synced_at) VALUES (?, ?, ?)",
        params![id, server_id, Utc::now().timestamp_millis()],
      )?;
      tx.execute(
        "DELETE FROM sync_receipts WHERE rowid IN
           (SELECT rowid FROM sync_receipts ORDER BY rowid DESC LIMIT -1 OFFSET ?)",
        params![self.receipt_limit as i64],
      )?;
    }
    tx.commit()?;

    debug!(id, "submission synced");
    Ok(())
  }

  /// Free space after a write hit the quota: cache entries first, then the
  /// oldest half of the sync receipts. Returns false if nothing was freed.
  fn reclaim_space(&self) -> StoreResult<bool> {
    if let Some(cache) = &self.reclaim {
      if cache.evict_oldest()? {
        return Ok(true);
      }
    }

    let conn = self.db.conn()?;
    let pruned = conn.execute(
      "DELETE FROM sync_receipts WHERE rowid IN
         (SELECT rowid FROM sync_receipts ORDER BY rowid
          LIMIT MAX(1, (SELECT COUNT(*) FROM sync_receipts) / 2))",
      [],
    )?;
    if pruned > 0 {
      warn!(pruned, "pruned sync receipts to make room");
    }
    Ok(pruned > 0)
  }

  /// Record a failed attempt and schedule the next one.
  ///
  /// Non-retryable errors and exhausted retry budgets move the record to
  /// DEAD_LETTER, after which it is never picked up automatically.
  pub fn mark_failed(
    &self,
    id: &str,
    failure: &DeliveryError,
    now: DateTime<Utc>,
  ) -> StoreResult<SubmissionState> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let current: Option<(String, u32)> = tx
      .query_row(
        "SELECT state, retry_count FROM outbox WHERE id = ?",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;
    let Some((state, retry_count)) = current else {
      return Err(StoreError::NotFound(id.to_string()));
    };
    if SubmissionState::parse(&state) == Some(SubmissionState::DeadLetter) {
      return Ok(SubmissionState::DeadLetter);
    }

    let retry_count = retry_count + 1;
    let state = if !failure.is_retryable() || self.backoff.is_exhausted(retry_count) {
      SubmissionState::DeadLetter
    } else {
      SubmissionState::Failed
    };
    let next_retry_at = now + self.backoff.next_delay(retry_count);

    tx.execute(
      "UPDATE outbox SET state = ?, retry_count = ?, next_retry_at = ?, last_error = ?
       WHERE id = ?",
      params![
        state.as_str(),
        retry_count,
        next_retry_at.timestamp_millis(),
        failure.to_string(),
        id
      ],
    )?;
    tx.commit()?;

    if state == SubmissionState::DeadLetter {
      error!(id, retry_count, error = %failure, "submission dead-lettered");
    } else {
      debug!(id, retry_count, next_retry_at = %next_retry_at, error = %failure, "submission failed");
    }
    Ok(state)
  }

  /// Return a claimed record to PENDING after the server could not be reached.
  ///
  /// The retry budget is not consumed: being offline is not the record's fault.
  pub fn release(&self, id: &str, reason: &DeliveryError, now: DateTime<Utc>) -> StoreResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let retry_count: Option<u32> = tx
      .query_row(
        "SELECT retry_count FROM outbox WHERE id = ? AND state = ?",
        params![id, SubmissionState::InFlight.as_str()],
        |row| row.get(0),
      )
      .optional()?;
    let Some(retry_count) = retry_count else {
      return Ok(());
    };

    let next_retry_at = now + self.backoff.next_delay(retry_count.max(1));
    tx.execute(
      "UPDATE outbox SET state = ?, next_retry_at = ?, last_error = ? WHERE id = ?",
      params![
        SubmissionState::Pending.as_str(),
        next_retry_at.timestamp_millis(),
        reason.to_string(),
        id
      ],
    )?;
    tx.commit()?;
    Ok(())
  }

  /// Put records a dead process left IN_FLIGHT back to PENDING.
  pub fn recover_in_flight(&self) -> StoreResult<usize> {
    let conn = self.db.conn()?;
    let recovered = conn.execute(
      "UPDATE outbox SET state = ? WHERE state = ?",
      params![
        SubmissionState::Pending.as_str(),
        SubmissionState::InFlight.as_str()
      ],
    )?;
    if recovered > 0 {
      info!(recovered, "recovered interrupted submissions");
    }
    Ok(recovered)
  }

  /// Give a dead-lettered record a fresh retry budget.
  pub fn requeue(&self, id: &str) -> StoreResult<QueuedSubmission> {
    {
      let conn = self.db.conn()?;
      let changed = conn.execute(
        "UPDATE outbox SET state = ?, retry_count = 0, next_retry_at = ?, last_error = NULL
         WHERE id = ? AND state = ?",
        params![
          SubmissionState::Pending.as_str(),
          Utc::now().timestamp_millis(),
          id,
          SubmissionState::DeadLetter.as_str()
        ],
      )?;
      if changed == 0 {
        return Err(StoreError::NotFound(id.to_string()));
      }
    }
    info!(id, "dead-lettered submission requeued");
    self
      .get(id)?
      .ok_or_else(|| StoreError::NotFound(id.to_string()))
  }

  /// Earliest scheduled retry among pending records.
  pub fn next_due(&self) -> StoreResult<Option<DateTime<Utc>>> {
    let conn = self.db.conn()?;
    let due: Option<i64> = conn.query_row(
      "SELECT MIN(next_retry_at) FROM outbox WHERE state IN (?, ?)",
      params![
        SubmissionState::Pending.as_str(),
        SubmissionState::Failed.as_str()
      ],
      |row| row.get(0),
    )?;
    Ok(due.map(from_millis))
  }

  pub fn is_synced(&self, id: &str) -> StoreResult<bool> {
    let conn = self.db.conn()?;
    let found: Option<String> = conn
      .query_row(
        "SELECT id FROM sync_receipts WHERE id = ?",
        params![id],
        |row| row.get(0),
      )
      .optional()?;
    Ok(found.is_some())
  }

  pub fn stats(&self) -> StoreResult<OutboxStats> {
    let conn = self.db.conn()?;
    let mut stats = OutboxStats::default();

    let mut stmt = conn.prepare("SELECT state, COUNT(*) FROM outbox GROUP BY state")?;
    let counts = stmt
      .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
      .collect::<Result<Vec<_>, _>>()?;
    for (state, count) in counts {
      let count = count as usize;
      match SubmissionState::parse(&state) {
        Some(SubmissionState::Pending) => stats.pending = count,
        Some(SubmissionState::InFlight) => stats.in_flight = count,
        Some(SubmissionState::Failed) => stats.failed = count,
        Some(SubmissionState::DeadLetter) => stats.dead_letter = count,
        _ => {}
      }
    }

    let synced: i64 = conn.query_row("SELECT COUNT(*) FROM sync_receipts", [], |row| row.get(0))?;
    stats.synced = synced as usize;
    Ok(stats)
  }
}

/// Outbox row before JSON decoding.
struct RawRow {
  id: String,
  form_id: String,
  form_version: Option<String>,
  payload: String,
  device_id: String,
  created_at: i64,
  state: String,
  retry_count: u32,
  next_retry_at: i64,
  last_error: Option<String>,
}

impl RawRow {
  fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
    Ok(Self {
      id: row.get(0)?,
      form_id: row.get(1)?,
      form_version: row.get(2)?,
      payload: row.get(3)?,
      device_id: row.get(4)?,
      created_at: row.get(5)?,
      state: row.get(6)?,
      retry_count: row.get(7)?,
      next_retry_at: row.get(8)?,
      last_error: row.get(9)?,
    })
  }

  fn into_submission(self) -> StoreResult<QueuedSubmission> {
    let state = SubmissionState::parse(&self.state).ok_or_else(|| {
      StoreError::Sqlite(rusqlite::Error::InvalidColumnType(
        6,
        format!("state {}", self.state),
        rusqlite::types::Type::Text,
      ))
    })?;

    Ok(QueuedSubmission {
      id: self.id,
      form_id: self.form_id,
      form_version: self.form_version,
      payload: serde_json::from_str(&self.payload)?,
      device_id: self.device_id,
      created_at: from_millis(self.created_at),
      state,
      retry_count: self.retry_count,
      next_retry_at: from_millis(self.next_retry_at),
      last_error: self.last_error,
    })
  }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheEntry, CacheKey, SqliteCacheStore};
  use crate::net::{Request, Response};
  use chrono::Duration;
  use serde_json::json;

  fn outbox() -> Outbox {
    Outbox::new(Arc::new(Database::open_in_memory().unwrap()), Backoff::default()).unwrap()
  }

  fn submission(n: u32) -> NewSubmission {
    NewSubmission::new("household-survey", json!({ "household": n })).with_form_version("3")
  }

  fn server_error() -> DeliveryError {
    DeliveryError::ServerError {
      status: 500,
      message: "internal".into(),
    }
  }

  #[test]
  fn test_enqueue_assigns_id_and_device() {
    let outbox = outbox();
    let record = outbox.enqueue(submission(1)).unwrap();
    assert!(!record.id.is_empty());
    assert_eq!(record.device_id, outbox.device_id());
    assert_eq!(record.state, SubmissionState::Pending);
    assert_eq!(record.retry_count, 0);
    assert_eq!(outbox.get(&record.id).unwrap().unwrap(), record);
  }

  #[test]
  fn test_list_pending_is_fifo() {
    let outbox = outbox();
    let ids: Vec<String> = (0..5)
      .map(|n| outbox.enqueue(submission(n)).unwrap().id)
      .collect();
    let listed: Vec<String> = outbox
      .list_pending(Utc::now())
      .unwrap()
      .into_iter()
      .map(|r| r.id)
      .collect();
    assert_eq!(listed, ids);
  }

  #[test]
  fn test_enqueue_same_id_is_idempotent() {
    let outbox = outbox();
    let first = outbox.enqueue(submission(1).with_id("abc")).unwrap();
    let again = outbox.enqueue(submission(2).with_id("abc")).unwrap();
    assert_eq!(first, again);
    assert_eq!(outbox.stats().unwrap().pending, 1);
  }

  #[test]
  fn test_enqueue_after_sync_is_rejected() {
    let outbox = outbox();
    outbox.enqueue(submission(1).with_id("abc")).unwrap();
    assert!(outbox.mark_in_flight("abc").unwrap());
    outbox.mark_synced("abc", Some("srv-1")).unwrap();

    assert!(outbox.is_synced("abc").unwrap());
    assert!(outbox.get("abc").unwrap().is_none());
    assert!(matches!(
      outbox.enqueue(submission(1).with_id("abc")),
      Err(StoreError::AlreadySynced(_))
    ));
  }

  #[test]
  fn test_in_flight_is_exclusive() {
    let outbox = outbox();
    let id = outbox.enqueue(submission(1)).unwrap().id;
    assert!(outbox.mark_in_flight(&id).unwrap());
    assert!(!outbox.mark_in_flight(&id).unwrap());
    assert!(outbox.list_pending(Utc::now()).unwrap().is_empty());
  }

  #[test]
  fn test_failure_schedules_backoff() {
    let outbox = outbox();
    let id = outbox.enqueue(submission(1)).unwrap().id;
    let now = Utc::now();
    outbox.mark_in_flight(&id).unwrap();

    let state = outbox.mark_failed(&id, &server_error(), now).unwrap();
    assert_eq!(state, SubmissionState::Failed);

    let record = outbox.get(&id).unwrap().unwrap();
    assert!(record.state.is_pending());
    assert_eq!(record.retry_count, 1);
    let delay = record.next_retry_at - now;
    assert!(delay >= Duration::seconds(4) && delay <= Duration::seconds(6));
    assert!(record.last_error.unwrap().contains("500"));

    assert!(outbox.list_pending(now).unwrap().is_empty());
    assert_eq!(outbox.list_pending(now + Duration::seconds(7)).unwrap().len(), 1);
    assert_eq!(outbox.next_due().unwrap().unwrap(), record.next_retry_at);
  }

  #[test]
  fn test_rejection_dead_letters_immediately() {
    let outbox = outbox();
    let id = outbox.enqueue(submission(1)).unwrap().id;
    outbox.mark_in_flight(&id).unwrap();
    let rejected = DeliveryError::ServerRejected {
      status: 422,
      message: "missing field".into(),
    };
    assert_eq!(
      outbox.mark_failed(&id, &rejected, Utc::now()).unwrap(),
      SubmissionState::DeadLetter
    );
    assert_eq!(outbox.dead_letters().unwrap().len(), 1);
  }

  #[test]
  fn test_ninth_failure_dead_letters_once() {
    let outbox = outbox();
    let id = outbox.enqueue(submission(1)).unwrap().id;
    let far_future = Utc::now() + Duration::days(1);

    let mut transitions = Vec::new();
    for _ in 0..9 {
      assert!(outbox.mark_in_flight(&id).unwrap());
      transitions.push(outbox.mark_failed(&id, &server_error(), Utc::now()).unwrap());
    }
    assert!(transitions[..8].iter().all(|s| *s == SubmissionState::Failed));
    assert_eq!(transitions[8], SubmissionState::DeadLetter);

    // Never picked up again
    assert!(!outbox.mark_in_flight(&id).unwrap());
    assert!(outbox.list_pending(far_future).unwrap().is_empty());
    assert!(outbox.list_retryable().unwrap().is_empty());
    let record = outbox.get(&id).unwrap().unwrap();
    assert_eq!(record.retry_count, 9);

    // A stray failure report does not transition it again
    assert_eq!(
      outbox.mark_failed(&id, &server_error(), Utc::now()).unwrap(),
      SubmissionState::DeadLetter
    );
    assert_eq!(outbox.get(&id).unwrap().unwrap().retry_count, 9);
  }

  #[test]
  fn test_release_keeps_retry_budget() {
    let outbox = outbox();
    let id = outbox.enqueue(submission(1)).unwrap().id;
    outbox.mark_in_flight(&id).unwrap();
    outbox
      .release(&id, &DeliveryError::NetworkUnavailable("offline".into()), Utc::now())
      .unwrap();

    let record = outbox.get(&id).unwrap().unwrap();
    assert_eq!(record.state, SubmissionState::Pending);
    assert_eq!(record.retry_count, 0);
    assert!(record.next_retry_at > Utc::now());
  }

  #[test]
  fn test_requeue_dead_letter() {
    let outbox = outbox();
    let id = outbox.enqueue(submission(1)).unwrap().id;
    outbox.mark_in_flight(&id).unwrap();
    outbox
      .mark_failed(
        &id,
        &DeliveryError::ServerRejected {
          status: 400,
          message: "bad".into(),
        },
        Utc::now(),
      )
      .unwrap();

    let record = outbox.requeue(&id).unwrap();
    assert_eq!(record.state, SubmissionState::Pending);
    assert_eq!(record.retry_count, 0);
    assert!(record.last_error.is_none());
    assert!(matches!(outbox.requeue(&id), Err(StoreError::NotFound(_))));
  }

  #[test]
  fn test_survives_restart_and_recovers_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");

    let (a, b) = {
      let outbox = Outbox::new(Arc::new(Database::open(&path, None).unwrap()), Backoff::default())
        .unwrap();
      let a = outbox.enqueue(submission(1)).unwrap().id;
      let b = outbox.enqueue(submission(2)).unwrap().id;
      outbox.mark_in_flight(&a).unwrap();
      (a, b)
    };

    let outbox =
      Outbox::new(Arc::new(Database::open(&path, None).unwrap()), Backoff::default()).unwrap();
    assert_eq!(outbox.stats().unwrap().in_flight, 1);
    assert_eq!(outbox.recover_in_flight().unwrap(), 1);

    let ids: Vec<String> = outbox
      .list_pending(Utc::now())
      .unwrap()
      .into_iter()
      .map(|r| r.id)
      .collect();
    assert_eq!(ids, vec![a, b]);
  }

  #[test]
  fn test_quota_exhaustion_surfaces_after_eviction() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let cache: Arc<dyn CacheStore> = Arc::new(SqliteCacheStore::new(db.clone()));
    let outbox = Outbox::new(db.clone(), Backoff::default())
      .unwrap()
      .with_cache_eviction(cache.clone());

    // Stale generation that can be sacrificed
    let url = url::Url::parse("https://collect.example.org/big.bin").unwrap();
    let big = CacheEntry {
      key: CacheKey::for_request(&Request::get(url), &[]),
      response: Response::new(200, vec![7u8; 256 * 1024]),
      generation: "old".into(),
      precached: true,
      stored_at: Utc::now(),
    };
    cache.put_generation("old", &[big]).unwrap();

    let used: i64 = {
      let conn = db.conn().unwrap();
      conn
        .pragma_query_value(None, "page_count", |row| row.get(0))
        .unwrap()
    };
    let page_size: i64 = {
      let conn = db.conn().unwrap();
      conn
        .pragma_query_value(None, "page_size", |row| row.get(0))
        .unwrap()
    };
    db.set_quota((used * page_size) as u64).unwrap();

    // The first record only fits once the old generation is gone
    let payload = json!({ "notes": "x".repeat(16 * 1024) });
    outbox
      .enqueue(NewSubmission::new("f", payload.clone()))
      .unwrap();
    assert!(cache.generations().unwrap().is_empty());

    // Keep writing until nothing is left to evict
    let mut saved = 1;
    let err = loop {
      match outbox.enqueue(NewSubmission::new("f", payload.clone())) {
        Ok(_) => saved += 1,
        Err(e) => break e,
      }
      assert!(saved < 10_000, "quota never reached");
    };
    assert!(matches!(err, StoreError::QuotaExceeded));
    assert_eq!(outbox.stats().unwrap().pending, saved);
  }

  #[test]
  fn test_receipts_are_pruned_past_limit() {
    let outbox = outbox().with_receipt_limit(3);
    let ids: Vec<String> = (0..5)
      .map(|n| {
        let id = outbox.enqueue(submission(n)).unwrap().id;
        outbox.mark_in_flight(&id).unwrap();
        outbox.mark_synced(&id, None).unwrap();
        id
      })
      .collect();

    assert_eq!(outbox.stats().unwrap().synced, 3);
    assert!(!outbox.is_synced(&ids[0]).unwrap());
    assert!(!outbox.is_synced(&ids[1]).unwrap());
    assert!(outbox.is_synced(&ids[4]).unwrap());
  }

  #[test]
  fn test_sync_keeps_draining_under_tight_quota() {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let outbox = Outbox::new(db.clone(), Backoff::default()).unwrap();

    let (used, page_size): (i64, i64) = {
      let conn = db.conn().unwrap();
      (
        conn
          .pragma_query_value(None, "page_count", |row| row.get(0))
          .unwrap(),
        conn
          .pragma_query_value(None, "page_size", |row| row.get(0))
          .unwrap(),
      )
    };
    db.set_quota(((used + 8) * page_size) as u64).unwrap();

    for n in 0..1_000 {
      let id = outbox.enqueue(submission(n)).unwrap().id;
      assert!(outbox.mark_in_flight(&id).unwrap());
      outbox.mark_synced(&id, Some("srv")).unwrap();
    }

    let stats = outbox.stats().unwrap();
    assert_eq!(stats.queued(), 0);
    assert!(stats.synced > 0);
  }
}
