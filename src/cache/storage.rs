//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{CacheEntry, CacheKey, GenerationInfo, GenerationState};
use crate::db::Database;
use crate::error::{StoreError, StoreResult};
use crate::net::Response;

/// Runtime entries dropped from the live generation per eviction round.
const EVICTION_CHUNK: i64 = 16;

/// Trait for cache storage backends.
pub trait CacheStore: Send + Sync {
  /// Get the entry stored under `key` in `generation`.
  fn get(&self, generation: &str, key: &CacheKey) -> StoreResult<Option<CacheEntry>>;

  /// Store a single entry, committed before return.
  fn put(&self, entry: &CacheEntry) -> StoreResult<()>;

  /// Store a whole generation in one transaction and mark it waiting.
  /// Nothing is written if any entry fails.
  fn put_generation(&self, tag: &str, entries: &[CacheEntry]) -> StoreResult<()>;

  /// Tag of the live generation, if one has been activated.
  fn live_generation(&self) -> StoreResult<Option<String>>;

  /// Make `tag` live and delete every other generation. Returns the purged tags.
  fn activate(&self, tag: &str) -> StoreResult<Vec<String>>;

  /// All known generations, oldest first.
  fn generations(&self) -> StoreResult<Vec<GenerationInfo>>;

  /// Free space: drop the oldest non-live generation, or failing that the
  /// oldest runtime entries of the live one. Returns false if nothing was freed.
  fn evict_oldest(&self) -> StoreResult<bool>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStore {
  db: Arc<Database>,
}

impl SqliteCacheStore {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }

  fn write_entry(conn: &Connection, entry: &CacheEntry) -> StoreResult<()> {
    let headers = serde_json::to_string(&entry.response.headers)?;
    conn.execute(
      "INSERT OR REPLACE INTO cache_entries
         (generation, cache_key, method, url, status, headers, body, precached, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
      params![
        entry.generation,
        entry.key.hash,
        entry.key.method,
        entry.key.url,
        entry.response.status,
        headers,
        entry.response.body,
        entry.precached,
        entry.stored_at.timestamp_millis(),
      ],
    )?;
    Ok(())
  }

  fn try_put(&self, entry: &CacheEntry) -> StoreResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    // The generation may have been purged since the caller picked it
    let known: Option<i64> = tx
      .query_row(
        "SELECT 1 FROM cache_generations WHERE tag = ?",
        params![entry.generation],
        |row| row.get(0),
      )
      .optional()?;
    if known.is_none() {
      debug!(generation = %entry.generation, url = %entry.key.url, "generation gone, skipping cache write");
      return Ok(());
    }

    Self::write_entry(&tx, entry)?;
    tx.commit()?;
    Ok(())
  }

  fn try_put_generation(&self, tag: &str, entries: &[CacheEntry]) -> StoreResult<()> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let current: Option<String> = tx
      .query_row(
        "SELECT state FROM cache_generations WHERE tag = ?",
        params![tag],
        |row| row.get(0),
      )
      .optional()?;

    // Reinstalling the live tag refreshes it in place and keeps it live
    let state = match current.as_deref().and_then(GenerationState::parse) {
      Some(GenerationState::Live) => GenerationState::Live,
      _ => {
        tx.execute(
          "DELETE FROM cache_entries WHERE generation = ?",
          params![tag],
        )?;
        GenerationState::Waiting
      }
    };

    tx.execute(
      "INSERT OR REPLACE INTO cache_generations (tag, state, created_at) VALUES (?, ?, ?)",
      params![tag, state.as_str(), Utc::now().timestamp_millis()],
    )?;

    for entry in entries {
      Self::write_entry(&tx, entry)?;
    }

    tx.commit()?;
    Ok(())
  }
}

impl CacheStore for SqliteCacheStore {
  fn get(&self, generation: &str, key: &CacheKey) -> StoreResult<Option<CacheEntry>> {
    let conn = self.db.conn()?;

    let row: Option<(String, String, u16, String, Vec<u8>, bool, i64)> = conn
      .query_row(
        "SELECT method, url, status, headers, body, precached, stored_at FROM cache_entries
         WHERE generation = ? AND cache_key = ?",
        params![generation, key.hash],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
            row.get(5)?,
            row.get(6)?,
          ))
        },
      )
      .optional()?;

    let Some((method, url, status, headers, body, precached, stored_at)) = row else {
      return Ok(None);
    };

    Ok(Some(CacheEntry {
      key: CacheKey {
        hash: key.hash.clone(),
        method,
        url,
      },
      response: Response {
        status,
        headers: serde_json::from_str(&headers)?,
        body,
      },
      generation: generation.to_string(),
      precached,
      stored_at: from_millis(stored_at),
    }))
  }

  fn put(&self, entry: &CacheEntry) -> StoreResult<()> {
    match self.try_put(entry) {
      Err(StoreError::QuotaExceeded) => {
        warn!(url = %entry.key.url, "cache write hit storage quota, evicting");
        if self.evict_oldest()? {
          self.try_put(entry)
        } else {
          Err(StoreError::QuotaExceeded)
        }
      }
      other => other,
    }
  }

  fn put_generation(&self, tag: &str, entries: &[CacheEntry]) -> StoreResult<()> {
    match self.try_put_generation(tag, entries) {
      Err(StoreError::QuotaExceeded) => {
        warn!(generation = tag, "precache hit storage quota, evicting");
        if self.evict_oldest()? {
          self.try_put_generation(tag, entries)
        } else {
          Err(StoreError::QuotaExceeded)
        }
      }
      other => other,
    }
  }

  fn live_generation(&self) -> StoreResult<Option<String>> {
    let conn = self.db.conn()?;
    let tag = conn
      .query_row(
        "SELECT tag FROM cache_generations WHERE state = ?",
        params![GenerationState::Live.as_str()],
        |row| row.get(0),
      )
      .optional()?;
    Ok(tag)
  }

  fn activate(&self, tag: &str) -> StoreResult<Vec<String>> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let exists: Option<String> = tx
      .query_row(
        "SELECT state FROM cache_generations WHERE tag = ?",
        params![tag],
        |row| row.get(0),
      )
      .optional()?;
    if exists.is_none() {
      return Err(StoreError::NotFound(tag.to_string()));
    }

    let purged: Vec<String> = {
      let mut stmt = tx.prepare("SELECT tag FROM cache_generations WHERE tag != ?")?;
      let tags = stmt
        .query_map(params![tag], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
      tags
    };

    tx.execute(
      "DELETE FROM cache_entries WHERE generation != ?",
      params![tag],
    )?;
    tx.execute(
      "DELETE FROM cache_generations WHERE tag != ?",
      params![tag],
    )?;
    tx.execute(
      "UPDATE cache_generations SET state = ? WHERE tag = ?",
      params![GenerationState::Live.as_str(), tag],
    )?;
    tx.commit()?;

    info!(generation = tag, purged = ?purged, "cache generation activated");
    Ok(purged)
  }

  fn generations(&self) -> StoreResult<Vec<GenerationInfo>> {
    let conn = self.db.conn()?;
    let mut stmt = conn.prepare(
      "SELECT g.tag, g.state, g.created_at,
              (SELECT COUNT(*) FROM cache_entries e WHERE e.generation = g.tag)
       FROM cache_generations g
       ORDER BY g.created_at, g.tag",
    )?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
          row.get::<_, i64>(3)?,
        ))
      })?
      .collect::<Result<Vec<_>, _>>()?;

    Ok(
      rows
        .into_iter()
        .filter_map(|(tag, state, created_at, entries)| {
          Some(GenerationInfo {
            tag,
            state: GenerationState::parse(&state)?,
            created_at: from_millis(created_at),
            entries: entries as usize,
          })
        })
        .collect(),
    )
  }

  fn evict_oldest(&self) -> StoreResult<bool> {
    let mut conn = self.db.conn()?;
    let tx = conn.transaction()?;

    let oldest: Option<String> = tx
      .query_row(
        "SELECT tag FROM cache_generations WHERE state != ? ORDER BY created_at LIMIT 1",
        params![GenerationState::Live.as_str()],
        |row| row.get(0),
      )
      .optional()?;

    let freed = if let Some(tag) = oldest {
      tx.execute(
        "DELETE FROM cache_entries WHERE generation = ?",
        params![tag],
      )?;
      tx.execute("DELETE FROM cache_generations WHERE tag = ?", params![tag])?;
      info!(generation = %tag, "evicted cache generation");
      true
    } else {
      let removed = tx.execute(
        "DELETE FROM cache_entries WHERE rowid IN (
           SELECT rowid FROM cache_entries WHERE precached = 0
           ORDER BY stored_at LIMIT ?)",
        params![EVICTION_CHUNK],
      )?;
      debug!(removed, "evicted runtime cache entries");
      removed > 0
    };

    tx.commit()?;
    Ok(freed)
  }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
  DateTime::from_timestamp_millis(ms).unwrap_or_default()
}
