pub mod schema;

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::StoreResult;

/// Database connection shared by the cache store and the outbox.
///
/// Every mutation runs inside its own transaction while the lock is held, so a
/// reader never observes a half-applied write.
pub struct Database {
  conn: Mutex<Connection>,
}

impl Database {
  /// Open or create the database at `path`, optionally capped at `quota_bytes`.
  pub fn open(path: &Path, quota_bytes: Option<u64>) -> StoreResult<Self> {
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let conn = Connection::open(path)?;
    debug!(path = %path.display(), "opened database");
    Self::init(conn, quota_bytes)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> StoreResult<Self> {
    Self::init(Connection::open_in_memory()?, None)
  }

  fn init(conn: Connection, quota_bytes: Option<u64>) -> StoreResult<Self> {
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "FULL")?;

    let db = Self {
      conn: Mutex::new(conn),
    };
    db.run_migrations()?;
    if let Some(quota) = quota_bytes {
      db.set_quota(quota)?;
    }
    Ok(db)
  }

  /// Run database migrations
  fn run_migrations(&self) -> StoreResult<()> {
    self.conn()?.execute_batch(schema::SCHEMA)?;
    Ok(())
  }

  /// Cap the database size. Writes past the cap fail with `QuotaExceeded`.
  pub fn set_quota(&self, quota_bytes: u64) -> StoreResult<()> {
    let conn = self.conn()?;
    let page_size: i64 = conn.pragma_query_value(None, "page_size", |row| row.get(0))?;
    let max_pages = (quota_bytes as i64 / page_size).max(1);
    conn.pragma_update(None, "max_page_count", max_pages)?;
    debug!(quota_bytes, max_pages, "storage quota set");
    Ok(())
  }

  /// Lock the connection.
  pub fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
    Ok(self.conn.lock()?)
  }

  pub fn get_meta(&self, key: &str) -> StoreResult<Option<String>> {
    let conn = self.conn()?;
    let value = conn
      .query_row("SELECT value FROM meta WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  pub fn set_meta(&self, key: &str, value: &str) -> StoreResult<()> {
    self.conn()?.execute(
      "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
      params![key, value],
    )?;
    Ok(())
  }

  /// Stable identifier of this device, generated on first use.
  pub fn device_id(&self) -> StoreResult<String> {
    if let Some(id) = self.get_meta("device_id")? {
      return Ok(id);
    }
    let id = uuid::Uuid::new_v4().to_string();
    self.set_meta("device_id", &id)?;
    Ok(id)
  }
}
