/// Schema for the worker database. Timestamps are unix milliseconds.
pub const SCHEMA: &str = r#"
-- Runtime-wide settings (live generation, device id)
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Cache generations and their lifecycle state
CREATE TABLE IF NOT EXISTS cache_generations (
    tag TEXT PRIMARY KEY,
    state TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Cached responses, one namespace per generation
CREATE TABLE IF NOT EXISTS cache_entries (
    generation TEXT NOT NULL,
    cache_key TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    precached INTEGER NOT NULL DEFAULT 0,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (generation, cache_key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_stored
    ON cache_entries(generation, precached, stored_at);

-- Outbox of submissions awaiting acknowledgment (seq preserves creation order)
CREATE TABLE IF NOT EXISTS outbox (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    form_id TEXT NOT NULL,
    form_version TEXT,
    payload TEXT NOT NULL,
    device_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    state TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0,
    next_retry_at INTEGER NOT NULL,
    last_error TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_state ON outbox(state, next_retry_at);

-- Acknowledged submissions
CREATE TABLE IF NOT EXISTS sync_receipts (
    id TEXT PRIMARY KEY,
    server_id TEXT,
    synced_at INTEGER NOT NULL
);
"#;
