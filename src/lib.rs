//! Offline-first runtime for field data collection.
//!
//! Serves the app shell from a generation-tagged cache, routes intercepted
//! requests by kind, and holds submissions in a durable outbox until the
//! server acknowledges them.

pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod net;
pub mod notify;
pub mod outbox;
pub mod router;
pub mod runtime;
pub mod sync;
