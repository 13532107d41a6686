//! Durable queue of submissions waiting to reach the server.

mod backoff;
mod queue;
mod types;

pub use backoff::Backoff;
pub use queue::{Outbox, DEFAULT_RECEIPT_LIMIT};
pub use types::{NewSubmission, OutboxStats, QueuedSubmission, SubmissionState};
