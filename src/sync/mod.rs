mod api;
mod coordinator;

pub use api::{BulkItemResult, BulkResponse, HttpSubmissionApi, SubmissionApi};
pub use coordinator::{SyncCoordinator, SyncReport, SyncTrigger};
