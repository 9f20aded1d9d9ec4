pub mod models;
pub mod payloads;
pub mod transform;

pub use models::{PullRequestRecord, ReviewRecord};
pub use payloads::{PullRequestPayload, ReviewPayload, UserRef};
pub use transform::{format_timestamp, normalize_pull_request, normalize_review, rewrite_pull_url};
