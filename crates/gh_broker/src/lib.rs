pub mod backoff;
pub mod broker;
pub mod cache;
pub mod error;
pub mod metrics;
pub mod model;
pub mod token;

pub use broker::{GithubBroker, GithubBrokerBuilder, HttpExec, ReqwestExecutor};
pub use error::HttpStatusError;
pub use model::GithubRequest;
pub use token::{GithubToken, RateLimitState};
