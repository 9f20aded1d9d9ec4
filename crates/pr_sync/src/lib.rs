pub mod checkpoint;
pub mod client;
pub mod engine;
pub mod governor;
pub mod known;
pub mod metrics;
pub mod pager;
pub mod targets;

pub use checkpoint::{CheckpointError, CheckpointState, CheckpointStore, PartialWindow, RepoCheckpoint};
pub use client::{BrokerGithubClient, GithubApiError, GithubClient, RepoSummary};
pub use engine::{RepoOutcome, RepoStop, RunSummary, SyncEngine, SyncOptions};
pub use governor::RateLimitGovernor;
pub use known::{KnownSet, KnownSetError};
pub use targets::{parse_selectors, resolve_targets, RepoRef, Selector};
