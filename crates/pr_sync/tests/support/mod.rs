#![allow(dead_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use normalizer::{PullRequestPayload, PullRequestRecord, ReviewPayload, UserRef};
use pr_sync::{
    CheckpointState, CheckpointStore, GithubClient, RepoSummary, SyncEngine, SyncOptions,
};
use sink::{RecordSink, SinkError};

/// `n` minutes past a fixed instant.
pub fn t(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap() + Duration::minutes(n)
}

pub fn pull(id: i64, number: i64, updated_at: DateTime<Utc>, author: Option<&str>) -> PullRequestPayload {
    PullRequestPayload {
        id,
        number,
        state: "open".into(),
        title: format!("PR #{number}"),
        body: None,
        url: format!("https://api.github.com/repos/acme/repo/pulls/{number}"),
        user: author.map(|login| UserRef {
            id: 1,
            login: login.into(),
        }),
        additions: None,
        deletions: None,
        created_at: t(0),
        updated_at,
        closed_at: None,
    }
}

/// Pull requests `1..=count` of a repository, the highest number updated
/// most recently at minute `count`.
pub fn pulls(repo_id: i64, count: i64) -> Vec<PullRequestPayload> {
    (1..=count)
        .map(|n| pull(repo_id * 100_000 + n, n, t(n), Some("alice")))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    ListRepos { owner: String, page: u32 },
    ListPulls { repo: String, page: u32, per_page: u32 },
    GetPull { repo: String, number: i64 },
    ListReviews { repo: String, number: i64 },
    RateLimit,
}

impl Call {
    pub fn repo(&self) -> Option<&str> {
        match self {
            Call::ListPulls { repo, .. }
            | Call::GetPull { repo, .. }
            | Call::ListReviews { repo, .. } => Some(repo),
            _ => None,
        }
    }
}

/// In-memory GitHub. Every detail fetch costs one unit of rate-limit budget.
pub struct FakeGithub {
    repos: HashMap<String, Vec<String>>,
    pulls: HashMap<String, Vec<PullRequestPayload>>,
    reviews: HashMap<(String, i64), Vec<ReviewPayload>>,
    budget: AtomicI64,
    calls: Mutex<Vec<Call>>,
}

impl Default for FakeGithub {
    fn default() -> Self {
        Self {
            repos: HashMap::new(),
            pulls: HashMap::new(),
            reviews: HashMap::new(),
            budget: AtomicI64::new(5000),
            calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeGithub {
    pub fn with_repo(mut self, owner: &str, name: &str, mut pulls: Vec<PullRequestPayload>) -> Self {
        pulls.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        self.repos
            .entry(owner.to_string())
            .or_default()
            .push(name.to_string());
        self.pulls.insert(format!("{owner}/{name}"), pulls);
        self
    }

    pub fn with_reviews(mut self, repo: &str, number: i64, reviews: Vec<ReviewPayload>) -> Self {
        self.reviews.insert((repo.to_string(), number), reviews);
        self
    }

    pub fn set_budget(&self, remaining: i64) {
        self.budget.store(remaining, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn touched(&self, repo: &str) -> bool {
        self.calls().iter().any(|call| call.repo() == Some(repo))
    }

    /// Listing pages fetched by the walk itself, excluding the newest-item probe.
    pub fn walk_pages(&self, repo: &str) -> Vec<u32> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::ListPulls { repo: r, page, per_page } if r == repo && per_page > 1 => {
                    Some(page)
                }
                _ => None,
            })
            .collect()
    }

    pub fn detail_fetches(&self, repo: &str) -> Vec<i64> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::GetPull { repo: r, number } if r == repo => Some(number),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

fn page_of<T: Clone>(items: &[T], page: u32, per_page: u32) -> Vec<T> {
    let start = ((page - 1) * per_page) as usize;
    items
        .iter()
        .skip(start)
        .take(per_page as usize)
        .cloned()
        .collect()
}

#[async_trait]
impl GithubClient for FakeGithub {
    async fn list_repos(&self, owner: &str, page: u32, per_page: u32) -> Result<Vec<RepoSummary>> {
        self.record(Call::ListRepos {
            owner: owner.to_string(),
            page,
        });
        let names = self.repos.get(owner).cloned().unwrap_or_default();
        Ok(page_of(&names, page, per_page)
            .into_iter()
            .map(|name| RepoSummary { name })
            .collect())
    }

    async fn list_pulls(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<PullRequestPayload>> {
        let key = format!("{owner}/{repo}");
        self.record(Call::ListPulls {
            repo: key.clone(),
            page,
            per_page,
        });
        let pulls = self
            .pulls
            .get(&key)
            .ok_or_else(|| anyhow!("no such repository {key}"))?;
        Ok(page_of(pulls, page, per_page))
    }

    async fn get_pull(&self, owner: &str, repo: &str, number: i64) -> Result<PullRequestPayload> {
        let key = format!("{owner}/{repo}");
        self.record(Call::GetPull {
            repo: key.clone(),
            number,
        });
        self.budget.fetch_sub(1, Ordering::SeqCst);
        let mut detail = self
            .pulls
            .get(&key)
            .and_then(|pulls| pulls.iter().find(|p| p.number == number))
            .cloned()
            .ok_or_else(|| anyhow!("no pull request {key}#{number}"))?;
        detail.additions = Some(number * 10);
        detail.deletions = Some(number);
        Ok(detail)
    }

    async fn list_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<ReviewPayload>> {
        let key = format!("{owner}/{repo}");
        self.record(Call::ListReviews {
            repo: key.clone(),
            number,
        });
        let reviews = self.reviews.get(&(key, number)).cloned().unwrap_or_default();
        Ok(page_of(&reviews, page, per_page))
    }

    async fn rate_limit_remaining(&self) -> Result<i64> {
        self.record(Call::RateLimit);
        Ok(self.budget.load(Ordering::SeqCst))
    }
}

/// Keeps every uploaded batch and the checkpoint file as it looked when
/// each upload arrived.
pub struct RecordingSink {
    state_path: PathBuf,
    uploads: Mutex<Vec<Vec<PullRequestRecord>>>,
    checkpoints_seen: Mutex<Vec<Option<CheckpointState>>>,
    fail: AtomicBool,
}

impl RecordingSink {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            uploads: Mutex::new(Vec::new()),
            checkpoints_seen: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn uploads(&self) -> Vec<Vec<PullRequestRecord>> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.uploads().iter().map(Vec::len).collect()
    }

    pub fn records(&self) -> Vec<PullRequestRecord> {
        self.uploads().into_iter().flatten().collect()
    }

    pub fn checkpoints_seen(&self) -> Vec<Option<CheckpointState>> {
        self.checkpoints_seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordSink for RecordingSink {
    async fn upload(&self, batch: &[PullRequestRecord]) -> Result<(), SinkError> {
        let snapshot = std::fs::read_to_string(&self.state_path)
            .ok()
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?;
        self.checkpoints_seen.lock().unwrap().push(snapshot);
        if self.fail.load(Ordering::SeqCst) {
            return Err(SinkError::Status {
                status: 503,
                body: "unavailable".into(),
            });
        }
        self.uploads.lock().unwrap().push(batch.to_vec());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "recording"
    }
}

pub fn options(batch_size: usize, page_size: u32) -> SyncOptions {
    SyncOptions {
        batch_size,
        page_size,
        min_remaining: 500,
        rate_limit_refresh_every: 1,
        excluded_users: ["dependabot".to_string()].into_iter().collect(),
    }
}

pub fn engine(
    github: &Arc<FakeGithub>,
    sink: &Arc<RecordingSink>,
    state_path: &std::path::Path,
    options: SyncOptions,
) -> SyncEngine {
    SyncEngine::new(
        github.clone(),
        sink.clone(),
        CheckpointStore::new(state_path),
        options,
    )
}

pub async fn load_state(state_path: &std::path::Path) -> CheckpointState {
    CheckpointStore::new(state_path).load().await.unwrap()
}
