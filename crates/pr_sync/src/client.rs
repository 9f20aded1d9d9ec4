use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use gh_broker::{GithubBroker, HttpStatusError};
use http::{header, Request, StatusCode};
use normalizer::{PullRequestPayload, ReviewPayload};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

use crate::metrics;

#[derive(Debug, Error)]
pub enum GithubApiError {
    #[error("github api error: {status} for {endpoint}")]
    Http {
        status: StatusCode,
        endpoint: String,
    },
}

impl GithubApiError {
    pub fn status(status: StatusCode, endpoint: impl Into<String>) -> Self {
        Self::Http {
            status,
            endpoint: endpoint.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match *self {
            GithubApiError::Http { status, .. } => status,
        }
    }

    pub fn endpoint(&self) -> &str {
        match self {
            GithubApiError::Http { endpoint, .. } => endpoint.as_str(),
        }
    }
}

/// True when `err` is a GitHub 404.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<GithubApiError>()
        .map_or(false, |e| e.status_code() == StatusCode::NOT_FOUND)
}

#[derive(Debug, Clone, Deserialize)]
pub struct RepoSummary {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct RateLimitBody {
    resources: RateLimitResources,
}

#[derive(Debug, Deserialize)]
struct RateLimitResources {
    core: RateLimitResource,
}

#[derive(Debug, Deserialize)]
struct RateLimitResource {
    remaining: i64,
}

/// The slice of the GitHub REST API the sync walk needs. Listings are
/// page-addressed; `paginate` turns them into lazy streams.
#[async_trait]
pub trait GithubClient: Send + Sync {
    async fn list_repos(&self, owner: &str, page: u32, per_page: u32) -> Result<Vec<RepoSummary>>;

    /// Pull requests of every state, most recently updated first.
    async fn list_pulls(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<PullRequestPayload>>;

    async fn get_pull(&self, owner: &str, repo: &str, number: i64) -> Result<PullRequestPayload>;

    async fn list_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<ReviewPayload>>;

    async fn rate_limit_remaining(&self) -> Result<i64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OwnerKind {
    Org,
    User,
}

pub struct BrokerGithubClient {
    broker: Arc<dyn GithubBroker>,
    base: Url,
    user_agent: String,
    owner_kinds: Mutex<HashMap<String, OwnerKind>>,
}

impl BrokerGithubClient {
    pub fn new(broker: Arc<dyn GithubBroker>, user_agent: String, api_base: &str) -> Result<Self> {
        let mut base = Url::parse(api_base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            broker,
            base,
            user_agent,
            owner_kinds: Mutex::new(HashMap::new()),
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url, op: &'static str) -> Result<T> {
        let started = Instant::now();
        let result = self.fetch(url).await;
        metrics::FETCH_LATENCY_SECONDS
            .with_label_values(&[op])
            .observe(started.elapsed().as_secs_f64());
        let outcome = if result.is_ok() { "success" } else { "error" };
        metrics::FETCH_REQUESTS_TOTAL
            .with_label_values(&[op, outcome])
            .inc();
        result
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<T> {
        let endpoint = url.path().trim_start_matches('/').to_string();
        debug!(endpoint = %endpoint, url = %url, "Dispatching GitHub request");
        let response = match self.execute(url).await {
            Ok(resp) => resp,
            Err(err) => {
                if let Some(status_err) = err.downcast_ref::<HttpStatusError>() {
                    return Err(GithubApiError::status(status_err.status, endpoint).into());
                }
                return Err(err);
            }
        };
        let status = response.status();
        if status.is_success() {
            Ok(serde_json::from_slice(response.body())?)
        } else if status == StatusCode::NOT_MODIFIED {
            Err(anyhow!("received 304 without cached entity"))
        } else {
            Err(GithubApiError::status(status, endpoint).into())
        }
    }

    #[instrument(skip(self), fields(url = %url))]
    async fn execute(&self, url: Url) -> Result<http::Response<Vec<u8>>> {
        let uri: http::Uri = url.as_str().parse()?;
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .header(header::USER_AGENT, self.user_agent.clone())
            .header(header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
            .body(Vec::new())?;

        self.broker.send(request).await
    }

    fn join(&self, path: &str) -> Result<Url> {
        Ok(self.base.join(path)?)
    }

    fn with_query(url: &mut Url, params: &[(&str, String)]) {
        let mut query_pairs = url.query_pairs_mut();
        for (key, val) in params {
            query_pairs.append_pair(key, val);
        }
    }

    fn paged(&self, path: &str, page: u32, per_page: u32, extra: &[(&str, &str)]) -> Result<Url> {
        let mut url = self.join(path)?;
        let mut params: Vec<(&str, String)> = extra
            .iter()
            .map(|(key, val)| (*key, val.to_string()))
            .collect();
        params.push(("page", page.to_string()));
        params.push(("per_page", per_page.to_string()));
        Self::with_query(&mut url, &params);
        Ok(url)
    }

    fn owner_kind(&self, owner: &str) -> Option<OwnerKind> {
        self.owner_kinds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(owner)
            .copied()
    }

    fn remember_owner_kind(&self, owner: &str, kind: OwnerKind) {
        self.owner_kinds
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(owner.to_string(), kind);
    }
}

#[async_trait]
impl GithubClient for BrokerGithubClient {
    async fn list_repos(&self, owner: &str, page: u32, per_page: u32) -> Result<Vec<RepoSummary>> {
        if self.owner_kind(owner) != Some(OwnerKind::User) {
            let url = self.paged(&format!("orgs/{owner}/repos"), page, per_page, &[])?;
            match self.get_json(url, "repos").await {
                Ok(repos) => {
                    self.remember_owner_kind(owner, OwnerKind::Org);
                    return Ok(repos);
                }
                Err(err) if is_not_found(&err) => {
                    debug!(owner, "not an organization; listing user repositories");
                    self.remember_owner_kind(owner, OwnerKind::User);
                }
                Err(err) => return Err(err),
            }
        }
        let url = self.paged(&format!("users/{owner}/repos"), page, per_page, &[])?;
        self.get_json(url, "repos").await
    }

    async fn list_pulls(
        &self,
        owner: &str,
        repo: &str,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<PullRequestPayload>> {
        let url = self.paged(
            &format!("repos/{owner}/{repo}/pulls"),
            page,
            per_page,
            &[("state", "all"), ("sort", "updated"), ("direction", "desc")],
        )?;
        self.get_json(url, "pulls").await
    }

    async fn get_pull(&self, owner: &str, repo: &str, number: i64) -> Result<PullRequestPayload> {
        let url = self.join(&format!("repos/{owner}/{repo}/pulls/{number}"))?;
        self.get_json(url, "pull").await
    }

    async fn list_reviews(
        &self,
        owner: &str,
        repo: &str,
        number: i64,
        page: u32,
        per_page: u32,
    ) -> Result<Vec<ReviewPayload>> {
        let url = self.paged(
            &format!("repos/{owner}/{repo}/pulls/{number}/reviews"),
            page,
            per_page,
            &[],
        )?;
        self.get_json(url, "reviews").await
    }

    async fn rate_limit_remaining(&self) -> Result<i64> {
        let url = self.join("rate_limit")?;
        let body: RateLimitBody = self.get_json(url, "rate_limit").await?;
        Ok(body.resources.core.remaining)
    }
}
