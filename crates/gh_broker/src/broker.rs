use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::{header, HeaderValue, Request, Response, StatusCode};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::backoff::fixed_jitter_delay;
use crate::cache::{CachedResponse, ResponseCache};
use crate::error::HttpStatusError;
use crate::metrics;
use crate::model::{parse_rate_limit, parse_retry_after, GithubRequest};
use crate::token::{GithubToken, TokenPool, TokenSelection};

#[async_trait]
pub trait HttpExec: Send + Sync {
    async fn execute(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

pub struct ReqwestExecutor {
    client: reqwest::Client,
}

impl ReqwestExecutor {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(60))
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpExec for ReqwestExecutor {
    async fn execute(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let (parts, body) = req.into_parts();
        let resp = self
            .client
            .request(parts.method, parts.uri.to_string())
            .headers(parts.headers)
            .body(body)
            .send()
            .await?;
        let status = resp.status();
        let headers = resp.headers().clone();
        let bytes = resp.bytes().await?;
        let mut response = Response::new(bytes.to_vec());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Executes GitHub requests one at a time on behalf of the caller, choosing a
/// token, revalidating cached GETs and retrying transient failures.
#[async_trait]
pub trait GithubBroker: Send + Sync {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>>;
}

#[derive(Clone)]
pub struct GithubBrokerBuilder {
    tokens: Vec<GithubToken>,
    http_exec: Option<Arc<dyn HttpExec>>,
    user_agent: String,
    max_attempts: u32,
    retry_delay: Duration,
    jitter_frac: f32,
    cache_capacity: usize,
    cache_ttl: Duration,
    min_interval: Duration,
}

impl GithubBrokerBuilder {
    pub fn new(tokens: Vec<GithubToken>) -> Self {
        Self {
            tokens,
            http_exec: None,
            user_agent: "pr-sync".to_string(),
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            jitter_frac: 0.0,
            cache_capacity: 2048,
            cache_ttl: Duration::from_secs(600),
            min_interval: Duration::ZERO,
        }
    }

    pub fn http_exec(mut self, exec: Arc<dyn HttpExec>) -> Self {
        self.http_exec = Some(exec);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn retry(mut self, max_attempts: u32, delay: Duration, jitter: f32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.retry_delay = delay;
        self.jitter_frac = jitter;
        self
    }

    pub fn cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.cache_capacity = capacity;
        self.cache_ttl = ttl;
        self
    }

    /// Fixed pause before every request.
    pub fn min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn build(self) -> Result<Arc<dyn GithubBroker>> {
        if self.tokens.is_empty() {
            return Err(anyhow::anyhow!("no GitHub tokens configured"));
        }
        let exec = match self.http_exec {
            Some(exec) => exec,
            None => Arc::new(ReqwestExecutor::new(&self.user_agent)?),
        };

        Ok(Arc::new(LocalGithubBroker {
            http_exec: exec,
            token_pool: TokenPool::new(self.tokens),
            cache: ResponseCache::new(self.cache_capacity, self.cache_ttl),
            max_attempts: self.max_attempts,
            retry_delay: self.retry_delay,
            jitter: self.jitter_frac,
            min_interval: self.min_interval,
        }))
    }
}

pub struct LocalGithubBroker {
    http_exec: Arc<dyn HttpExec>,
    token_pool: TokenPool,
    cache: ResponseCache,
    max_attempts: u32,
    retry_delay: Duration,
    jitter: f32,
    min_interval: Duration,
}

#[async_trait]
impl GithubBroker for LocalGithubBroker {
    async fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
        let mut gh_req = GithubRequest::new(request)?;
        let cached = if gh_req.method() == http::Method::GET {
            self.cache.get(gh_req.key()).await
        } else {
            None
        };
        if let Some(entry) = &cached {
            gh_req
                .headers_mut()
                .insert(header::IF_NONE_MATCH, HeaderValue::from_str(&entry.etag)?);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.execute_once(&cached, gh_req.clone()).await {
                Ok(response) => return response.into_response(),
                Err(err) => {
                    let retry_allowed = err
                        .downcast_ref::<HttpStatusError>()
                        .map_or(true, HttpStatusError::is_retryable);
                    if !retry_allowed || attempt >= self.max_attempts {
                        return Err(err);
                    }

                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        request = %gh_req.key(),
                        error = %err,
                        "GitHub request attempt failed"
                    );
                    metrics::RETRIES_TOTAL.with_label_values(&["error"]).inc();
                    sleep(fixed_jitter_delay(self.retry_delay, self.jitter)).await;
                }
            }
        }
    }
}

impl LocalGithubBroker {
    async fn execute_once(
        &self,
        cached: &Option<CachedResponse>,
        mut request: GithubRequest,
    ) -> Result<BrokerResponse> {
        if !self.min_interval.is_zero() {
            sleep(self.min_interval).await;
        }

        let token = loop {
            match self.token_pool.pick_token().await {
                TokenSelection::Token(token) => break token,
                TokenSelection::Wait(wait) => {
                    warn!(
                        wait_seconds = wait.as_secs(),
                        "all tokens exhausted; waiting for rate limit reset"
                    );
                    metrics::SLEEP_SECONDS
                        .with_label_values(&["rate_limit"])
                        .inc_by(wait.as_secs());
                    sleep(wait + Duration::from_secs(1)).await;
                }
            }
        };

        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("token {}", token.secret))?,
        );

        let start = Instant::now();
        let resp = self.http_exec.execute(request.request()).await?;
        metrics::LATENCY.observe(start.elapsed().as_secs_f64());

        let status = resp.status();
        metrics::REQUESTS_TOTAL
            .with_label_values(&[&token.id, status_class(status)])
            .inc();
        debug!(request = %request.key(), status = %status, "GitHub responded");

        let headers = resp.headers().clone();
        if let Some(update) = parse_rate_limit(&headers) {
            metrics::RATE_REMAINING
                .with_label_values(&[&token.id])
                .set(update.remaining);
            self.token_pool.update(&token.id, update).await;
        } else if !request.is_rate_limit_probe() {
            self.token_pool.consume(&token.id, 1).await;
        }

        if status == StatusCode::NOT_MODIFIED {
            if let Some(entry) = cached {
                metrics::CACHE_HITS.inc();
                return Ok(BrokerResponse {
                    status: entry.status,
                    headers: entry.headers.clone(),
                    body: entry.body.clone(),
                });
            }
        }

        if status.is_success() {
            let response = BrokerResponse::from_http(resp);
            if request.method() == http::Method::GET {
                metrics::CACHE_MISSES.inc();
                if let Some(etag) = response.header("etag") {
                    let entry = CachedResponse {
                        etag: etag.to_string(),
                        status: response.status,
                        headers: response.headers.clone(),
                        body: response.body.clone(),
                        stored_at: Instant::now(),
                    };
                    self.cache.put(request.key().to_string(), entry).await;
                }
            }
            return Ok(response);
        }

        let request_id = headers
            .get("x-github-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-");

        if let Some(retry) = parse_retry_after(&headers) {
            warn!(
                status = %status,
                request = %request.key(),
                github_request_id = request_id,
                retry_after_seconds = retry.wait.as_secs(),
                "GitHub responded with retryable status"
            );
            metrics::SLEEP_SECONDS
                .with_label_values(&[retry.reason])
                .inc_by(retry.wait.as_secs());
            sleep(retry.wait).await;
        } else {
            warn!(
                status = %status,
                request = %request.key(),
                github_request_id = request_id,
                body_preview = %body_preview(resp.body()),
                "GitHub returned error response"
            );
        }

        Err(HttpStatusError::with_endpoint(status, request.uri().path()).into())
    }
}

#[derive(Clone, Debug)]
pub struct BrokerResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl BrokerResponse {
    pub fn from_http(resp: Response<Vec<u8>>) -> Self {
        let status = resp.status().as_u16();
        let headers = resp
            .headers()
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|val| (k.as_str().to_string(), val.to_string()))
            })
            .collect();
        Self {
            status,
            headers,
            body: resp.into_body(),
        }
    }

    pub fn into_response(self) -> Result<Response<Vec<u8>>> {
        let mut response = Response::new(self.body);
        *response.status_mut() = StatusCode::from_u16(self.status)?;
        for (key, value) in self.headers.iter() {
            if let (Ok(name), Ok(value)) = (
                header::HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().append(name, value);
            }
        }
        Ok(response)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

fn body_preview(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let mut truncated: String = text.chars().take(256).collect();
    if truncated.len() < text.len() {
        truncated.push('…');
    }
    truncated
}

fn status_class(status: StatusCode) -> &'static str {
    match status.as_u16() {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        _ => "5xx",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    struct ScriptedExec {
        responses: StdMutex<VecDeque<Result<Response<Vec<u8>>>>>,
        seen: StdMutex<Vec<Request<Vec<u8>>>>,
    }

    impl ScriptedExec {
        fn new(responses: Vec<Result<Response<Vec<u8>>>>) -> Arc<Self> {
            Arc::new(Self {
                responses: StdMutex::new(responses.into()),
                seen: StdMutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.seen.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl HttpExec for ScriptedExec {
        async fn execute(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>> {
            self.seen.lock().unwrap().push(req);
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(anyhow::anyhow!("script exhausted")))
        }
    }

    fn response(status: u16, body: &str, headers: &[(&str, &str)]) -> Result<Response<Vec<u8>>> {
        let mut builder = Response::builder().status(status);
        for (k, v) in headers {
            builder = builder.header(*k, *v);
        }
        Ok(builder.body(body.as_bytes().to_vec()).unwrap())
    }

    fn get(path: &str) -> Request<Vec<u8>> {
        Request::builder()
            .method("GET")
            .uri(format!("https://api.github.com{path}"))
            .header(header::USER_AGENT, "test-agent")
            .body(Vec::new())
            .unwrap()
    }

    fn broker(exec: Arc<ScriptedExec>) -> Arc<dyn GithubBroker> {
        GithubBrokerBuilder::new(vec![GithubToken {
            id: "t1".into(),
            secret: "s3cret".into(),
        }])
        .http_exec(exec)
        .retry(3, Duration::ZERO, 0.0)
        .build()
        .unwrap()
    }

    #[tokio::test]
    async fn retries_server_errors_then_succeeds() {
        let exec = ScriptedExec::new(vec![
            response(502, "bad gateway", &[]),
            Err(anyhow::anyhow!("connection reset")),
            response(200, "[]", &[]),
        ]);
        let broker = broker(exec.clone());
        let resp = broker.send(get("/repos/a/b/pulls")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(exec.calls(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let exec = ScriptedExec::new(vec![
            response(500, "", &[]),
            response(500, "", &[]),
            response(500, "", &[]),
            response(200, "[]", &[]),
        ]);
        let broker = broker(exec.clone());
        let err = broker.send(get("/repos/a/b/pulls")).await.unwrap_err();
        let status = err.downcast_ref::<HttpStatusError>().unwrap();
        assert_eq!(status.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(exec.calls(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_not_found() {
        let exec = ScriptedExec::new(vec![response(404, "{}", &[]), response(200, "{}", &[])]);
        let broker = broker(exec.clone());
        let err = broker.send(get("/orgs/nobody/repos")).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<HttpStatusError>().unwrap().status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(exec.calls(), 1);
    }

    #[tokio::test]
    async fn attaches_token_and_revalidates_with_etag() {
        let exec = ScriptedExec::new(vec![
            response(200, "[1]", &[("etag", "\"v1\"")]),
            response(304, "", &[]),
        ]);
        let broker = broker(exec.clone());

        let first = broker.send(get("/repos/a/b/pulls/1")).await.unwrap();
        assert_eq!(first.body(), b"[1]");
        let second = broker.send(get("/repos/a/b/pulls/1")).await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(second.body(), b"[1]");

        let seen = exec.seen.lock().unwrap();
        assert_eq!(
            seen[0].headers().get(header::AUTHORIZATION).unwrap(),
            "token s3cret"
        );
        assert!(seen[0].headers().get(header::IF_NONE_MATCH).is_none());
        assert_eq!(seen[1].headers().get(header::IF_NONE_MATCH).unwrap(), "\"v1\"");
    }

    #[test]
    fn body_preview_truncates() {
        let long = "x".repeat(300);
        let preview = body_preview(long.as_bytes());
        assert!(preview.ends_with('…'));
        assert_eq!(preview.chars().count(), 257);
    }
}
