use chrono::{DateTime, Utc};
use http::{header, HeaderMap, Request};
use std::time::Duration;

/// A request bound for the GitHub REST API, plus the cache key derived from
/// its method, path and query.
#[derive(Debug)]
pub struct GithubRequest {
    inner: Request<Vec<u8>>,
    key: String,
}

impl Clone for GithubRequest {
    fn clone(&self) -> Self {
        let mut builder = Request::builder()
            .method(self.inner.method().clone())
            .uri(self.inner.uri().clone())
            .version(self.inner.version());

        if let Some(headers) = builder.headers_mut() {
            headers.extend(
                self.inner
                    .headers()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone())),
            );
        }

        // Every part is copied from an already valid request.
        let inner = builder
            .body(self.inner.body().clone())
            .unwrap_or_else(|_| Request::new(Vec::new()));

        Self {
            inner,
            key: self.key.clone(),
        }
    }
}

impl GithubRequest {
    pub fn new(inner: Request<Vec<u8>>) -> anyhow::Result<Self> {
        if !inner.headers().contains_key(header::USER_AGENT) {
            return Err(anyhow::anyhow!("user-agent header required"));
        }

        let key = format!(
            "{} {}{}",
            inner.method(),
            inner.uri().path(),
            inner
                .uri()
                .query()
                .map(|q| format!("?{}", q))
                .unwrap_or_default()
        );

        Ok(Self { inner, key })
    }

    pub fn request(&self) -> Request<Vec<u8>> {
        self.clone().inner
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    pub fn method(&self) -> &http::Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &http::Uri {
        self.inner.uri()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// `GET /rate_limit` is free on GitHub and must not be charged to a token.
    pub fn is_rate_limit_probe(&self) -> bool {
        self.inner.uri().path().trim_end_matches('/').ends_with("/rate_limit")
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitUpdate {
    pub limit: i64,
    pub remaining: i64,
    pub reset: DateTime<Utc>,
}

pub fn parse_rate_limit(headers: &HeaderMap) -> Option<RateLimitUpdate> {
    let number = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<i64>().ok())
    };
    let limit = number("x-ratelimit-limit")?;
    let remaining = number("x-ratelimit-remaining")?;
    let reset = DateTime::from_timestamp(number("x-ratelimit-reset")?, 0)?;
    Some(RateLimitUpdate {
        limit,
        remaining,
        reset,
    })
}

#[derive(Debug, Clone)]
pub struct RetryAdvice {
    pub wait: Duration,
    pub reason: &'static str,
}

pub fn parse_retry_after(headers: &HeaderMap) -> Option<RetryAdvice> {
    let value = headers.get(header::RETRY_AFTER)?.to_str().ok()?;
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(RetryAdvice {
            wait: Duration::from_secs(seconds),
            reason: "retry_after",
        });
    }
    let date = httpdate::parse_http_date(value).ok()?;
    let wait = date.duration_since(std::time::SystemTime::now()).ok()?;
    Some(RetryAdvice {
        wait,
        reason: "retry_after_date",
    })
}
