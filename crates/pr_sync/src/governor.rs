use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::client::GithubClient;
use crate::metrics;

/// Caches the remaining core API budget and only asks the API for a fresh
/// value on the first query and every `refresh_every` queries after that.
pub struct RateLimitGovernor {
    client: Arc<dyn GithubClient>,
    refresh_every: u32,
    calls: u32,
    cached: i64,
}

impl RateLimitGovernor {
    pub fn new(client: Arc<dyn GithubClient>, refresh_every: u32) -> Self {
        Self {
            client,
            refresh_every: refresh_every.max(1),
            calls: 0,
            cached: 0,
        }
    }

    pub async fn remaining(&mut self) -> Result<i64> {
        if self.calls % self.refresh_every == 0 {
            self.cached = self.client.rate_limit_remaining().await?;
            metrics::RATE_LIMIT_REMAINING.set(self.cached);
            info!(remaining = self.cached, "rate limit refreshed");
        }
        self.calls = self.calls.wrapping_add(1);
        Ok(self.cached)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

    use async_trait::async_trait;
    use normalizer::{PullRequestPayload, ReviewPayload};

    use super::*;
    use crate::client::RepoSummary;

    #[derive(Default)]
    struct Countdown {
        probes: AtomicU32,
        remaining: AtomicI64,
    }

    #[async_trait]
    impl GithubClient for Countdown {
        async fn list_repos(&self, _: &str, _: u32, _: u32) -> Result<Vec<RepoSummary>> {
            unreachable!()
        }
        async fn list_pulls(&self, _: &str, _: &str, _: u32, _: u32) -> Result<Vec<PullRequestPayload>> {
            unreachable!()
        }
        async fn get_pull(&self, _: &str, _: &str, _: i64) -> Result<PullRequestPayload> {
            unreachable!()
        }
        async fn list_reviews(&self, _: &str, _: &str, _: i64, _: u32, _: u32) -> Result<Vec<ReviewPayload>> {
            unreachable!()
        }
        async fn rate_limit_remaining(&self) -> Result<i64> {
            self.probes.fetch_add(1, Ordering::SeqCst);
            Ok(self.remaining.fetch_sub(100, Ordering::SeqCst))
        }
    }

    #[tokio::test]
    async fn refreshes_on_first_and_every_nth_call() {
        let client = Arc::new(Countdown::default());
        client.remaining.store(5000, Ordering::SeqCst);
        let mut governor = RateLimitGovernor::new(client.clone(), 10);

        let mut seen = Vec::new();
        for _ in 0..21 {
            seen.push(governor.remaining().await.unwrap());
        }

        assert_eq!(client.probes.load(Ordering::SeqCst), 3);
        assert!(seen[..10].iter().all(|v| *v == 5000));
        assert!(seen[10..20].iter().all(|v| *v == 4900));
        assert_eq!(seen[20], 4800);
    }
}
