use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::model::RateLimitUpdate;

#[derive(Debug, Clone)]
pub struct GithubToken {
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Clone)]
pub struct RateLimitState {
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl Default for RateLimitState {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitState {
    pub fn new() -> Self {
        Self {
            limit: 5000,
            remaining: 5000,
            reset_at: Utc::now(),
        }
    }

    pub fn update(&mut self, update: RateLimitUpdate) {
        self.limit = update.limit;
        self.remaining = update.remaining;
        self.reset_at = update.reset;
    }

    pub fn consume(&mut self, cost: i64) {
        self.remaining = (self.remaining - cost).max(0);
    }

    fn usable(&self, now: DateTime<Utc>) -> bool {
        self.remaining > 0 || self.reset_at <= now
    }
}

#[derive(Debug)]
struct TokenState {
    token: GithubToken,
    rate: RateLimitState,
}

pub enum TokenSelection {
    Token(GithubToken),
    Wait(Duration),
}

/// Tokens and their last known core rate-limit state.
#[derive(Clone)]
pub struct TokenPool {
    inner: Arc<Mutex<Vec<TokenState>>>,
}

impl TokenPool {
    pub fn new(tokens: Vec<GithubToken>) -> Self {
        let states = tokens
            .into_iter()
            .map(|token| TokenState {
                token,
                rate: RateLimitState::new(),
            })
            .collect();
        Self {
            inner: Arc::new(Mutex::new(states)),
        }
    }

    /// Picks the token with the largest remaining share of its limit, or
    /// reports how long until the earliest exhausted token resets.
    pub async fn pick_token(&self) -> TokenSelection {
        let guard = self.inner.lock().await;
        let now = Utc::now();
        let mut best: Option<(f64, &GithubToken)> = None;
        let mut next_reset: Option<Duration> = None;

        for state in guard.iter() {
            if state.rate.usable(now) {
                let score = state.rate.remaining as f64 / state.rate.limit.max(1) as f64;
                if best.map_or(true, |(best_score, _)| score > best_score) {
                    best = Some((score, &state.token));
                }
            } else {
                let wait = (state.rate.reset_at - now).to_std().unwrap_or_default();
                next_reset = Some(next_reset.map_or(wait, |existing| existing.min(wait)));
            }
        }

        match (best, next_reset) {
            (Some((_, token)), _) => TokenSelection::Token(token.clone()),
            (None, Some(wait)) => TokenSelection::Wait(wait),
            (None, None) => TokenSelection::Wait(Duration::from_secs(30)),
        }
    }

    pub async fn update(&self, token_id: &str, update: RateLimitUpdate) {
        let mut guard = self.inner.lock().await;
        if let Some(state) = guard.iter_mut().find(|s| s.token.id == token_id) {
            state.rate.update(update);
        }
    }

    pub async fn consume(&self, token_id: &str, amount: i64) {
        let mut guard = self.inner.lock().await;
        if let Some(state) = guard.iter_mut().find(|s| s.token.id == token_id) {
            state.rate.consume(amount);
        }
    }

    pub async fn snapshot(&self, token_id: &str) -> Option<RateLimitState> {
        let guard = self.inner.lock().await;
        guard
            .iter()
            .find(|s| s.token.id == token_id)
            .map(|s| s.rate.clone())
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
