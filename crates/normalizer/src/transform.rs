use chrono::{DateTime, SecondsFormat, Utc};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::models::{PullRequestRecord, ReviewRecord};
use crate::payloads::{PullRequestPayload, ReviewPayload};

static API_PULL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?)://api\.([^/]+)/repos/([^/]+)/([^/]+)/pulls/([0-9]+)$")
        .expect("invalid regex")
});

static ENTERPRISE_PULL_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(https?://[^/]+)/api/v3/repos/([^/]+)/([^/]+)/pulls/([0-9]+)$")
        .expect("invalid regex")
});

/// ISO-8601 in UTC with an explicit `Z` marker.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// Rewrites an API pull request URL to the page a person would open:
/// `https://api.github.com/repos/o/r/pulls/7` → `https://github.com/o/r/pull/7`.
/// Anything else is returned unchanged.
pub fn rewrite_pull_url(url: &str) -> String {
    if let Some(caps) = API_PULL_URL.captures(url) {
        return format!(
            "{}://{}/{}/{}/pull/{}",
            &caps[1], &caps[2], &caps[3], &caps[4], &caps[5]
        );
    }
    if let Some(caps) = ENTERPRISE_PULL_URL.captures(url) {
        return format!("{}/{}/{}/pull/{}", &caps[1], &caps[2], &caps[3], &caps[4]);
    }
    url.to_string()
}

pub fn normalize_review(payload: &ReviewPayload) -> ReviewRecord {
    ReviewRecord {
        user: payload.user.as_ref().map(|u| u.login.clone()),
        state: payload.state.clone(),
        submitted_at: payload.submitted_at.map(format_timestamp),
    }
}

pub fn normalize_pull_request(
    owner: &str,
    repo: &str,
    payload: &PullRequestPayload,
    reviews: Vec<ReviewRecord>,
    recorded_at: DateTime<Utc>,
) -> PullRequestRecord {
    PullRequestRecord {
        id: payload.id,
        record_timestamp: format_timestamp(recorded_at),
        additions: payload.additions,
        deletions: payload.deletions,
        author: payload.author_login().map(str::to_string),
        state: payload.state.clone(),
        created_at: format_timestamp(payload.created_at),
        updated_at: format_timestamp(payload.updated_at),
        closed_at: payload.closed_at.map(format_timestamp),
        title: payload.title.clone(),
        url: rewrite_pull_url(&payload.url),
        body: payload.body.clone(),
        reviews,
        repo: repo.to_string(),
        owner: owner.to_string(),
    }
}
