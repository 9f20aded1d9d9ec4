use chrono::{DateTime, Utc};
use serde::Deserialize;

/// A pull request as returned by both the listing and the detail endpoints.
/// The listing omits `additions`/`deletions`, hence the defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestPayload {
    pub id: i64,
    pub number: i64,
    pub state: String,
    #[serde(default)]
    pub title: String,
    pub body: Option<String>,
    pub url: String,
    pub user: Option<UserRef>,
    #[serde(default)]
    pub additions: Option<i64>,
    #[serde(default)]
    pub deletions: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl PullRequestPayload {
    pub fn author_login(&self) -> Option<&str> {
        self.user.as_ref().map(|u| u.login.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReviewPayload {
    pub id: i64,
    pub user: Option<UserRef>,
    pub state: String,
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRef {
    #[serde(default)]
    pub id: i64,
    pub login: String,
}
