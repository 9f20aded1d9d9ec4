use serde::{Deserialize, Serialize};

/// The canonical output unit handed to every sink. Timestamps are ISO-8601
/// strings with a trailing `Z`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestRecord {
    pub id: i64,
    pub record_timestamp: String,
    pub additions: Option<i64>,
    pub deletions: Option<i64>,
    pub author: Option<String>,
    pub state: String,
    pub created_at: String,
    pub updated_at: String,
    pub closed_at: Option<String>,
    pub title: String,
    pub url: String,
    pub body: Option<String>,
    pub reviews: Vec<ReviewRecord>,
    pub repo: String,
    pub owner: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewRecord {
    pub user: Option<String>,
    pub state: String,
    pub submitted_at: Option<String>,
}
