use std::collections::HashSet;
use std::fmt;

use anyhow::{Context, Result};
use common::AppError;
use tracing::info;

use crate::client::GithubClient;
use crate::pager::collect_all;

const REPO_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Checkpoint key, `owner/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for RepoRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    Repo(RepoRef),
    Owner(String),
}

fn valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Parses `owner/repo`, `owner/*` and bare `owner` tokens separated by
/// commas.
pub fn parse_selectors(input: &str) -> Result<Vec<Selector>, AppError> {
    common::config::split_list(input)
        .into_iter()
        .map(|token| {
            let invalid = || AppError::InvalidSelector(token.clone());
            match token.split_once('/') {
                None if valid_segment(&token) => Ok(Selector::Owner(token.clone())),
                Some((owner, "*")) if valid_segment(owner) => Ok(Selector::Owner(owner.to_string())),
                Some((owner, repo)) if valid_segment(owner) && valid_segment(repo) => {
                    Ok(Selector::Repo(RepoRef::new(owner, repo)))
                }
                _ => Err(invalid()),
            }
        })
        .collect()
}

/// Expands selectors into an ordered, duplicate-free target list. Owner
/// wildcards list the owner's repositories in API order.
pub async fn resolve_targets(
    client: &dyn GithubClient,
    selectors: &[Selector],
) -> Result<Vec<RepoRef>> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    for selector in selectors {
        let expanded = match selector {
            Selector::Repo(repo) => vec![repo.clone()],
            Selector::Owner(owner) => {
                let repos = collect_all(REPO_PAGE_SIZE, move |page| {
                    client.list_repos(owner, page, REPO_PAGE_SIZE)
                })
                .await
                .with_context(|| format!("listing repositories of {owner}"))?;
                info!(owner = %owner, count = repos.len(), "expanded owner wildcard");
                repos
                    .into_iter()
                    .map(|repo| RepoRef::new(owner.clone(), repo.name))
                    .collect()
            }
        };
        for repo in expanded {
            if seen.insert(repo.clone()) {
                targets.push(repo);
            }
        }
    }
    Ok(targets)
}
