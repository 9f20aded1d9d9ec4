use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use common::config::SyncConfig;
use futures::TryStreamExt;
use normalizer::{normalize_pull_request, normalize_review, PullRequestRecord};
use sink::RecordSink;
use tracing::{info, instrument, warn};

use crate::checkpoint::{CheckpointState, CheckpointStore, PartialWindow, RepoCheckpoint};
use crate::client::GithubClient;
use crate::governor::RateLimitGovernor;
use crate::known::KnownSet;
use crate::metrics;
use crate::pager::{collect_all, paginate};
use crate::targets::RepoRef;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub page_size: u32,
    pub min_remaining: i64,
    pub rate_limit_refresh_every: u32,
    pub excluded_users: HashSet<String>,
}

impl SyncOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            page_size: config.page_size.clamp(1, 100),
            min_remaining: config.min_remaining,
            rate_limit_refresh_every: config.rate_limit_refresh_every,
            excluded_users: config.excluded_users().into_iter().collect(),
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Why the walk of one repository ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoStop {
    /// The newest pull request is not newer than the watermark.
    UpToDate,
    /// Hit an item at or below the watermark.
    Watermark,
    /// Ran off the end of the listing.
    Exhausted,
    /// Remaining API budget fell below the threshold.
    Budget { remaining: i64 },
}

impl RepoStop {
    fn as_str(&self) -> &'static str {
        match self {
            RepoStop::UpToDate => "up_to_date",
            RepoStop::Watermark => "watermark",
            RepoStop::Exhausted => "exhausted",
            RepoStop::Budget { .. } => "budget",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOutcome {
    pub repo: RepoRef,
    pub emitted: usize,
    pub skipped_known: usize,
    pub skipped_excluded: usize,
    pub skipped_delivered: usize,
    pub skipped_duplicate: usize,
    pub stop: RepoStop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub repos: Vec<RepoOutcome>,
    pub batches_flushed: usize,
    /// Set when the walk ended early on a low budget.
    pub budget_stop: Option<(RepoRef, i64)>,
}

impl RunSummary {
    pub fn records_emitted(&self) -> usize {
        self.repos.iter().map(|r| r.emitted).sum()
    }
}

/// Bookkeeping for the repository currently being walked.
struct RepoWalk {
    key: String,
    prior: RepoCheckpoint,
    latest: Option<DateTime<Utc>>,
    newest_seen: Option<DateTime<Utc>>,
    through: Option<DateTime<Utc>>,
    seen: HashSet<i64>,
}

impl RepoWalk {
    fn new(key: String, prior: RepoCheckpoint, latest: Option<DateTime<Utc>>) -> Self {
        Self {
            key,
            prior,
            latest,
            newest_seen: None,
            through: None,
            seen: HashSet::new(),
        }
    }

    /// False when the listing already yielded this id during the walk, as
    /// happens when an update shifts items across page boundaries.
    fn first_sighting(&mut self, id: i64) -> bool {
        self.seen.insert(id)
    }

    fn up_to_date(&self) -> bool {
        match (self.prior.updated_at, self.latest) {
            (Some(watermark), Some(latest)) => latest <= watermark && self.prior.partial.is_none(),
            _ => false,
        }
    }

    fn below_watermark(&self, updated_at: DateTime<Utc>) -> bool {
        self.prior.updated_at.is_some_and(|w| updated_at <= w)
    }

    fn already_delivered(&self, updated_at: DateTime<Utc>) -> bool {
        self.prior.partial.is_some_and(|p| p.covers(updated_at))
    }

    fn observe(&mut self, updated_at: DateTime<Utc>) {
        self.newest_seen = self.newest_seen.max(Some(updated_at));
    }

    fn handled(&mut self, updated_at: DateTime<Utc>) {
        self.through = Some(updated_at);
    }

    /// Entry for a walk that has not finished: the watermark stays put and
    /// the handled range is recorded as a partial window, merged with any
    /// window left by an earlier interrupted run when the two touch.
    fn in_progress(&self) -> RepoCheckpoint {
        let partial = match (self.through, self.latest.max(self.newest_seen)) {
            (Some(through), Some(top)) => match self.prior.partial {
                Some(old) if through > old.latest => Some(old),
                Some(old) => Some(PartialWindow {
                    latest: top.max(old.latest),
                    through: through.min(old.through),
                }),
                None => Some(PartialWindow { latest: top, through }),
            },
            _ => self.prior.partial,
        };
        RepoCheckpoint {
            updated_at: self.prior.updated_at,
            partial,
        }
    }

    fn completed(&self) -> RepoCheckpoint {
        RepoCheckpoint {
            updated_at: self.prior.updated_at.max(self.latest).max(self.newest_seen),
            partial: None,
        }
    }
}

/// Walks repositories newest-first, hands normalized pull requests to the
/// sink in batches and checkpoints after every batch.
pub struct SyncEngine {
    client: Arc<dyn GithubClient>,
    sink: Arc<dyn RecordSink>,
    store: CheckpointStore,
    governor: RateLimitGovernor,
    known: KnownSet,
    options: SyncOptions,
}

impl SyncEngine {
    pub fn new(
        client: Arc<dyn GithubClient>,
        sink: Arc<dyn RecordSink>,
        store: CheckpointStore,
        options: SyncOptions,
    ) -> Self {
        let governor = RateLimitGovernor::new(client.clone(), options.rate_limit_refresh_every);
        Self {
            client,
            sink,
            store,
            governor,
            known: KnownSet::default(),
            options,
        }
    }

    pub fn with_known_set(mut self, known: KnownSet) -> Self {
        self.known = known;
        self
    }

    #[instrument(skip_all, fields(targets = targets.len(), sink = self.sink.name()))]
    pub async fn run(&mut self, targets: &[RepoRef]) -> Result<RunSummary> {
        metrics::RUNS_TOTAL.inc();
        metrics::LAST_RUN_TIMESTAMP.set(Utc::now().timestamp());
        let _timer = metrics::RUN_DURATION.start_timer();

        let mut state = self
            .store
            .load()
            .await
            .context("loading checkpoint state")?;
        info!(
            path = %self.store.path().display(),
            repos = state.len(),
            "loaded checkpoint state"
        );

        let mut summary = RunSummary::default();
        let mut batch = Vec::with_capacity(self.options.batch_size);
        for repo in targets {
            let started = Instant::now();
            let outcome = match self
                .sync_repo(repo, &mut state, &mut batch, &mut summary)
                .await
            {
                Ok(outcome) => outcome,
                Err(err) => {
                    metrics::REPOS_PROCESSED_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    return Err(err.context(format!("syncing {repo}")));
                }
            };
            info!(
                repo = %repo,
                emitted = outcome.emitted,
                skipped_known = outcome.skipped_known,
                skipped_excluded = outcome.skipped_excluded,
                skipped_delivered = outcome.skipped_delivered,
                skipped_duplicate = outcome.skipped_duplicate,
                stop = outcome.stop.as_str(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "repository done"
            );
            let stop = outcome.stop;
            summary.repos.push(outcome);

            if let RepoStop::Budget { remaining } = stop {
                metrics::REPOS_PROCESSED_TOTAL
                    .with_label_values(&["budget_stop"])
                    .inc();
                metrics::BUDGET_STOPS_TOTAL.inc();
                summary.budget_stop = Some((repo.clone(), remaining));
                break;
            }
            metrics::REPOS_PROCESSED_TOTAL
                .with_label_values(&["complete"])
                .inc();
        }

        self.commit(&mut batch, &state, &mut summary).await?;
        info!(
            repos = summary.repos.len(),
            emitted = summary.records_emitted(),
            batches = summary.batches_flushed,
            budget_stop = summary.budget_stop.is_some(),
            "sync finished"
        );
        Ok(summary)
    }

    async fn sync_repo(
        &mut self,
        repo: &RepoRef,
        state: &mut CheckpointState,
        batch: &mut Vec<PullRequestRecord>,
        summary: &mut RunSummary,
    ) -> Result<RepoOutcome> {
        let mut outcome = RepoOutcome {
            repo: repo.clone(),
            emitted: 0,
            skipped_known: 0,
            skipped_excluded: 0,
            skipped_delivered: 0,
            skipped_duplicate: 0,
            stop: RepoStop::Exhausted,
        };
        let key = repo.key();
        let prior = state.get(&key).cloned().unwrap_or_default();
        let latest = self
            .latest_update(repo)
            .await
            .context("fetching newest pull request")?;
        info!(
            repo = %repo,
            watermark = ?prior.updated_at,
            partial = ?prior.partial,
            latest = ?latest,
            "syncing repository"
        );

        let mut walk = RepoWalk::new(key, prior, latest);
        if walk.up_to_date() {
            outcome.stop = RepoStop::UpToDate;
            return Ok(outcome);
        }

        let client = Arc::clone(&self.client);
        let client = client.as_ref();
        let page_size = self.options.page_size;
        let mut pulls = Box::pin(paginate(page_size, move |page| {
            client.list_pulls(&repo.owner, &repo.name, page, page_size)
        }));

        while let Some(pull) = pulls.try_next().await.context("listing pull requests")? {
            if walk.below_watermark(pull.updated_at) {
                outcome.stop = RepoStop::Watermark;
                break;
            }
            if !walk.first_sighting(pull.id) {
                outcome.skipped_duplicate += 1;
                metrics::RECORDS_SKIPPED_TOTAL
                    .with_label_values(&["duplicate"])
                    .inc();
                continue;
            }
            walk.observe(pull.updated_at);

            if walk.already_delivered(pull.updated_at) {
                walk.handled(pull.updated_at);
                outcome.skipped_delivered += 1;
                metrics::RECORDS_SKIPPED_TOTAL
                    .with_label_values(&["delivered"])
                    .inc();
                continue;
            }
            if self.known.contains(pull.id, pull.updated_at) {
                walk.handled(pull.updated_at);
                outcome.skipped_known += 1;
                metrics::RECORDS_SKIPPED_TOTAL
                    .with_label_values(&["known"])
                    .inc();
                continue;
            }
            if pull
                .author_login()
                .is_some_and(|login| self.options.excluded_users.contains(login))
            {
                walk.handled(pull.updated_at);
                outcome.skipped_excluded += 1;
                metrics::RECORDS_SKIPPED_TOTAL
                    .with_label_values(&["excluded"])
                    .inc();
                continue;
            }

            let remaining = self
                .governor
                .remaining()
                .await
                .context("checking rate limit")?;
            if remaining < self.options.min_remaining {
                warn!(
                    repo = %repo,
                    remaining,
                    threshold = self.options.min_remaining,
                    "rate limit budget low; stopping walk"
                );
                outcome.stop = RepoStop::Budget { remaining };
                break;
            }

            let record = self
                .fetch_record(repo, pull.number)
                .await
                .with_context(|| format!("fetching pull request #{}", pull.number))?;
            batch.push(record);
            walk.handled(pull.updated_at);
            outcome.emitted += 1;
            metrics::RECORDS_EMITTED_TOTAL.inc();

            if batch.len() >= self.options.batch_size {
                state.set(walk.key.clone(), walk.in_progress());
                self.commit(batch, state, summary).await?;
            }
        }

        let entry = match outcome.stop {
            RepoStop::Budget { .. } => walk.in_progress(),
            _ => walk.completed(),
        };
        state.set(walk.key, entry);
        Ok(outcome)
    }

    async fn latest_update(&self, repo: &RepoRef) -> Result<Option<DateTime<Utc>>> {
        let newest = self
            .client
            .list_pulls(&repo.owner, &repo.name, 1, 1)
            .await?;
        Ok(newest.first().map(|pull| pull.updated_at))
    }

    async fn fetch_record(&self, repo: &RepoRef, number: i64) -> Result<PullRequestRecord> {
        let client = self.client.as_ref();
        let detail = client.get_pull(&repo.owner, &repo.name, number).await?;
        let page_size = self.options.page_size;
        let reviews = collect_all(page_size, move |page| {
            client.list_reviews(&repo.owner, &repo.name, number, page, page_size)
        })
        .await?
        .iter()
        .map(normalize_review)
        .collect();
        Ok(normalize_pull_request(
            &repo.owner,
            &repo.name,
            &detail,
            reviews,
            Utc::now(),
        ))
    }

    /// Uploads whatever is batched, then persists `state`. The checkpoint
    /// is never written ahead of the records it covers.
    async fn commit(
        &self,
        batch: &mut Vec<PullRequestRecord>,
        state: &CheckpointState,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if !batch.is_empty() {
            self.sink
                .upload(batch)
                .await
                .with_context(|| {
                    format!("uploading {} records to {} sink", batch.len(), self.sink.name())
                })?;
            info!(records = batch.len(), sink = self.sink.name(), "flushed batch");
            metrics::BATCHES_FLUSHED_TOTAL.inc();
            summary.batches_flushed += 1;
            batch.clear();
        }
        self.store
            .save(state)
            .await
            .context("persisting checkpoint state")?;
        Ok(())
    }
}
