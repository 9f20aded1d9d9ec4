use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::config::{AppConfig, SinkConfig};
use common::logging;
use gh_broker::{GithubBrokerBuilder, GithubToken as BrokerToken};
use pr_sync::{
    metrics, parse_selectors, resolve_targets, BrokerGithubClient, CheckpointStore, GithubClient,
    KnownSet, SyncEngine, SyncOptions,
};
use tracing::{info, warn};

/// Incrementally copies pull request metadata into a sink.
#[derive(Debug, Parser)]
#[command(name = "pr-sync", version)]
struct Cli {
    /// Directory holding `config/default.*` and `config/local.*`
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Comma-separated `owner/repo`, `owner/*` or `owner` selectors
    #[arg(long, visible_alias = "owners")]
    targets: Option<String>,

    /// Write JSON lines to this file instead of the configured sink
    #[arg(long)]
    out: Option<String>,

    /// Checkpoint file
    #[arg(long)]
    state: Option<String>,

    /// `id,updated_at` listing of records already delivered elsewhere
    #[arg(long)]
    known: Option<String>,

    /// Comma-separated logins whose pull requests are never emitted
    #[arg(long)]
    exclude_users: Option<String>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    log_level: Option<String>,

    /// Prometheus textfile written when the run ends
    #[arg(long)]
    metrics_path: Option<String>,
}

impl Cli {
    fn apply(self, config: &mut AppConfig) {
        if let Some(targets) = self.targets {
            config.sync.targets = targets;
        }
        if let Some(path) = self.out {
            config.sink = SinkConfig::File { path };
        }
        if let Some(state) = self.state {
            config.sync.state_path = state;
        }
        if self.known.is_some() {
            config.sync.known_path = self.known;
        }
        if let Some(users) = self.exclude_users {
            config.sync.exclude_users = users;
        }
        if let Some(batch_size) = self.batch_size {
            config.sync.batch_size = batch_size;
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if self.metrics_path.is_some() {
            config.observability.metrics_path = self.metrics_path;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AppConfig::load_from_path(&cli.config_dir)?;
    cli.apply(&mut config);
    logging::init_logging(&config.observability.log_level);

    let result = run(&config).await;
    if let Some(path) = &config.observability.metrics_path {
        if let Err(err) = metrics::write_textfile(path).await {
            warn!(path = %path, error = ?err, "failed to write metrics textfile");
        }
    }
    result
}

async fn run(config: &AppConfig) -> Result<()> {
    let selectors = parse_selectors(&config.sync.targets)?;
    if selectors.is_empty() {
        bail!("no targets given; pass --targets or set sync.targets");
    }

    let tokens: Vec<BrokerToken> = config
        .github
        .resolved_tokens()?
        .into_iter()
        .map(|token| BrokerToken {
            id: token.id,
            secret: token.secret,
        })
        .collect();
    let broker = GithubBrokerBuilder::new(tokens)
        .user_agent(config.github.user_agent.clone())
        .retry(
            config.broker.max_attempts,
            Duration::from_millis(config.broker.retry_delay_ms),
            config.broker.jitter_frac,
        )
        .cache(
            config.broker.cache_capacity,
            Duration::from_secs(config.broker.cache_ttl_secs),
        )
        .min_interval(Duration::from_millis(config.broker.min_interval_ms))
        .build()?;
    let client: Arc<dyn GithubClient> = Arc::new(BrokerGithubClient::new(
        broker,
        config.github.user_agent.clone(),
        &config.github.api_base,
    )?);

    let targets = resolve_targets(client.as_ref(), &selectors).await?;
    info!(count = targets.len(), "resolved sync targets");

    let sink = sink::open_sink(&config.sink)
        .await
        .with_context(|| format!("opening {} sink", config.sink.kind()))?;
    let known = match &config.sync.known_path {
        Some(path) => KnownSet::load(path).await?,
        None => KnownSet::default(),
    };
    let excluded = config.sync.excluded_users();
    info!(
        sink = sink.name(),
        state = %config.sync.state_path,
        known = known.len(),
        excluded = ?excluded,
        "starting sync"
    );

    let mut engine = SyncEngine::new(
        client,
        sink,
        CheckpointStore::new(&config.sync.state_path),
        SyncOptions::from_config(&config.sync),
    )
    .with_known_set(known);
    let summary = engine.run(&targets).await?;

    if let Some((repo, remaining)) = &summary.budget_stop {
        info!(
            repo = %repo,
            remaining,
            "stopped early to preserve rate limit; rerun later to resume"
        );
    }
    Ok(())
}
