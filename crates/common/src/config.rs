use std::path::Path;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::errors::AppError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Config::builder()
            .add_source(
                File::with_name(
                    path.as_ref()
                        .join("config/default")
                        .to_string_lossy()
                        .as_ref(),
                )
                .required(false),
            )
            .add_source(
                File::with_name(
                    path.as_ref()
                        .join("config/local")
                        .to_string_lossy()
                        .as_ref(),
                )
                .required(false),
            )
            .add_source(Environment::default().separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubToken {
    pub id: String,
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubConfig {
    #[serde(default)]
    pub tokens: Vec<GithubToken>,
    #[serde(default = "GithubConfig::default_user_agent")]
    pub user_agent: String,
    #[serde(default = "GithubConfig::default_api_base")]
    pub api_base: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            user_agent: Self::default_user_agent(),
            api_base: Self::default_api_base(),
        }
    }
}

impl GithubConfig {
    pub const TOKEN_ENV: &'static str = "GITHUB_TOKEN";

    fn default_user_agent() -> String {
        "pr-sync".to_string()
    }

    fn default_api_base() -> String {
        "https://api.github.com/".to_string()
    }

    /// Configured tokens, or the single `GITHUB_TOKEN` from the environment
    /// when none are configured.
    pub fn resolved_tokens(&self) -> Result<Vec<GithubToken>, AppError> {
        if !self.tokens.is_empty() {
            return Ok(self.tokens.clone());
        }
        match std::env::var(Self::TOKEN_ENV) {
            Ok(secret) if !secret.trim().is_empty() => Ok(vec![GithubToken {
                id: "env".to_string(),
                secret: secret.trim().to_string(),
            }]),
            _ => Err(AppError::MissingCredentials(Self::TOKEN_ENV)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "BrokerConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "BrokerConfig::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub jitter_frac: f32,
    #[serde(default = "BrokerConfig::default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "BrokerConfig::default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default)]
    pub min_interval_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            jitter_frac: 0.0,
            cache_capacity: Self::default_cache_capacity(),
            cache_ttl_secs: Self::default_cache_ttl_secs(),
            min_interval_ms: 0,
        }
    }
}

impl BrokerConfig {
    const fn default_max_attempts() -> u32 {
        3
    }

    const fn default_retry_delay_ms() -> u64 {
        2_000
    }

    const fn default_cache_capacity() -> usize {
        2048
    }

    const fn default_cache_ttl_secs() -> u64 {
        600
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub targets: String,
    #[serde(default = "SyncConfig::default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "SyncConfig::default_page_size")]
    pub page_size: u32,
    #[serde(default = "SyncConfig::default_min_remaining")]
    pub min_remaining: i64,
    #[serde(default = "SyncConfig::default_refresh_every")]
    pub rate_limit_refresh_every: u32,
    #[serde(default = "SyncConfig::default_state_path")]
    pub state_path: String,
    #[serde(default)]
    pub known_path: Option<String>,
    #[serde(default = "SyncConfig::default_exclude_users")]
    pub exclude_users: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            targets: String::new(),
            batch_size: Self::default_batch_size(),
            page_size: Self::default_page_size(),
            min_remaining: Self::default_min_remaining(),
            rate_limit_refresh_every: Self::default_refresh_every(),
            state_path: Self::default_state_path(),
            known_path: None,
            exclude_users: Self::default_exclude_users(),
        }
    }
}

impl SyncConfig {
    const fn default_batch_size() -> usize {
        200
    }

    const fn default_page_size() -> u32 {
        100
    }

    const fn default_min_remaining() -> i64 {
        500
    }

    const fn default_refresh_every() -> u32 {
        10
    }

    fn default_state_path() -> String {
        "state.json".to_string()
    }

    fn default_exclude_users() -> String {
        "dependabot,github-actions".to_string()
    }

    pub fn excluded_users(&self) -> Vec<String> {
        split_list(&self.exclude_users)
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SinkConfig {
    File {
        #[serde(default = "SinkConfig::default_file_path")]
        path: String,
    },
    Warehouse {
        endpoint: String,
        project: String,
        dataset: String,
        table: String,
        #[serde(default)]
        access_token: Option<String>,
    },
    Postgres {
        url: String,
        #[serde(default = "SinkConfig::default_table")]
        table: String,
    },
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig::File {
            path: Self::default_file_path(),
        }
    }
}

impl SinkConfig {
    pub const WAREHOUSE_TOKEN_ENV: &'static str = "WAREHOUSE_ACCESS_TOKEN";

    fn default_file_path() -> String {
        "result.jsonl".to_string()
    }

    fn default_table() -> String {
        "pull_requests".to_string()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SinkConfig::File { .. } => "file",
            SinkConfig::Warehouse { .. } => "warehouse",
            SinkConfig::Postgres { .. } => "postgres",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "ObservabilityConfig::default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub metrics_path: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            metrics_path: None,
        }
    }
}

impl ObservabilityConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

/// Splits a comma-separated list, trimming entries and dropping empty ones.
pub fn split_list(input: &str) -> Vec<String> {
    input
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_list_drops_blanks() {
        assert_eq!(split_list(" a, ,b ,"), vec!["a".to_string(), "b".to_string()]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn loads_defaults_and_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("config")).unwrap();
        std::fs::write(
            dir.path().join("config/default.toml"),
            r#"
[sync]
batch_size = 50
targets = "acme/*"

[sink]
kind = "postgres"
url = "postgres://localhost/prs"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from_path(dir.path()).unwrap();
        assert_eq!(cfg.sync.batch_size, 50);
        assert_eq!(cfg.sync.targets, "acme/*");
        assert_eq!(cfg.sync.min_remaining, 500);
        assert_eq!(cfg.broker.max_attempts, 3);
        assert_eq!(
            cfg.sink,
            SinkConfig::Postgres {
                url: "postgres://localhost/prs".into(),
                table: "pull_requests".into(),
            }
        );
    }

    #[test]
    fn configured_tokens_take_precedence() {
        let cfg = GithubConfig {
            tokens: vec![GithubToken {
                id: "a".into(),
                secret: "s".into(),
            }],
            ..GithubConfig::default()
        };
        let tokens = cfg.resolved_tokens().unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].id, "a");
    }
}
