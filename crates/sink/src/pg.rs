use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use normalizer::PullRequestRecord;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, QueryBuilder};
use tokio::time::{sleep, Duration};
use tracing::{info, instrument, warn};

use crate::errors::{Result, SinkError};
use crate::RecordSink;

// Postgres caps a statement at 65535 bind parameters; 15 per row.
const ROWS_PER_STATEMENT: usize = 1000;

/// Upserts records into a relational table keyed by pull request id. A row
/// is only overwritten by a record with an equal or newer `updated_at`.
#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
    table: String,
}

impl PgSink {
    pub async fn connect(database_url: &str, table: &str) -> Result<Self> {
        const MAX_ATTEMPTS: u32 = 5;
        const BASE_DELAY_MS: u64 = 500;

        let mut attempts = 0;
        let pool = loop {
            match PgPoolOptions::new()
                .max_connections(2)
                .connect(database_url)
                .await
            {
                Ok(pool) => break pool,
                Err(err) => {
                    attempts += 1;
                    if attempts >= MAX_ATTEMPTS {
                        return Err(SinkError::Query(err));
                    }

                    let exp = (attempts - 1).min(5);
                    let backoff = Duration::from_millis(BASE_DELAY_MS * (1u64 << exp));
                    warn!(
                        attempts,
                        error = %err,
                        wait_ms = backoff.as_millis(),
                        "database connection failed; retrying"
                    );
                    sleep(backoff).await;
                }
            }
        };
        Self::from_pool(pool, table).await
    }

    pub async fn from_pool(pool: PgPool, table: &str) -> Result<Self> {
        validate_table_name(table)?;
        let sink = Self {
            pool,
            table: table.to_string(),
        };
        sink.ensure_table().await?;
        Ok(sink)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                id BIGINT PRIMARY KEY,
                owner TEXT NOT NULL,
                repo TEXT NOT NULL,
                record_timestamp TIMESTAMPTZ NOT NULL,
                additions BIGINT,
                deletions BIGINT,
                author TEXT,
                state TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                closed_at TIMESTAMPTZ,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                body TEXT,
                reviews JSONB NOT NULL DEFAULT '[]'::jsonb
            )
            "#,
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        info!(table = %self.table, "postgres sink ready");
        Ok(())
    }
}

#[async_trait]
impl RecordSink for PgSink {
    #[instrument(skip(self, batch), fields(table = %self.table, records = batch.len()))]
    async fn upload(&self, batch: &[PullRequestRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let rows = batch.iter().map(PgRow::try_from).collect::<Result<Vec<_>>>()?;
        let rows = newest_per_id(rows);

        let mut tx = self.pool.begin().await?;
        for chunk in rows.chunks(ROWS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Postgres>::new(format!(
                "INSERT INTO {} (id, owner, repo, record_timestamp, additions, deletions, author, \
                 state, created_at, updated_at, closed_at, title, url, body, reviews) ",
                self.table
            ));
            builder.push_values(chunk, |mut b, row| {
                b.push_bind(row.id)
                    .push_bind(&row.owner)
                    .push_bind(&row.repo)
                    .push_bind(row.record_timestamp)
                    .push_bind(row.additions)
                    .push_bind(row.deletions)
                    .push_bind(&row.author)
                    .push_bind(&row.state)
                    .push_bind(row.created_at)
                    .push_bind(row.updated_at)
                    .push_bind(row.closed_at)
                    .push_bind(&row.title)
                    .push_bind(&row.url)
                    .push_bind(&row.body)
                    .push_bind(&row.reviews);
            });
            builder.push(format!(
                r#"
                ON CONFLICT (id) DO UPDATE
                    SET owner = EXCLUDED.owner,
                        repo = EXCLUDED.repo,
                        record_timestamp = EXCLUDED.record_timestamp,
                        additions = EXCLUDED.additions,
                        deletions = EXCLUDED.deletions,
                        author = EXCLUDED.author,
                        state = EXCLUDED.state,
                        created_at = EXCLUDED.created_at,
                        updated_at = EXCLUDED.updated_at,
                        closed_at = EXCLUDED.closed_at,
                        title = EXCLUDED.title,
                        url = EXCLUDED.url,
                        body = EXCLUDED.body,
                        reviews = EXCLUDED.reviews
                    WHERE {}.updated_at <= EXCLUDED.updated_at
                "#,
                self.table
            ));
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

struct PgRow {
    id: i64,
    owner: String,
    repo: String,
    record_timestamp: DateTime<Utc>,
    additions: Option<i64>,
    deletions: Option<i64>,
    author: Option<String>,
    state: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
    title: String,
    url: String,
    body: Option<String>,
    reviews: serde_json::Value,
}

impl TryFrom<&PullRequestRecord> for PgRow {
    type Error = SinkError;

    fn try_from(record: &PullRequestRecord) -> Result<Self> {
        let ts = |value: &str| parse_timestamp(record.id, value);
        Ok(Self {
            id: record.id,
            owner: record.owner.clone(),
            repo: record.repo.clone(),
            record_timestamp: ts(&record.record_timestamp)?,
            additions: record.additions,
            deletions: record.deletions,
            author: record.author.clone(),
            state: record.state.clone(),
            created_at: ts(&record.created_at)?,
            updated_at: ts(&record.updated_at)?,
            closed_at: record.closed_at.as_deref().map(ts).transpose()?,
            title: record.title.clone(),
            url: record.url.clone(),
            body: record.body.clone(),
            reviews: serde_json::to_value(&record.reviews)?,
        })
    }
}

/// One row per id, the newest `updated_at` winning. A single upsert
/// statement cannot touch the same key twice.
fn newest_per_id(rows: Vec<PgRow>) -> Vec<PgRow> {
    let mut slots: HashMap<i64, usize> = HashMap::with_capacity(rows.len());
    let mut unique: Vec<PgRow> = Vec::with_capacity(rows.len());
    for row in rows {
        match slots.get(&row.id) {
            Some(&slot) => {
                if unique[slot].updated_at <= row.updated_at {
                    unique[slot] = row;
                }
            }
            None => {
                slots.insert(row.id, unique.len());
                unique.push(row);
            }
        }
    }
    unique
}

fn parse_timestamp(id: i64, value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| SinkError::InvalidRecord {
            id,
            reason: format!("bad timestamp {value:?}: {err}"),
        })
}

/// Accepts `table` or `schema.table` made of plain identifiers, since the
/// name is interpolated into SQL.
fn validate_table_name(table: &str) -> Result<()> {
    let valid_ident = |part: &str| {
        let mut chars = part.chars();
        matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };
    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|p| valid_ident(p)) {
        Ok(())
    } else {
        Err(SinkError::Config(format!("invalid table name {table:?}")))
    }
}
