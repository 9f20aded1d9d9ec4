pub mod errors;
pub mod file;
pub mod pg;
pub mod warehouse;

use std::sync::Arc;

use async_trait::async_trait;
use common::config::SinkConfig;
use normalizer::PullRequestRecord;

pub use errors::{Result, SinkError};
pub use file::FileSink;
pub use pg::PgSink;
pub use warehouse::WarehouseSink;

/// Durable destination for normalized records. An `Ok` return means the
/// whole batch is stored; callers advance their checkpoint only after it.
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upload(&self, batch: &[PullRequestRecord]) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Builds the backend selected by configuration.
pub async fn open_sink(config: &SinkConfig) -> Result<Arc<dyn RecordSink>> {
    match config {
        SinkConfig::File { path } => Ok(Arc::new(FileSink::new(path))),
        SinkConfig::Warehouse {
            endpoint,
            project,
            dataset,
            table,
            access_token,
        } => {
            let token = match access_token {
                Some(token) => token.clone(),
                None => std::env::var(SinkConfig::WAREHOUSE_TOKEN_ENV).map_err(|_| {
                    SinkError::Config(format!(
                        "warehouse sink needs sink.access_token or {}",
                        SinkConfig::WAREHOUSE_TOKEN_ENV
                    ))
                })?,
            };
            let sink = WarehouseSink::new(endpoint, project, dataset, table, token)?;
            Ok(Arc::new(sink))
        }
        SinkConfig::Postgres { url, table } => Ok(Arc::new(PgSink::connect(url, table).await?)),
    }
}
