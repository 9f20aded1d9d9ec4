use std::path::{Path, PathBuf};

use async_trait::async_trait;
use normalizer::PullRequestRecord;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::Result;
use crate::RecordSink;

/// Appends records as JSON lines. Each upload is synced to disk before it
/// returns.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RecordSink for FileSink {
    async fn upload(&self, batch: &[PullRequestRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::with_capacity(batch.len() * 512);
        for record in batch {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buf).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(path = %self.path.display(), records = batch.len(), "appended batch");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
