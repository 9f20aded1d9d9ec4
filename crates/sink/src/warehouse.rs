use std::time::Duration;

use async_trait::async_trait;
use normalizer::PullRequestRecord;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{Result, SinkError};
use crate::RecordSink;

/// Streams batches into a warehouse table through a BigQuery-compatible
/// `insertAll` endpoint. Rows carry an `insertId` of `{id}-{updatedAt}` so a
/// batch replayed after a crash is deduplicated by the warehouse.
pub struct WarehouseSink {
    client: reqwest::Client,
    insert_url: String,
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InsertAllResponse {
    #[serde(default)]
    insert_errors: Vec<InsertError>,
}

#[derive(Debug, Deserialize)]
struct InsertError {
    index: usize,
    #[serde(default)]
    errors: Vec<Value>,
}

impl WarehouseSink {
    pub fn new(
        endpoint: &str,
        project: &str,
        dataset: &str,
        table: &str,
        access_token: String,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        let insert_url = format!(
            "{}/projects/{}/datasets/{}/tables/{}/insertAll",
            endpoint.trim_end_matches('/'),
            project,
            dataset,
            table
        );
        Ok(Self {
            client,
            insert_url,
            access_token,
        })
    }

    pub fn insert_url(&self) -> &str {
        &self.insert_url
    }
}

pub fn insert_all_body(batch: &[PullRequestRecord]) -> Result<Value> {
    let rows = batch
        .iter()
        .map(|record| -> Result<Value> {
            Ok(json!({
                "insertId": format!("{}-{}", record.id, record.updated_at),
                "json": serde_json::to_value(record)?,
            }))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(json!({
        "kind": "bigquery#tableDataInsertAllRequest",
        "skipInvalidRows": false,
        "ignoreUnknownValues": false,
        "rows": rows,
    }))
}

#[async_trait]
impl RecordSink for WarehouseSink {
    async fn upload(&self, batch: &[PullRequestRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let body = insert_all_body(batch)?;
        let response = self
            .client
            .post(&self.insert_url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(SinkError::Status {
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }

        let parsed: InsertAllResponse = if text.trim().is_empty() {
            InsertAllResponse {
                insert_errors: Vec::new(),
            }
        } else {
            serde_json::from_str(&text)?
        };
        if let Some(first) = parsed.insert_errors.first() {
            let id = batch.get(first.index).map(|r| r.id).unwrap_or_default();
            warn!(
                rejected = parsed.insert_errors.len(),
                record_id = id,
                "warehouse rejected rows"
            );
            return Err(SinkError::Rejected {
                count: parsed.insert_errors.len(),
                first: format!("record {id}: {}", Value::Array(first.errors.clone())),
            });
        }

        debug!(rows = batch.len(), url = %self.insert_url, "inserted rows");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "warehouse"
    }
}
