#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("query error: {0}")]
    Query(#[from] sqlx::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("warehouse responded with status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("warehouse rejected {count} row(s), first: {first}")]
    Rejected { count: usize, first: String },
    #[error("invalid record {id}: {reason}")]
    InvalidRecord { id: i64, reason: String },
    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SinkError>;
