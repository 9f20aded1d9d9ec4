pub type Result<T, E = AppError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("missing credentials: set {0} or configure github.tokens")]
    MissingCredentials(&'static str),
    #[error("invalid target selector: {0:?}")]
    InvalidSelector(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
