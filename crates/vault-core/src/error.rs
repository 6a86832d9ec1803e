use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault not initialized: run 'vault init'")]
    NotInitialized,

    #[error("vault root not found: {0}")]
    VaultRootMissing(String),

    #[error("invalid item id '{0}': must be non-empty, without path separators")]
    InvalidItemId(String),

    #[error("malformed header in {path}: {reason}")]
    MalformedHeader { path: String, reason: String },

    #[error("missing required header key '{key}' in {path}")]
    MissingHeaderKey { key: String, path: String },

    #[error("item not found: {0}")]
    ItemNotFound(String),

    #[error("item '{id}' is in {actual}, expected {expected}")]
    StageConflict {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("unknown stage: {0}")]
    UnknownStage(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, VaultError>;
