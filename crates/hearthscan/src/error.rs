use thiserror::Error;

#[derive(Error, Debug)]
pub enum HearthscanError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Provider token limit reached at batch {batch}: {message}")]
    ProviderLimit { batch: u64, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Correlation job failed")]
    CorrelationFailed,

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Event channel closed unexpectedly")]
    ChannelClosed,

    #[error("Backend unreachable: {0}")]
    Unreachable(String),
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Threshold value for '{entity_id}' ({level}) must not be empty")]
    EmptyThresholdValue { entity_id: String, level: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to write '{key}': {reason}")]
    WriteFailed { key: String, reason: String },
}

pub type Result<T> = std::result::Result<T, HearthscanError>;
