use thiserror::Error;

#[derive(Debug, Error)]
pub enum TracekeepError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid span: {0}")]
    Validation(String),

    #[error("storage write failed: {0}")]
    StorageWrite(String),

    #[error("storage read failed: {0}")]
    StorageRead(String),

    #[error("trace index corrupted: {0}")]
    IndexCorruption(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("ingest error: {0}")]
    Ingest(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl TracekeepError {
    /// Whether the error came from the storage layer rather than the input.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            Self::StorageWrite(_) | Self::StorageRead(_) | Self::IndexCorruption(_) | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TracekeepError>;
