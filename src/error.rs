use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Chunk storage is not allocated at offset {offset:?}")]
    NotAllocated { offset: Vec<u64> },

    #[error("Buffer too small: chunk needs {needed} bytes, buffer holds {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    #[error("Invalid chunk offset: {0}")]
    InvalidOffset(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("External link '{link}' exceeds the limit of {limit} link hops")]
    LinkDepthExceeded { link: String, limit: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Container storage error: {0}")]
    Storage(String),

    #[error("Dataset '{name}' not found")]
    DatasetNotFound { name: String },

    #[error("Link '{name}' not found")]
    LinkNotFound { name: String },

    #[error("Container {path:?} is opened read-only")]
    ReadOnly { path: std::path::PathBuf },

    #[error("Cannot lock container {path:?}: {reason}")]
    LockFailed { path: std::path::PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, ChunkError>;
