use thiserror::Error;

#[derive(Error, Debug)]
pub enum WatchworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid action specification: {0}")]
    InvalidSpec(String),

    #[error("Unresolved action reference: {0}")]
    UnresolvedReference(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Admission queue is full")]
    QueueFull,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, WatchworkError>;
