use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    /// Decoded text shows signs of the wrong source encoding.
    #[error("{path}: {hits} garbled characters after decoding as {encoding}; re-run with the correct --encoding")]
    Encoding {
        path: String,
        encoding: &'static str,
        hits: usize,
    },

    #[error("run lock {key} is held by {owner}")]
    LockHeld { key: String, owner: String },

    #[error("chunk {index} failed after {attempts} attempts: {message}")]
    ChunkFailed {
        index: usize,
        attempts: u32,
        message: String,
    },

    /// Store-level failure; the writer treats these as retryable.
    #[error("store error: {0}")]
    Store(String),
}
