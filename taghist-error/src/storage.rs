use sea_orm::DbErr;
use thiserror::Error;

/// Errors raised by the day-sharded history store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage unavailable")]
    StorageUnavailable,
    #[error("{0}")]
    DBError(#[from] DbErr),
    #[error("shard file missing: {0}")]
    ShardMissing(String),
    #[error("shard attach failed for '{alias}': {reason}")]
    AttachFailed { alias: String, reason: String },
    #[error("history query failed for tag '{tag}': {reason}")]
    QueryFailed { tag: String, reason: String },
}
