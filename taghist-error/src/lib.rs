pub mod storage;

use anyhow::Error as AnyhowError;
use config::ConfigError;
use serde_json::Error as SerdeJsonError;
use std::{error::Error as StdError, io::Error as IoError};
use storage::StorageError;
use thiserror::Error;
use tokio::task::JoinError;

pub type THResult<T, E = THError> = anyhow::Result<T, E>;
pub type StorageResult<T, E = StorageError> = Result<T, E>;

#[derive(Error, Debug, Default)]
pub enum THError {
    #[error("service unavailable")]
    #[default]
    ServiceUnavailable,
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    JoinError(#[from] JoinError),
    #[error("{0}")]
    StdError(#[from] Box<dyn StdError + Send + Sync>),
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("{0}")]
    StorageError(#[from] StorageError),
    #[error("source '{0}' unreachable")]
    SourceUnreachable(String),
    #[error("device read failed: {0}")]
    ReadError(String),
    #[error("delivery failed: {0}")]
    DeliveryError(String),
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    #[error("initialization error: {0}")]
    InitializationError(String),
    #[error("shutdown error: {0}")]
    ShutdownError(String),
}

impl From<String> for THError {
    #[inline]
    fn from(e: String) -> Self {
        THError::Msg(e)
    }
}

impl From<&str> for THError {
    #[inline]
    fn from(e: &str) -> Self {
        THError::Msg(e.to_string())
    }
}

impl From<sea_orm::DbErr> for THError {
    #[inline]
    fn from(e: sea_orm::DbErr) -> Self {
        THError::StorageError(StorageError::DBError(e))
    }
}
