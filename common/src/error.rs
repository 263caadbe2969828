use thiserror::Error;
use tokio::task::JoinError;

use crate::storage::types::corpus::CorpusKind;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("Object storage error: {0}")]
    ObjectStore(#[from] object_store::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("No persisted {kind} corpus for org {org_id}")]
    CorpusMissing { org_id: i64, kind: CorpusKind },
    #[error("Stale {kind} corpus for org {org_id}: derived from version {expected}, stored version is {found}")]
    StaleCorpus {
        org_id: i64,
        kind: CorpusKind,
        expected: u64,
        found: u64,
    },
    #[error("Partial corpus update for org {org_id}: {updated} corpus updated, {failed} corpus failed: {source}")]
    PartialCorpusUpdate {
        org_id: i64,
        updated: CorpusKind,
        failed: CorpusKind,
        source: Box<AppError>,
    },
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Rerank service failure: {0}")]
    RerankServiceFailure(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}
