//! Bulk `tag_ids` propagation across the dense and sparse stores.

use std::{collections::BTreeSet, sync::Arc};

use common::{
    error::AppError,
    storage::{
        addressing::{
            chunk_id, chunk_ids, chunks_count_from, namespace_for, tag_patch,
            DEFAULT_MAX_CHUNKS_PER_FILE,
        },
        vector::{IndexKind, Metadata, VectorStore},
    },
    utils::usage::UsageAccumulator,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTags {
    pub file_id: String,
    pub tag_ids: BTreeSet<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Updated,
    Removed,
    NotFound,
    Failed,
}

/// Outcome for one input file. Batches always yield one per file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileResult {
    pub file_id: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FileResult {
    pub(crate) fn done(file_id: String, status: FileStatus, chunks: u32) -> Self {
        Self {
            file_id,
            status,
            chunks: Some(chunks),
            error: None,
        }
    }

    pub(crate) fn not_found(file_id: String) -> Self {
        Self {
            file_id,
            status: FileStatus::NotFound,
            chunks: None,
            error: None,
        }
    }

    pub(crate) fn failed(file_id: String, chunks: Option<u32>, error: impl ToString) -> Self {
        Self {
            file_id,
            status: FileStatus::Failed,
            chunks,
            error: Some(error.to_string()),
        }
    }
}

pub(crate) enum ChunkLookup {
    Found(u32),
    NotFound,
    Failed(AppError),
}

/// Reads chunk 1 of a file from the dense store and derives how many chunks it has.
///
/// Counts above `max_chunks` are treated as corrupt metadata.
pub(crate) async fn lookup_chunks(
    dense: &dyn VectorStore,
    limiter: &Semaphore,
    max_chunks: u32,
    org_id: i64,
    namespace: &str,
    file_id: &str,
) -> ChunkLookup {
    let first = chunk_id(org_id, file_id, 1);
    let fetched = {
        let Ok(_permit) = limiter.acquire().await else {
            return ChunkLookup::Failed(AppError::InternalError(
                "store request limiter closed".into(),
            ));
        };
        dense.fetch(namespace, std::slice::from_ref(&first)).await
    };

    match fetched {
        Err(err) => ChunkLookup::Failed(err),
        Ok(found) => match found.get(&first) {
            None => ChunkLookup::NotFound,
            Some(metadata) => match chunks_count_from(metadata) {
                Some(count) if count > max_chunks => ChunkLookup::Failed(AppError::Validation(
                    format!("chunk '{first}' claims {count} chunks, the limit is {max_chunks}"),
                )),
                Some(count) => ChunkLookup::Found(count),
                None => ChunkLookup::Failed(AppError::Validation(format!(
                    "chunk '{first}' carries no valid chunks_count"
                ))),
            },
        },
    }
}

/// Fans metadata-only updates out to both stores.
pub struct MetadataPropagator {
    dense: Arc<dyn VectorStore>,
    sparse: Arc<dyn VectorStore>,
    limiter: Arc<Semaphore>,
    max_chunks_per_file: u32,
}

impl MetadataPropagator {
    /// `max_inflight` caps concurrent store requests across the whole batch.
    pub fn new(
        dense: Arc<dyn VectorStore>,
        sparse: Arc<dyn VectorStore>,
        max_inflight: usize,
    ) -> Self {
        Self {
            dense,
            sparse,
            limiter: Arc::new(Semaphore::new(max_inflight.max(1))),
            max_chunks_per_file: DEFAULT_MAX_CHUNKS_PER_FILE,
        }
    }

    #[must_use]
    pub fn with_max_chunks_per_file(mut self, max_chunks_per_file: u32) -> Self {
        self.max_chunks_per_file = max_chunks_per_file;
        self
    }

    pub async fn update_file_tags(&self, org_id: i64, files: Vec<FileTags>) -> Vec<FileResult> {
        self.update_file_tags_with_usage(org_id, files, None).await
    }

    /// Results come back in input order. Per-file failures never fail the batch.
    #[instrument(skip_all, fields(org_id = org_id, files = files.len()))]
    pub async fn update_file_tags_with_usage(
        &self,
        org_id: i64,
        files: Vec<FileTags>,
        usage: Option<&UsageAccumulator>,
    ) -> Vec<FileResult> {
        let namespace = namespace_for(org_id);
        let results = join_all(
            files
                .into_iter()
                .map(|file| self.update_file(org_id, &namespace, file, usage)),
        )
        .await;

        let updated = results
            .iter()
            .filter(|result| result.status == FileStatus::Updated)
            .count();
        info!(
            org_id,
            total = results.len(),
            updated,
            "Finished tag propagation batch"
        );
        results
    }

    async fn update_file(
        &self,
        org_id: i64,
        namespace: &str,
        file: FileTags,
        usage: Option<&UsageAccumulator>,
    ) -> FileResult {
        let FileTags { file_id, tag_ids } = file;

        let chunks_count = match lookup_chunks(
            self.dense.as_ref(),
            &self.limiter,
            self.max_chunks_per_file,
            org_id,
            namespace,
            &file_id,
        )
        .await
        {
            ChunkLookup::Found(count) => count,
            ChunkLookup::NotFound => {
                debug!(org_id, %file_id, "File has no chunks in the dense store");
                return FileResult::not_found(file_id);
            }
            ChunkLookup::Failed(err) => {
                warn!(org_id, %file_id, error = %err, "Could not resolve chunks for file");
                return FileResult::failed(file_id, None, err);
            }
        };

        let patch = tag_patch(&tag_ids);
        let mut handles = Vec::new();
        for id in chunk_ids(org_id, &file_id, chunks_count) {
            for store in [&self.dense, &self.sparse] {
                handles.push(self.spawn_update(
                    Arc::clone(store),
                    namespace,
                    id.clone(),
                    patch.clone(),
                ));
            }
        }

        let outcomes = join_all(handles).await;
        let mut succeeded = 0usize;
        let mut first_error: Option<String> = None;
        for outcome in outcomes {
            match outcome {
                Ok(Ok(())) => succeeded += 1,
                Ok(Err((kind, id, err))) => {
                    warn!(
                        org_id,
                        %file_id,
                        store = %kind,
                        chunk_id = %id,
                        error = %err,
                        "Chunk tag update failed"
                    );
                    first_error
                        .get_or_insert_with(|| format!("{kind} store, chunk '{id}': {err}"));
                }
                Err(join_err) => {
                    first_error.get_or_insert_with(|| AppError::from(join_err).to_string());
                }
            }
        }
        if let Some(usage) = usage {
            usage.record_store_writes(succeeded);
        }

        match first_error {
            None => {
                debug!(org_id, %file_id, chunks_count, "Propagated tags to both stores");
                FileResult::done(file_id, FileStatus::Updated, chunks_count)
            }
            Some(error) => {
                if succeeded > 0 {
                    warn!(
                        org_id,
                        %file_id,
                        succeeded,
                        "Stores hold mixed tag_ids for file until it is retried"
                    );
                }
                FileResult::failed(file_id, Some(chunks_count), error)
            }
        }
    }

    /// Spawned so a cancelled batch still lets started writes finish.
    fn spawn_update(
        &self,
        store: Arc<dyn VectorStore>,
        namespace: &str,
        id: String,
        patch: Metadata,
    ) -> tokio::task::JoinHandle<Result<(), (IndexKind, String, AppError)>> {
        let limiter = Arc::clone(&self.limiter);
        let namespace = namespace.to_string();
        tokio::spawn(async move {
            let kind = store.kind();
            let _permit = match limiter.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Err((
                        kind,
                        id,
                        AppError::InternalError("store request limiter closed".into()),
                    ))
                }
            };
            match store.update(&namespace, &id, patch).await {
                Ok(()) => Ok(()),
                Err(err) => Err((kind, id, err)),
            }
        })
    }
}
