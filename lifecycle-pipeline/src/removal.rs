use std::sync::Arc;

use common::{
    error::AppError,
    storage::{
        addressing::{chunk_ids, namespace_for, DEFAULT_MAX_CHUNKS_PER_FILE},
        types::term_frequency::TermFrequencyRepository,
        vector::VectorStore,
    },
};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::{
    corpus::{CorpusMaintenance, CorpusUpdateReport},
    tagging::{lookup_chunks, ChunkLookup, FileResult, FileStatus},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemovalReport {
    pub files: Vec<FileResult>,
    pub archived_rows: usize,
    /// `None` when no file could be removed from the vector stores.
    pub corpus: Option<CorpusUpdateReport>,
}

/// Deletes files from both vector stores, the term-frequency table and the corpora.
pub struct FileRemover {
    dense: Arc<dyn VectorStore>,
    sparse: Arc<dyn VectorStore>,
    term_frequencies: Arc<dyn TermFrequencyRepository>,
    corpus: CorpusMaintenance,
    limiter: Arc<Semaphore>,
    max_chunks_per_file: u32,
}

impl FileRemover {
    pub fn new(
        dense: Arc<dyn VectorStore>,
        sparse: Arc<dyn VectorStore>,
        term_frequencies: Arc<dyn TermFrequencyRepository>,
        corpus: CorpusMaintenance,
        max_inflight: usize,
    ) -> Self {
        Self {
            dense,
            sparse,
            term_frequencies,
            corpus,
            limiter: Arc::new(Semaphore::new(max_inflight.max(1))),
            max_chunks_per_file: DEFAULT_MAX_CHUNKS_PER_FILE,
        }
    }

    #[must_use]
    pub fn with_max_chunks_per_file(mut self, max_chunks_per_file: u32) -> Self {
        self.max_chunks_per_file = max_chunks_per_file;
        self
    }

    /// Files whose chunks could not be deleted keep their term-frequency row
    /// and corpus contribution, so a retry sees a consistent file.
    #[instrument(skip_all, fields(org_id = org_id, files = file_ids.len()))]
    pub async fn remove_files(
        &self,
        org_id: i64,
        file_ids: &[String],
    ) -> Result<RemovalReport, AppError> {
        if file_ids.is_empty() {
            return Err(AppError::InvalidRequest(
                "remove_files needs at least one file id".into(),
            ));
        }

        let namespace = namespace_for(org_id);
        let files = join_all(
            file_ids
                .iter()
                .map(|file_id| self.remove_vectors(org_id, &namespace, file_id)),
        )
        .await;

        let settled: Vec<String> = files
            .iter()
            .filter(|result| result.status != FileStatus::Failed)
            .map(|result| result.file_id.clone())
            .collect();
        if settled.is_empty() {
            warn!(org_id, "No file could be removed from the vector stores");
            return Ok(RemovalReport {
                files,
                archived_rows: 0,
                corpus: None,
            });
        }

        let archived_rows = self.term_frequencies.archive(org_id, &settled).await?;
        let corpus = self.corpus.update_corpus(&settled, org_id).await?;
        info!(
            org_id,
            removed = settled.len(),
            archived_rows,
            "Removed files from index"
        );

        Ok(RemovalReport {
            files,
            archived_rows,
            corpus: Some(corpus),
        })
    }

    /// Sparse chunks go first, then dense chunks with chunk 1 last, so a failed
    /// attempt always leaves chunk 1 behind for the retry to find.
    async fn remove_vectors(&self, org_id: i64, namespace: &str, file_id: &str) -> FileResult {
        let chunks_count = match lookup_chunks(
            self.dense.as_ref(),
            &self.limiter,
            self.max_chunks_per_file,
            org_id,
            namespace,
            file_id,
        )
        .await
        {
            ChunkLookup::Found(count) => count,
            ChunkLookup::NotFound => return FileResult::not_found(file_id.to_string()),
            ChunkLookup::Failed(err) => return FileResult::failed(file_id.to_string(), None, err),
        };

        let ids = chunk_ids(org_id, file_id, chunks_count);
        let Some((first, rest)) = ids.split_first() else {
            return FileResult::not_found(file_id.to_string());
        };
        let steps = [
            (&self.sparse, ids.as_slice()),
            (&self.dense, rest),
            (&self.dense, std::slice::from_ref(first)),
        ];
        for (store, batch) in steps {
            if batch.is_empty() {
                continue;
            }
            if let Err(err) = self.delete_chunks(store.as_ref(), namespace, batch).await {
                warn!(
                    org_id,
                    %file_id,
                    store = %store.kind(),
                    error = %err,
                    "Chunk deletion failed"
                );
                return FileResult::failed(file_id.to_string(), Some(chunks_count), err);
            }
        }

        FileResult::done(file_id.to_string(), FileStatus::Removed, chunks_count)
    }

    async fn delete_chunks(
        &self,
        store: &dyn VectorStore,
        namespace: &str,
        ids: &[String],
    ) -> Result<usize, AppError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| AppError::InternalError("store request limiter closed".into()))?;
        store.delete(namespace, ids).await
    }
}
