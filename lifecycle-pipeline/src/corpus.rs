use common::{
    error::AppError,
    storage::{
        addressing::namespace_for,
        corpus_store::CorpusStore,
        types::corpus::{CorpusKind, CorpusMutator},
    },
};
use serde::Serialize;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct KindUpdate {
    pub kind: CorpusKind,
    pub n_docs_before: u64,
    pub n_docs_after: u64,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CorpusUpdateReport {
    pub org_id: i64,
    pub content: KindUpdate,
    pub metadata: KindUpdate,
}

/// Keeps the persisted corpora in step with file deletions.
#[derive(Clone)]
pub struct CorpusMaintenance {
    store: CorpusStore,
}

impl CorpusMaintenance {
    pub fn new(store: CorpusStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CorpusStore {
        &self.store
    }

    /// Removes `file_ids` from the content corpus, then from the metadata corpus.
    ///
    /// If the content corpus was saved but the metadata one failed, the error is
    /// `PartialCorpusUpdate`; calling again with the same ids is safe.
    #[instrument(skip_all, fields(org_id = org_id, files = file_ids.len()))]
    pub async fn update_corpus(
        &self,
        file_ids: &[String],
        org_id: i64,
    ) -> Result<CorpusUpdateReport, AppError> {
        if file_ids.is_empty() {
            return Err(AppError::InvalidRequest(
                "update_corpus needs at least one file id".into(),
            ));
        }

        let content = self
            .update_kind(org_id, CorpusKind::Content, file_ids)
            .await?;
        let metadata = self
            .update_kind(org_id, CorpusKind::Metadata, file_ids)
            .await
            .map_err(|err| AppError::PartialCorpusUpdate {
                org_id,
                updated: CorpusKind::Content,
                failed: CorpusKind::Metadata,
                source: Box::new(err),
            })?;

        Ok(CorpusUpdateReport {
            org_id,
            content,
            metadata,
        })
    }

    async fn update_kind(
        &self,
        org_id: i64,
        kind: CorpusKind,
        file_ids: &[String],
    ) -> Result<KindUpdate, AppError> {
        let guard = self.store.lock(org_id, kind).await;

        let corpus = self
            .store
            .load(org_id, kind)
            .await?
            .ok_or(AppError::CorpusMissing { org_id, kind })?;
        let updated = CorpusMutator::delete(&corpus, &namespace_for(org_id), file_ids);
        let version = self.store.save(&guard, &updated).await?;

        info!(
            org_id,
            %kind,
            n_docs_before = corpus.n_docs,
            n_docs_after = updated.n_docs,
            version,
            "Updated corpus"
        );

        Ok(KindUpdate {
            kind,
            n_docs_before: corpus.n_docs,
            n_docs_after: updated.n_docs,
            version,
        })
    }
}
