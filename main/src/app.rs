use std::{collections::BTreeMap, path::Path, sync::Arc};

use anyhow::Context;
use common::{
    error::AppError,
    storage::{
        corpus_store::CorpusStore,
        pool::StorePools,
        store::StorageManager,
        types::term_frequency::{SurrealTermFrequencyRepository, TermFrequencyRepository},
        vector::{IndexKind, SurrealVectorStore, VectorStore},
    },
    utils::{
        config::AppConfig,
        usage::{UsageAccumulator, UsageSummary},
    },
};
use lifecycle_pipeline::{CorpusMaintenance, FileRemover, MetadataPropagator};
use retrieval_pipeline::{
    build_blocking_reranker, build_reranker, IdfCalculator, RerankCandidate, RerankOutcome,
};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::args::Command;

/// Every operation the binary exposes, wired to one set of stores.
pub struct App {
    config: AppConfig,
    propagator: MetadataPropagator,
    remover: FileRemover,
    corpus: CorpusMaintenance,
    idf: IdfCalculator,
}

impl App {
    pub fn new(
        config: AppConfig,
        pools: &StorePools,
        storage: StorageManager,
    ) -> Result<Self, AppError> {
        let dense: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new(
            Arc::clone(&pools.dense),
            IndexKind::Dense,
            config.dense_index_table.clone(),
        )?);
        let sparse: Arc<dyn VectorStore> = Arc::new(SurrealVectorStore::new(
            Arc::clone(&pools.sparse),
            IndexKind::Sparse,
            config.sparse_index_table.clone(),
        )?);
        let term_frequencies: Arc<dyn TermFrequencyRepository> = Arc::new(
            SurrealTermFrequencyRepository::new(Arc::clone(&pools.relational)),
        );
        let corpus = CorpusMaintenance::new(CorpusStore::new(storage));
        let max_inflight = config.max_inflight_store_requests;
        let max_chunks = config.max_chunks_per_file;

        Ok(Self {
            propagator: MetadataPropagator::new(
                Arc::clone(&dense),
                Arc::clone(&sparse),
                max_inflight,
            )
            .with_max_chunks_per_file(max_chunks),
            remover: FileRemover::new(
                dense,
                sparse,
                Arc::clone(&term_frequencies),
                corpus.clone(),
                max_inflight,
            )
            .with_max_chunks_per_file(max_chunks),
            corpus,
            idf: IdfCalculator::new(term_frequencies),
            config,
        })
    }

    pub async fn run(&self, command: Command) -> anyhow::Result<Value> {
        match command {
            Command::UpdateTags { org_id, files } => {
                let usage = UsageAccumulator::new(format!("update-tags:{org_id}"));
                let results = self
                    .propagator
                    .update_file_tags_with_usage(org_id, files, Some(&usage))
                    .await;
                Ok(json!({ "files": results, "usage": usage.finish() }))
            }
            Command::UpdateCorpus { org_id, file_ids } => {
                let report = self.corpus.update_corpus(&file_ids, org_id).await?;
                Ok(serde_json::to_value(report)?)
            }
            Command::RemoveFiles { org_id, file_ids } => {
                let report = self.remover.remove_files(org_id, &file_ids).await?;
                Ok(serde_json::to_value(report)?)
            }
            Command::Idf {
                org_id,
                query,
                file_ids,
            } => {
                let (idf, status) = self
                    .idf
                    .calculate_idf_with_status(&query, org_id, &file_ids)
                    .await;
                let idf: BTreeMap<String, f64> = idf.into_iter().collect();
                Ok(json!({ "idf": idf, "status": status }))
            }
            Command::Rerank {
                query,
                candidates,
                top_n,
                blocking,
            } => {
                let candidates = read_candidates(&candidates).await?;
                let (outcome, usage) = if blocking {
                    self.rerank_blocking(query, candidates, top_n).await?
                } else {
                    self.rerank(&query, candidates, top_n).await?
                };
                info!(
                    returned = outcome.candidates.len(),
                    dropped_empty = outcome.dropped_empty,
                    "Rerank finished"
                );
                Ok(json!({ "outcome": outcome, "usage": usage }))
            }
        }
    }

    async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
    ) -> anyhow::Result<(RerankOutcome, UsageSummary)> {
        let reranker = build_reranker(&self.config)?.context("reranking is disabled")?;
        let usage = UsageAccumulator::new("rerank");
        let outcome = reranker
            .rerank_with_usage(query, candidates, top_n, Some(&usage))
            .await?;
        Ok((outcome, usage.finish()))
    }

    /// The blocking client owns its own runtime, so it is built and used off the async workers.
    async fn rerank_blocking(
        &self,
        query: String,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
    ) -> anyhow::Result<(RerankOutcome, UsageSummary)> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<(RerankOutcome, UsageSummary)> {
            let reranker =
                build_blocking_reranker(&config)?.context("reranking is disabled")?;
            let usage = UsageAccumulator::new("rerank");
            let outcome = reranker.rerank_with_usage(&query, candidates, top_n, Some(&usage))?;
            Ok((outcome, usage.finish()))
        })
        .await?
    }
}

async fn read_candidates(path: &Path) -> anyhow::Result<Vec<RerankCandidate>> {
    let raw = if path == Path::new("-") {
        let mut buffer = String::new();
        tokio::io::stdin()
            .read_to_string(&mut buffer)
            .await
            .context("reading candidates from stdin")?;
        buffer
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading candidates from {}", path.display()))?
    };

    serde_json::from_str(&raw).context("parsing rerank candidates")
}
