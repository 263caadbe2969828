//! Cross-encoder reranking: backends score texts, `Reranker` merges the scores
//! back onto the candidates.

mod pool;
mod service;

use std::sync::Arc;

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{
        config::{AppConfig, RerankBackend},
        usage::UsageAccumulator,
    },
};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

pub use pool::{LocalRerankService, RerankerLease, RerankerPool};
pub use service::{BlockingHttpRerankService, HttpRerankService};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RerankCandidate {
    pub id: String,
    pub text: String,
    pub original_score: f32,
    #[serde(default)]
    pub rerank_score: Option<f32>,
}

impl RerankCandidate {
    pub fn new(id: impl Into<String>, text: impl Into<String>, original_score: f32) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            original_score,
            rerank_score: None,
        }
    }
}

/// One scored entry; `index` points into the submitted documents.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RerankScore {
    pub index: usize,
    pub relevance_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RerankOutcome {
    pub candidates: Vec<RerankCandidate>,
    /// Candidates removed because they had no text to score.
    pub dropped_empty: usize,
}

#[async_trait]
pub trait RerankService: Send + Sync {
    async fn score(
        &self,
        query: &str,
        documents: Vec<String>,
        top_n: usize,
    ) -> Result<Vec<RerankScore>, AppError>;
}

pub trait BlockingRerankService: Send + Sync {
    fn score_blocking(
        &self,
        query: &str,
        documents: Vec<String>,
        top_n: usize,
    ) -> Result<Vec<RerankScore>, AppError>;
}

/// Candidates with text, in submission order, plus where each came from.
struct Submission {
    texts: Vec<String>,
    origins: Vec<usize>,
    dropped_empty: usize,
}

enum Plan {
    /// Nothing to score; hand the input back untouched.
    Passthrough,
    Submit(Submission),
}

fn plan(candidates: &[RerankCandidate]) -> Plan {
    if candidates.is_empty() {
        return Plan::Passthrough;
    }

    let mut texts = Vec::with_capacity(candidates.len());
    let mut origins = Vec::with_capacity(candidates.len());
    for (position, candidate) in candidates.iter().enumerate() {
        if !candidate.text.is_empty() {
            texts.push(candidate.text.clone());
            origins.push(position);
        }
    }

    if texts.is_empty() {
        return Plan::Passthrough;
    }
    let dropped_empty = candidates.len() - texts.len();
    Plan::Submit(Submission {
        texts,
        origins,
        dropped_empty,
    })
}

/// Attaches scores to their candidates, best first, at most `top_n`.
fn merge(
    candidates: Vec<RerankCandidate>,
    origins: &[usize],
    scores: Vec<RerankScore>,
    top_n: usize,
) -> Vec<RerankCandidate> {
    let mut slots: Vec<Option<RerankCandidate>> = candidates.into_iter().map(Some).collect();
    let mut ranked = Vec::with_capacity(scores.len().min(top_n));

    for score in scores {
        let Some(candidate) = origins
            .get(score.index)
            .and_then(|origin| slots.get_mut(*origin))
            .and_then(Option::take)
        else {
            warn!(
                index = score.index,
                submitted = origins.len(),
                "Ignoring rerank result with unknown or repeated index"
            );
            continue;
        };
        ranked.push(RerankCandidate {
            rerank_score: Some(score.relevance_score),
            ..candidate
        });
    }

    // Stable: equal scores keep the order the service returned them in.
    ranked.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    ranked.truncate(top_n);
    ranked
}

fn record_usage(usage: Option<&UsageAccumulator>, documents: usize) {
    if let Some(usage) = usage {
        usage.record_rerank(documents);
    }
}

/// Async reranking over any `RerankService`.
#[derive(Clone)]
pub struct Reranker {
    service: Arc<dyn RerankService>,
}

impl Reranker {
    pub fn new(service: Arc<dyn RerankService>) -> Self {
        Self { service }
    }

    pub async fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
    ) -> Result<RerankOutcome, AppError> {
        self.rerank_with_usage(query, candidates, top_n, None).await
    }

    #[instrument(skip_all, fields(candidates = candidates.len(), top_n = top_n))]
    pub async fn rerank_with_usage(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
        usage: Option<&UsageAccumulator>,
    ) -> Result<RerankOutcome, AppError> {
        let submission = match plan(&candidates) {
            Plan::Passthrough => {
                debug!("No rerankable text; returning candidates unchanged");
                return Ok(RerankOutcome {
                    candidates,
                    dropped_empty: 0,
                });
            }
            Plan::Submit(submission) => submission,
        };

        let requested = top_n.min(submission.texts.len());
        let documents = submission.texts.len();
        let scores = self
            .service
            .score(query, submission.texts, requested)
            .await?;
        record_usage(usage, documents);

        Ok(RerankOutcome {
            candidates: merge(candidates, &submission.origins, scores, top_n),
            dropped_empty: submission.dropped_empty,
        })
    }
}

/// Same contract as `Reranker` for callers without an async runtime.
#[derive(Clone)]
pub struct BlockingReranker {
    service: Arc<dyn BlockingRerankService>,
}

impl BlockingReranker {
    pub fn new(service: Arc<dyn BlockingRerankService>) -> Self {
        Self { service }
    }

    pub fn rerank(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
    ) -> Result<RerankOutcome, AppError> {
        self.rerank_with_usage(query, candidates, top_n, None)
    }

    pub fn rerank_with_usage(
        &self,
        query: &str,
        candidates: Vec<RerankCandidate>,
        top_n: usize,
        usage: Option<&UsageAccumulator>,
    ) -> Result<RerankOutcome, AppError> {
        let submission = match plan(&candidates) {
            Plan::Passthrough => {
                return Ok(RerankOutcome {
                    candidates,
                    dropped_empty: 0,
                })
            }
            Plan::Submit(submission) => submission,
        };

        let requested = top_n.min(submission.texts.len());
        let documents = submission.texts.len();
        let scores = self
            .service
            .score_blocking(query, submission.texts, requested)?;
        record_usage(usage, documents);

        Ok(RerankOutcome {
            candidates: merge(candidates, &submission.origins, scores, top_n),
            dropped_empty: submission.dropped_empty,
        })
    }
}

/// Builds the configured async backend, or `None` when reranking is disabled.
pub fn build_reranker(config: &AppConfig) -> Result<Option<Reranker>, AppError> {
    let service: Arc<dyn RerankService> = match config.rerank_backend {
        RerankBackend::Disabled => return Ok(None),
        RerankBackend::Service => Arc::new(HttpRerankService::from_config(config)?),
        RerankBackend::Local => {
            Arc::new(LocalRerankService::new(RerankerPool::from_config(config)?))
        }
    };
    Ok(Some(Reranker::new(service)))
}

/// Blocking counterpart of `build_reranker`. Only the remote service has a blocking client.
pub fn build_blocking_reranker(config: &AppConfig) -> Result<Option<BlockingReranker>, AppError> {
    match config.rerank_backend {
        RerankBackend::Disabled => Ok(None),
        RerankBackend::Service => Ok(Some(BlockingReranker::new(Arc::new(
            BlockingHttpRerankService::from_config(config)?,
        )))),
        RerankBackend::Local => Err(AppError::Validation(
            "the local rerank backend has no blocking interface".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    /// Scores each document by its length and records what it was sent.
    #[derive(Default)]
    struct LengthScorer {
        requests: Mutex<Vec<(Vec<String>, usize)>>,
        extra: Vec<RerankScore>,
    }

    fn length_scores(
        documents: &[String],
        top_n: usize,
        extra: &[RerankScore],
    ) -> Vec<RerankScore> {
        let mut scores: Vec<RerankScore> = documents
            .iter()
            .enumerate()
            .map(|(index, text)| RerankScore {
                index,
                relevance_score: text.len() as f32,
            })
            .collect();
        scores.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        scores.truncate(top_n);
        scores.extend_from_slice(extra);
        scores
    }

    #[async_trait]
    impl RerankService for LengthScorer {
        async fn score(
            &self,
            _query: &str,
            documents: Vec<String>,
            top_n: usize,
        ) -> Result<Vec<RerankScore>, AppError> {
            let scores = length_scores(&documents, top_n, &self.extra);
            self.requests.lock().await.push((documents, top_n));
            Ok(scores)
        }
    }

    impl BlockingRerankService for LengthScorer {
        fn score_blocking(
            &self,
            _query: &str,
            documents: Vec<String>,
            top_n: usize,
        ) -> Result<Vec<RerankScore>, AppError> {
            Ok(length_scores(&documents, top_n, &self.extra))
        }
    }

    struct FailingService;

    #[async_trait]
    impl RerankService for FailingService {
        async fn score(
            &self,
            _query: &str,
            _documents: Vec<String>,
            _top_n: usize,
        ) -> Result<Vec<RerankScore>, AppError> {
            Err(AppError::RerankServiceFailure("upstream 503".into()))
        }
    }

    fn ten_candidates() -> Vec<RerankCandidate> {
        (0..10)
            .map(|n| {
                let text = if n == 3 || n == 7 {
                    String::new()
                } else {
                    "x".repeat(n + 1)
                };
                RerankCandidate::new(format!("c{n}"), text, 1.0 - n as f32 / 10.0)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_returns_top_n_descending_without_empty_texts() {
        let service = Arc::new(LengthScorer::default());
        let reranker = Reranker::new(service.clone());

        let outcome = reranker
            .rerank("query", ten_candidates(), 5)
            .await
            .expect("rerank");

        assert_eq!(outcome.dropped_empty, 2);
        assert_eq!(outcome.candidates.len(), 5);
        let ids: Vec<&str> = outcome.candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c9", "c8", "c6", "c5", "c4"]);
        assert!(outcome
            .candidates
            .windows(2)
            .all(|pair| pair[0].rerank_score > pair[1].rerank_score));
        assert!(outcome.candidates.iter().all(|c| !c.text.is_empty()));
        assert_eq!(outcome.candidates[0].original_score, 1.0 - 9.0 / 10.0);

        let requests = service.requests.lock().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].0.len(), 8);
        assert_eq!(requests[0].1, 5);
    }

    #[tokio::test]
    async fn test_empty_or_textless_input_is_returned_unchanged() {
        let service = Arc::new(LengthScorer::default());
        let reranker = Reranker::new(service.clone());

        let empty = reranker.rerank("q", Vec::new(), 3).await.expect("rerank");
        assert!(empty.candidates.is_empty());

        let textless = vec![
            RerankCandidate::new("a", "", 0.4),
            RerankCandidate::new("b", "", 0.2),
        ];
        let outcome = reranker
            .rerank("q", textless.clone(), 3)
            .await
            .expect("rerank");
        assert_eq!(outcome.candidates, textless);
        assert_eq!(outcome.dropped_empty, 0);
        assert!(service.requests.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_whitespace_only_text_is_still_scored() {
        let service = Arc::new(LengthScorer::default());
        let reranker = Reranker::new(service.clone());

        let candidates = vec![
            RerankCandidate::new("blank", "   ", 0.1),
            RerankCandidate::new("empty", "", 0.3),
            RerankCandidate::new("word", "w", 0.2),
        ];
        let outcome = reranker.rerank("q", candidates, 3).await.expect("rerank");

        assert_eq!(outcome.dropped_empty, 1);
        let ids: Vec<&str> = outcome.candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["blank", "word"]);

        let requests = service.requests.lock().await;
        assert_eq!(requests[0].0, vec!["   ".to_string(), "w".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_and_repeated_indices_are_skipped() {
        let service = Arc::new(LengthScorer {
            extra: vec![
                RerankScore {
                    index: 42,
                    relevance_score: 100.0,
                },
                RerankScore {
                    index: 0,
                    relevance_score: 99.0,
                },
            ],
            ..LengthScorer::default()
        });
        let candidates = vec![
            RerankCandidate::new("short", "ab", 0.0),
            RerankCandidate::new("long", "abcd", 0.0),
        ];

        let outcome = Reranker::new(service)
            .rerank("q", candidates, 10)
            .await
            .expect("rerank");
        let ids: Vec<&str> = outcome.candidates.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["long", "short"]);
        assert_eq!(outcome.candidates[1].rerank_score, Some(2.0));
    }

    #[tokio::test]
    async fn test_service_errors_are_raised() {
        let reranker = Reranker::new(Arc::new(FailingService));
        let usage = UsageAccumulator::new("failing");
        let result = reranker
            .rerank_with_usage(
                "q",
                vec![RerankCandidate::new("a", "text", 0.1)],
                1,
                Some(&usage),
            )
            .await;
        assert!(matches!(result, Err(AppError::RerankServiceFailure(_))));
        assert_eq!(usage.finish().rerank_requests, 0);
    }

    #[tokio::test]
    async fn test_blocking_variant_matches_async() {
        let service = Arc::new(LengthScorer::default());
        let async_outcome = Reranker::new(service.clone())
            .rerank("q", ten_candidates(), 4)
            .await
            .expect("async");

        let blocking = BlockingReranker::new(service);
        let usage = UsageAccumulator::new("blocking");
        let blocking_outcome = blocking
            .rerank_with_usage("q", ten_candidates(), 4, Some(&usage))
            .expect("blocking");

        assert_eq!(async_outcome, blocking_outcome);
        let summary = usage.finish();
        assert_eq!(summary.rerank_requests, 1);
        assert_eq!(summary.documents_scored, 8);
    }

    #[test]
    fn test_disabled_backend_builds_nothing() {
        let config = AppConfig {
            rerank_backend: RerankBackend::Disabled,
            ..AppConfig::default()
        };
        assert!(build_reranker(&config).expect("build").is_none());
        assert!(build_blocking_reranker(&config).expect("build").is_none());

        let local = AppConfig {
            rerank_backend: RerankBackend::Local,
            ..AppConfig::default()
        };
        assert!(matches!(
            build_blocking_reranker(&local),
            Err(AppError::Validation(_))
        ));
    }
}
