use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread::available_parallelism,
};

use async_trait::async_trait;
use common::{error::AppError, utils::config::AppConfig};
use fastembed::{RerankInitOptions, TextRerank};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use super::{RerankScore, RerankService};

/// Fixed set of in-process cross-encoders.
pub struct RerankerPool {
    engines: Vec<Arc<Mutex<TextRerank>>>,
    semaphore: Arc<Semaphore>,
    next_engine: AtomicUsize,
}

impl RerankerPool {
    /// `pool_size` engines are loaded up front; it is also the parallelism cap.
    pub fn new(pool_size: usize, init_options: RerankInitOptions) -> Result<Arc<Self>, AppError> {
        if pool_size == 0 {
            return Err(AppError::Validation(
                "reranking_pool_size must be greater than zero".to_string(),
            ));
        }

        fs::create_dir_all(&init_options.cache_dir)?;

        let mut engines = Vec::with_capacity(pool_size);
        for slot in 0..pool_size {
            debug!(slot, "Loading cross-encoder");
            let model = TextRerank::try_new(init_options.clone())
                .map_err(|e| AppError::InternalError(e.to_string()))?;
            engines.push(Arc::new(Mutex::new(model)));
        }

        Ok(Arc::new(Self {
            engines,
            semaphore: Arc::new(Semaphore::new(pool_size)),
            next_engine: AtomicUsize::new(0),
        }))
    }

    pub fn from_config(config: &AppConfig) -> Result<Arc<Self>, AppError> {
        let pool_size = config.reranking_pool_size.unwrap_or_else(default_pool_size);
        Self::new(pool_size, init_options(config)?)
    }

    /// Waits for capacity, then hands out engines round-robin.
    pub async fn checkout(self: &Arc<Self>) -> Result<RerankerLease, AppError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::InternalError("reranker pool closed".into()))?;

        let index = self.next_engine.fetch_add(1, Ordering::Relaxed) % self.engines.len();
        Ok(RerankerLease {
            _permit: permit,
            engine: Arc::clone(&self.engines[index]),
        })
    }
}

fn default_pool_size() -> usize {
    available_parallelism()
        .map(|value| value.get().min(2))
        .unwrap_or(2)
        .max(1)
}

fn init_options(config: &AppConfig) -> Result<RerankInitOptions, AppError> {
    let mut options = RerankInitOptions::default();

    let cache_dir = config.fastembed_cache_dir.as_ref().map_or_else(
        || Path::new(&config.data_dir).join("fastembed").join("reranker"),
        PathBuf::from,
    );
    fs::create_dir_all(&cache_dir)?;
    options.cache_dir = cache_dir;
    options.show_download_progress = config.fastembed_show_download_progress.unwrap_or(false);
    if let Some(max_length) = config.fastembed_max_length {
        options.max_length = max_length;
    }

    Ok(options)
}

/// Exclusive use of one engine until dropped.
pub struct RerankerLease {
    _permit: OwnedSemaphorePermit,
    engine: Arc<Mutex<TextRerank>>,
}

impl RerankerLease {
    /// Runs inference on the blocking thread pool.
    pub async fn score(
        &self,
        query: &str,
        documents: Vec<String>,
    ) -> Result<Vec<RerankScore>, AppError> {
        let engine = Arc::clone(&self.engine);
        let query = query.to_owned();

        let results = tokio::task::spawn_blocking(move || {
            let mut guard = engine.blocking_lock();
            guard.rerank(query, documents, false, None)
        })
        .await?
        .map_err(|e| AppError::RerankServiceFailure(e.to_string()))?;

        Ok(results
            .into_iter()
            .map(|result| RerankScore {
                index: result.index,
                relevance_score: result.score,
            })
            .collect())
    }
}

/// `RerankService` backed by the local pool.
pub struct LocalRerankService {
    pool: Arc<RerankerPool>,
}

impl LocalRerankService {
    pub fn new(pool: Arc<RerankerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RerankService for LocalRerankService {
    async fn score(
        &self,
        query: &str,
        documents: Vec<String>,
        top_n: usize,
    ) -> Result<Vec<RerankScore>, AppError> {
        let lease = self.pool.checkout().await?;
        let mut scores = lease.score(query, documents).await?;
        scores.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        scores.truncate(top_n);
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_sized_pool_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut options = RerankInitOptions::default();
        options.cache_dir = dir.path().to_path_buf();
        assert!(matches!(
            RerankerPool::new(0, options),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_init_options_follow_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig {
            data_dir: dir.path().to_string_lossy().into_owned(),
            fastembed_max_length: Some(256),
            ..AppConfig::default()
        };

        let options = init_options(&config).expect("options");
        assert_eq!(
            options.cache_dir,
            dir.path().join("fastembed").join("reranker")
        );
        assert!(options.cache_dir.exists());
        assert_eq!(options.max_length, 256);
        assert!(!options.show_download_progress);

        let custom = dir.path().join("models");
        let config = AppConfig {
            fastembed_cache_dir: Some(custom.to_string_lossy().into_owned()),
            ..config
        };
        assert_eq!(init_options(&config).expect("options").cache_dir, custom);
    }

    #[test]
    fn test_default_pool_size_is_small_and_positive() {
        let size = default_pool_size();
        assert!((1..=2).contains(&size));
    }
}
