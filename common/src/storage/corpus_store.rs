use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::{
    error::AppError,
    storage::{
        store::StorageManager,
        types::corpus::{Corpus, CorpusKind},
    },
};

type LockKey = (i64, CorpusKind);

/// Async locks keyed by tenant and corpus kind.
///
/// Entries are dropped again once nobody holds or waits for them.
#[derive(Default)]
pub struct CorpusLocks {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl CorpusLocks {
    pub async fn lock(self: &Arc<Self>, org_id: i64, kind: CorpusKind) -> CorpusGuard {
        let key = (org_id, kind);
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(key).or_default())
        };
        let guard = Arc::clone(&lock).lock_owned().await;

        CorpusGuard {
            key,
            guard: Some(guard),
            lock,
            locks: Arc::clone(self),
        }
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Exclusive right to rewrite one tenant's corpus of one kind.
pub struct CorpusGuard {
    key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
    lock: Arc<AsyncMutex<()>>,
    locks: Arc<CorpusLocks>,
}

impl CorpusGuard {
    pub fn org_id(&self) -> i64 {
        self.key.0
    }

    pub fn kind(&self) -> CorpusKind {
        self.key.1
    }
}

impl Drop for CorpusGuard {
    fn drop(&mut self) {
        self.guard.take();

        let mut locks = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this guard are the only owners left.
        let idle = locks
            .get(&self.key)
            .is_some_and(|entry| Arc::ptr_eq(entry, &self.lock) && Arc::strong_count(entry) == 2);
        if idle {
            locks.remove(&self.key);
        }
    }
}

/// Reads and replaces whole corpus blobs, one per tenant and kind.
#[derive(Clone)]
pub struct CorpusStore {
    storage: StorageManager,
    locks: Arc<CorpusLocks>,
}

impl CorpusStore {
    pub fn new(storage: StorageManager) -> Self {
        Self {
            storage,
            locks: Arc::new(CorpusLocks::default()),
        }
    }

    pub fn location(org_id: i64, kind: CorpusKind) -> String {
        format!("corpora/org_id_{org_id}/{kind}.json")
    }

    /// Serializes read-modify-write cycles on one corpus within this process.
    pub async fn lock(&self, org_id: i64, kind: CorpusKind) -> CorpusGuard {
        self.locks.lock(org_id, kind).await
    }

    pub fn locks(&self) -> &CorpusLocks {
        &self.locks
    }

    pub async fn load(&self, org_id: i64, kind: CorpusKind) -> Result<Option<Corpus>, AppError> {
        let location = Self::location(org_id, kind);
        match self.storage.get_opt(&location).await? {
            Some(bytes) => Ok(Some(Corpus::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Full-object replace of the corpus `guard` covers. Returns the version that was written.
    ///
    /// `corpus.version` must match the stored version (0 when nothing is stored yet),
    /// otherwise it was derived from an outdated copy and `StaleCorpus` is returned.
    pub async fn save(&self, guard: &CorpusGuard, corpus: &Corpus) -> Result<u64, AppError> {
        let (org_id, kind) = (guard.org_id(), guard.kind());
        let stored = self
            .load(org_id, kind)
            .await?
            .map_or(0, |current| current.version);
        if stored != corpus.version {
            return Err(AppError::StaleCorpus {
                org_id,
                kind,
                expected: corpus.version,
                found: stored,
            });
        }

        let mut stamped = corpus.clone();
        stamped.version = corpus.version + 1;

        let location = Self::location(org_id, kind);
        self.storage.put(&location, stamped.to_bytes()?).await?;
        debug!(org_id, %kind, version = stamped.version, n_docs = stamped.n_docs, "Saved corpus");
        Ok(stamped.version)
    }
}
