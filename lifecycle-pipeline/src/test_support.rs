use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::vector::{
        IndexKind, Metadata, QueryMatch, QueryRequest, VectorRecord, VectorStore,
    },
};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Fetch(Vec<String>),
    Update(String),
    Delete(Vec<String>),
}

/// Counts concurrently running updates, usually shared by both mock stores.
#[derive(Default)]
pub struct InflightGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

impl InflightGauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

/// In-memory `VectorStore` that records every call and can be told to fail.
pub struct MockVectorStore {
    kind: IndexKind,
    records: Mutex<HashMap<(String, String), Metadata>>,
    calls: Mutex<Vec<(String, StoreCall)>>,
    failing_updates: Mutex<HashSet<String>>,
    failing_deletes: Mutex<usize>,
    fail_fetch: Mutex<bool>,
    update_delay: Option<Duration>,
    gauge: Option<Arc<InflightGauge>>,
    update_started: Notify,
}

impl MockVectorStore {
    pub fn new(kind: IndexKind) -> Self {
        Self {
            kind,
            records: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failing_updates: Mutex::new(HashSet::new()),
            failing_deletes: Mutex::new(0),
            fail_fetch: Mutex::new(false),
            update_delay: None,
            gauge: None,
            update_started: Notify::new(),
        }
    }

    /// Every update sleeps this long before it is applied.
    pub fn with_update_delay(mut self, delay: Duration) -> Self {
        self.update_delay = Some(delay);
        self
    }

    pub fn with_gauge(mut self, gauge: Arc<InflightGauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Resolves once an update has started on this store.
    pub async fn update_started(&self) {
        self.update_started.notified().await;
    }

    pub async fn seed(&self, namespace: &str, id: &str, metadata: Value) {
        let metadata = match metadata {
            Value::Object(map) => map,
            other => panic!("expected object metadata, got {other}"),
        };
        self.records
            .lock()
            .await
            .insert((namespace.to_string(), id.to_string()), metadata);
    }

    /// Seeds chunks `1..=count` of a file; chunk 1 carries `chunks_count`.
    pub async fn seed_file(&self, namespace: &str, org_id: i64, file_id: &str, count: u32) {
        for n in 1..=count {
            let mut metadata = serde_json::json!({"tag_ids": ["9"], "title": file_id});
            if n == 1 {
                metadata["chunks_count"] = serde_json::json!(count);
            }
            self.seed(namespace, &format!("{org_id}#{file_id}#{n}"), metadata)
                .await;
        }
    }

    pub async fn fail_update_of(&self, id: &str) {
        self.failing_updates.lock().await.insert(id.to_string());
    }

    /// The next `count` delete calls fail without removing anything.
    pub async fn fail_next_deletes(&self, count: usize) {
        *self.failing_deletes.lock().await = count;
    }

    pub async fn fail_fetches(&self) {
        *self.fail_fetch.lock().await = true;
    }

    pub async fn metadata(&self, namespace: &str, id: &str) -> Option<Metadata> {
        self.records
            .lock()
            .await
            .get(&(namespace.to_string(), id.to_string()))
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn calls(&self) -> Vec<(String, StoreCall)> {
        self.calls.lock().await.clone()
    }

    async fn record(&self, namespace: &str, call: StoreCall) {
        self.calls.lock().await.push((namespace.to_string(), call));
    }
}

#[async_trait]
impl VectorStore for MockVectorStore {
    fn kind(&self) -> IndexKind {
        self.kind
    }

    async fn fetch(
        &self,
        namespace: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Metadata>, AppError> {
        self.record(namespace, StoreCall::Fetch(ids.to_vec())).await;
        if *self.fail_fetch.lock().await {
            return Err(AppError::StoreUnavailable(format!("{} fetch refused", self.kind)));
        }

        let records = self.records.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                records
                    .get(&(namespace.to_string(), id.clone()))
                    .map(|metadata| (id.clone(), metadata.clone()))
            })
            .collect())
    }

    async fn update(
        &self,
        namespace: &str,
        id: &str,
        set_metadata: Metadata,
    ) -> Result<(), AppError> {
        self.record(namespace, StoreCall::Update(id.to_string())).await;
        if self.failing_updates.lock().await.contains(id) {
            return Err(AppError::StoreUnavailable(format!(
                "{} update of {id} refused",
                self.kind
            )));
        }

        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        self.update_started.notify_one();
        if let Some(delay) = self.update_delay {
            tokio::time::sleep(delay).await;
        }

        let applied = {
            let mut records = self.records.lock().await;
            match records.get_mut(&(namespace.to_string(), id.to_string())) {
                Some(existing) => {
                    existing.extend(set_metadata);
                    Ok(())
                }
                None => Err(AppError::NotFound(id.to_string())),
            }
        };
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        applied
    }

    async fn query(
        &self,
        _namespace: &str,
        _request: QueryRequest,
    ) -> Result<Vec<QueryMatch>, AppError> {
        Ok(Vec::new())
    }

    async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, AppError> {
        let count = records.len();
        let mut stored = self.records.lock().await;
        for record in records {
            stored.insert((namespace.to_string(), record.id), record.metadata);
        }
        Ok(count)
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<usize, AppError> {
        self.record(namespace, StoreCall::Delete(ids.to_vec())).await;
        {
            let mut failing = self.failing_deletes.lock().await;
            if *failing > 0 {
                *failing -= 1;
                return Err(AppError::StoreUnavailable(format!(
                    "{} delete refused",
                    self.kind
                )));
            }
        }

        let mut records = self.records.lock().await;
        Ok(ids
            .iter()
            .filter(|id| {
                records
                    .remove(&(namespace.to_string(), (*id).clone()))
                    .is_some()
            })
            .count())
    }
}
