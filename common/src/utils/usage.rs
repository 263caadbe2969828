use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Per-request usage accumulator.
///
/// Created by the caller for one logical unit of work and handed down by
/// reference. `finish` consumes it, so counts cannot leak into a later request.
#[derive(Debug, Default)]
pub struct UsageAccumulator {
    label: String,
    rerank_requests: AtomicU64,
    documents_scored: AtomicU64,
    store_writes: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageSummary {
    pub label: String,
    pub rerank_requests: u64,
    pub documents_scored: u64,
    pub store_writes: u64,
}

impl UsageAccumulator {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn record_rerank(&self, documents: usize) {
        self.rerank_requests.fetch_add(1, Ordering::Relaxed);
        self.documents_scored
            .fetch_add(u64::try_from(documents).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn record_store_writes(&self, writes: usize) {
        self.store_writes
            .fetch_add(u64::try_from(writes).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    pub fn finish(self) -> UsageSummary {
        UsageSummary {
            label: self.label,
            rerank_requests: self.rerank_requests.into_inner(),
            documents_scored: self.documents_scored.into_inner(),
            store_writes: self.store_writes.into_inner(),
        }
    }
}
