//! Per-tenant lexical corpus: document frequencies, vocabulary and the
//! contributing documents grouped by partition.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CorpusKind {
    Content,
    Metadata,
}

impl CorpusKind {
    pub const ALL: [CorpusKind; 2] = [CorpusKind::Content, CorpusKind::Metadata];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for CorpusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What one file contributed to the corpus.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentEntry {
    pub terms: BTreeSet<String>,
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Corpus {
    /// Bumped by every save.
    #[serde(default)]
    pub version: u64,
    pub n_docs: u64,
    #[serde(default)]
    pub total_doc_len: u64,
    pub doc_freq: BTreeMap<String, u64>,
    /// Term to column index. Only grows, so sparse vectors built earlier stay valid.
    pub vocabulary: BTreeMap<String, u32>,
    #[serde(default)]
    pub documents: BTreeMap<String, BTreeMap<String, DocumentEntry>>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or replaces) the contribution of `file_id` under `partition_key`.
    #[must_use]
    pub fn add_document(
        mut self,
        partition_key: &str,
        file_id: &str,
        term_frequencies: &HashMap<String, u32>,
    ) -> Self {
        if let Some(previous) = self
            .documents
            .get_mut(partition_key)
            .and_then(|files| files.remove(file_id))
        {
            self.subtract(&previous);
        }

        let terms: BTreeSet<String> = term_frequencies
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(term, _)| term.clone())
            .collect();
        let length = term_frequencies
            .values()
            .map(|count| u64::from(*count))
            .sum();

        for term in &terms {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
            let next_index = u32::try_from(self.vocabulary.len()).unwrap_or(u32::MAX);
            self.vocabulary.entry(term.clone()).or_insert(next_index);
        }
        self.n_docs += 1;
        self.total_doc_len += length;
        self.documents
            .entry(partition_key.to_string())
            .or_default()
            .insert(file_id.to_string(), DocumentEntry { terms, length });

        self
    }

    fn subtract(&mut self, entry: &DocumentEntry) {
        for term in &entry.terms {
            if let Some(count) = self.doc_freq.get_mut(term) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }
        self.n_docs = self.n_docs.saturating_sub(1);
        self.total_doc_len = self.total_doc_len.saturating_sub(entry.length);
    }

    pub fn contains(&self, partition_key: &str, file_id: &str) -> bool {
        self.documents
            .get(partition_key)
            .is_some_and(|files| files.contains_key(file_id))
    }

    pub fn document_frequency(&self, term: &str) -> u64 {
        self.doc_freq.get(term).copied().unwrap_or(0)
    }

    pub fn avg_doc_len(&self) -> f64 {
        if self.n_docs == 0 {
            0.0
        } else {
            self.total_doc_len as f64 / self.n_docs as f64
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes, AppError> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AppError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Pure transforms over a loaded corpus. Persisting the result is the caller's job.
pub struct CorpusMutator;

impl CorpusMutator {
    /// Removes the contributions of `file_ids` found under `partition_key`.
    ///
    /// `n_docs` drops by the number of distinct ids that were present; unknown ids are ignored.
    pub fn delete(corpus: &Corpus, partition_key: &str, file_ids: &[String]) -> Corpus {
        let mut next = corpus.clone();
        let Some(files) = next.documents.get_mut(partition_key) else {
            return next;
        };

        let removed: Vec<DocumentEntry> = file_ids
            .iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .filter_map(|file_id| files.remove(file_id.as_str()))
            .collect();
        if files.is_empty() {
            next.documents.remove(partition_key);
        }

        for entry in &removed {
            next.subtract(entry);
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARTITION: &str = "org_id_7#";

    fn tf(pairs: &[(&str, u32)]) -> HashMap<String, u32> {
        pairs
            .iter()
            .map(|(term, count)| ((*term).to_string(), *count))
            .collect()
    }

    fn sample() -> Corpus {
        Corpus::new()
            .add_document(PARTITION, "f1", &tf(&[("rust", 2), ("async", 1)]))
            .add_document(PARTITION, "f2", &tf(&[("rust", 1), ("tokio", 3)]))
            .add_document(PARTITION, "f3", &tf(&[("index", 4)]))
    }

    #[test]
    fn test_add_document_tracks_frequencies_and_lengths() {
        let corpus = sample();
        assert_eq!(corpus.n_docs, 3);
        assert_eq!(corpus.document_frequency("rust"), 2);
        assert_eq!(corpus.document_frequency("tokio"), 1);
        assert_eq!(corpus.total_doc_len, 11);
        assert_eq!(corpus.vocabulary.len(), 4);
        assert!(corpus.contains(PARTITION, "f2"));
    }

    #[test]
    fn test_re_adding_a_document_replaces_its_contribution() {
        let corpus = sample().add_document(PARTITION, "f1", &tf(&[("async", 1)]));
        assert_eq!(corpus.n_docs, 3);
        assert_eq!(corpus.document_frequency("rust"), 1);
        assert_eq!(corpus.total_doc_len, 9);
    }

    #[test]
    fn test_delete_subtracts_present_documents_only() {
        let corpus = sample();
        let ids = vec!["f1".to_string(), "missing".to_string(), "f1".to_string()];
        let next = CorpusMutator::delete(&corpus, PARTITION, &ids);

        assert_eq!(next.n_docs, 2);
        assert_eq!(next.document_frequency("rust"), 1);
        assert_eq!(next.document_frequency("async"), 0);
        assert!(!next.doc_freq.contains_key("async"));
        assert_eq!(next.total_doc_len, 8);
        assert!(!next.contains(PARTITION, "f1"));
        // Vocabulary indices survive deletion.
        assert!(next.vocabulary.contains_key("async"));
        // Input is untouched.
        assert_eq!(corpus.n_docs, 3);
    }

    #[test]
    fn test_delete_is_idempotent_and_partition_scoped() {
        let corpus = sample();
        let ids = vec!["f3".to_string()];

        let once = CorpusMutator::delete(&corpus, PARTITION, &ids);
        let twice = CorpusMutator::delete(&once, PARTITION, &ids);
        assert_eq!(once, twice);

        let other_partition = CorpusMutator::delete(&corpus, "org_id_8#", &ids);
        assert_eq!(other_partition, corpus);
    }

    #[test]
    fn test_delete_from_forty_documents_leaves_thirty_nine() {
        let corpus = (0..40).fold(Corpus::new(), |corpus, n| {
            corpus.add_document(PARTITION, &format!("f{n}"), &tf(&[("term", 1)]))
        });
        assert_eq!(corpus.n_docs, 40);

        let next = CorpusMutator::delete(&corpus, PARTITION, &["f9".to_string()]);
        assert_eq!(next.n_docs, 39);
        assert_eq!(next.document_frequency("term"), 39);
        assert!((next.avg_doc_len() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_bytes_round_trip_preserves_version() {
        let mut corpus = sample();
        corpus.version = 4;
        let bytes = corpus.to_bytes().expect("serialize");
        let restored = Corpus::from_bytes(&bytes).expect("deserialize");
        assert_eq!(restored, corpus);
        assert!(Corpus::from_bytes(b"{").is_err());
    }

    #[test]
    fn test_kind_renders_lowercase() {
        assert_eq!(CorpusKind::Content.to_string(), "content");
        assert_eq!(
            serde_json::to_string(&CorpusKind::Metadata).expect("serialize"),
            "\"metadata\""
        );
    }
}
