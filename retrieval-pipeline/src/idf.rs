//! Inverse document frequency over an explicit set of files.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use common::{storage::types::term_frequency::TermFrequencyRepository, utils::text::term_set};
use serde::Serialize;
use tracing::{debug, instrument, warn};

/// Why an IDF map came back the way it did. Callers only ever see the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IdfStatus {
    EmptyInput,
    NoRows,
    Computed { records: usize },
    StoreError { message: String },
    QueryError { message: String },
    ParseError { file_id: String, message: String },
}

/// `ln((N - df + 0.5) / (df + 0.5) + 1)`, never negative.
pub fn smoothed_idf(n_docs: usize, doc_freq: usize) -> f64 {
    let n = n_docs as f64;
    let df = doc_freq.min(n_docs) as f64;
    ((n - df + 0.5) / (df + 0.5) + 1.0).ln().max(0.0)
}

pub struct IdfCalculator {
    repository: Arc<dyn TermFrequencyRepository>,
}

impl IdfCalculator {
    pub fn new(repository: Arc<dyn TermFrequencyRepository>) -> Self {
        Self { repository }
    }

    /// IDF for each query term against the active rows of `file_ids`.
    ///
    /// Never fails: an empty map means no lexical signal is available.
    pub async fn calculate_idf(
        &self,
        query: &str,
        org_id: i64,
        file_ids: &[String],
    ) -> HashMap<String, f64> {
        self.calculate_idf_with_status(query, org_id, file_ids)
            .await
            .0
    }

    #[instrument(skip_all, fields(org_id = org_id, files = file_ids.len()))]
    pub async fn calculate_idf_with_status(
        &self,
        query: &str,
        org_id: i64,
        file_ids: &[String],
    ) -> (HashMap<String, f64>, IdfStatus) {
        if file_ids.is_empty() {
            return (HashMap::new(), IdfStatus::EmptyInput);
        }
        let terms = match term_set(query) {
            Ok(terms) => terms,
            Err(err) => {
                warn!(org_id, error = %err, "Could not tokenize query");
                return (
                    HashMap::new(),
                    IdfStatus::QueryError {
                        message: err.to_string(),
                    },
                );
            }
        };

        let records = match self.repository.fetch_active(org_id, file_ids).await {
            Ok(records) => records,
            Err(err) => {
                warn!(org_id, error = %err, "Term frequency fetch failed; no lexical signal");
                return (
                    HashMap::new(),
                    IdfStatus::StoreError {
                        message: err.to_string(),
                    },
                );
            }
        };
        if records.is_empty() {
            debug!(org_id, "No active term frequency rows for requested files");
            return (HashMap::new(), IdfStatus::NoRows);
        }

        let mut doc_freq: HashMap<String, usize> = HashMap::new();
        for record in &records {
            let frequencies = match record.parse_frequencies() {
                Ok(frequencies) => frequencies,
                Err(err) => {
                    warn!(
                        org_id,
                        file_id = %record.file_id,
                        error = %err,
                        "Malformed term frequency row"
                    );
                    return (
                        HashMap::new(),
                        IdfStatus::ParseError {
                            file_id: record.file_id.clone(),
                            message: err.to_string(),
                        },
                    );
                }
            };
            let present: HashSet<String> = frequencies
                .into_iter()
                .filter(|(_, count)| *count > 0)
                .map(|(term, _)| term)
                .collect();
            for term in present {
                *doc_freq.entry(term).or_insert(0) += 1;
            }
        }

        let n_docs = records.len();
        let idf = terms
            .into_iter()
            .map(|term| {
                let df = doc_freq.get(&term).copied().unwrap_or(0);
                (term, smoothed_idf(n_docs, df))
            })
            .collect();

        (idf, IdfStatus::Computed { records: n_docs })
    }
}
