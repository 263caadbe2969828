use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tracing::debug;

use crate::{error::AppError, storage::pool::SurrealPool, stored_object};

stored_object!(TermFrequencyRecord, "term_frequency", {
    file_id: String,
    org_id: i64,
    term_frequencies: String,
    is_archived: bool
});

impl TermFrequencyRecord {
    pub fn new(
        org_id: i64,
        file_id: impl Into<String>,
        frequencies: &HashMap<String, u32>,
    ) -> Result<Self, AppError> {
        let file_id = file_id.into();
        let now = Utc::now();
        Ok(Self {
            id: Self::record_id(org_id, &file_id),
            created_at: now,
            updated_at: now,
            file_id,
            org_id,
            term_frequencies: serde_json::to_string(frequencies)?,
            is_archived: false,
        })
    }

    /// One row per tenant and file.
    pub fn record_id(org_id: i64, file_id: &str) -> String {
        format!("{org_id}_{file_id}")
    }

    /// Decodes the stored `term -> frequency` map.
    pub fn parse_frequencies(&self) -> Result<HashMap<String, u32>, AppError> {
        Ok(serde_json::from_str(&self.term_frequencies)?)
    }
}

#[async_trait]
pub trait TermFrequencyRepository: Send + Sync {
    /// Non-archived rows of `org_id` whose `file_id` is in `file_ids`.
    async fn fetch_active(
        &self,
        org_id: i64,
        file_ids: &[String],
    ) -> Result<Vec<TermFrequencyRecord>, AppError>;

    async fn upsert(&self, record: TermFrequencyRecord) -> Result<(), AppError>;

    /// Returns the number of rows that flipped to archived.
    async fn archive(&self, org_id: i64, file_ids: &[String]) -> Result<usize, AppError>;
}

pub struct SurrealTermFrequencyRepository {
    pool: Arc<SurrealPool>,
}

impl SurrealTermFrequencyRepository {
    pub fn new(pool: Arc<SurrealPool>) -> Self {
        Self { pool }
    }
}

fn unavailable(operation: &str, err: impl std::fmt::Display) -> AppError {
    AppError::StoreUnavailable(format!("term frequency {operation} failed: {err}"))
}

#[async_trait]
impl TermFrequencyRepository for SurrealTermFrequencyRepository {
    async fn fetch_active(
        &self,
        org_id: i64,
        file_ids: &[String],
    ) -> Result<Vec<TermFrequencyRecord>, AppError> {
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.pool.acquire().await?;
        let outcome = conn
            .query(
                "SELECT * FROM type::table($table) \
                 WHERE org_id = $org_id AND file_id IN $file_ids AND is_archived = false",
            )
            .bind(("table", TermFrequencyRecord::table_name()))
            .bind(("org_id", org_id))
            .bind(("file_ids", file_ids.to_vec()))
            .await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => {
                conn.discard();
                return Err(unavailable("fetch", err));
            }
        };

        let records: Vec<TermFrequencyRecord> =
            response.take(0).map_err(|err| unavailable("fetch", err))?;
        debug!(org_id, requested = file_ids.len(), found = records.len(), "Fetched term frequency rows");
        Ok(records)
    }

    async fn upsert(&self, record: TermFrequencyRecord) -> Result<(), AppError> {
        let conn = self.pool.acquire().await?;
        match conn.upsert_item(record).await {
            Ok(_) => Ok(()),
            Err(err) => {
                conn.discard();
                Err(unavailable("upsert", err))
            }
        }
    }

    async fn archive(&self, org_id: i64, file_ids: &[String]) -> Result<usize, AppError> {
        if file_ids.is_empty() {
            return Ok(0);
        }

        let conn = self.pool.acquire().await?;
        let outcome = conn
            .query(
                "UPDATE type::table($table) SET is_archived = true, updated_at = time::now() \
                 WHERE org_id = $org_id AND file_id IN $file_ids AND is_archived = false \
                 RETURN AFTER",
            )
            .bind(("table", TermFrequencyRecord::table_name()))
            .bind(("org_id", org_id))
            .bind(("file_ids", file_ids.to_vec()))
            .await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => {
                conn.discard();
                return Err(unavailable("archive", err));
            }
        };

        let archived: Vec<TermFrequencyRecord> =
            response.take(0).map_err(|err| unavailable("archive", err))?;
        Ok(archived.len())
    }
}
