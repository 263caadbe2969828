use std::{collections::HashMap, fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{
    error::AppError,
    storage::{
        db::{is_identifier, SurrealDbClient},
        pool::{PooledResource, SurrealPool},
    },
};

pub type Metadata = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Dense,
    Sparse,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dense => f.write_str("dense"),
            Self::Sparse => f.write_str("sparse"),
        }
    }
}

/// Term-weighted vector: parallel `indices`/`values`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseValues {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl SparseValues {
    pub fn dot(&self, other: &Self) -> f32 {
        let weights: HashMap<u32, f32> = other
            .indices
            .iter()
            .copied()
            .zip(other.values.iter().copied())
            .collect();

        self.indices
            .iter()
            .zip(self.values.iter())
            .filter_map(|(index, value)| weights.get(index).map(|weight| value * weight))
            .sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryVector {
    Dense(Vec<f32>),
    Sparse(SparseValues),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Option<Vec<f32>>,
    pub sparse_embedding: Option<SparseValues>,
    pub metadata: Metadata,
}

impl VectorRecord {
    pub fn dense(id: impl Into<String>, embedding: Vec<f32>, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            embedding: Some(embedding),
            sparse_embedding: None,
            metadata,
        }
    }

    pub fn sparse(id: impl Into<String>, sparse: SparseValues, metadata: Metadata) -> Self {
        Self {
            id: id.into(),
            embedding: None,
            sparse_embedding: Some(sparse),
            metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataCondition {
    Equals { field: String, value: Value },
    ContainsAny { field: String, values: Vec<Value> },
}

/// Conjunction of conditions on top-level metadata fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    conditions: Vec<MetadataCondition>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn equals(mut self, field: impl Into<String>, value: Value) -> Self {
        self.conditions.push(MetadataCondition::Equals {
            field: field.into(),
            value,
        });
        self
    }

    #[must_use]
    pub fn contains_any(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.conditions.push(MetadataCondition::ContainsAny {
            field: field.into(),
            values,
        });
        self
    }

    pub fn conditions(&self) -> &[MetadataCondition] {
        &self.conditions
    }

    /// Renders ` AND ...` clauses plus the parameters they reference.
    fn to_surql(&self) -> Result<(String, Vec<(String, Value)>), AppError> {
        let mut clause = String::new();
        let mut binds = Vec::with_capacity(self.conditions.len());

        for (position, condition) in self.conditions.iter().enumerate() {
            let param = format!("f{position}");
            let (field, operator, value) = match condition {
                MetadataCondition::Equals { field, value } => (field, "=", value.clone()),
                MetadataCondition::ContainsAny { field, values } => {
                    (field, "CONTAINSANY", Value::Array(values.clone()))
                }
            };
            if !is_identifier(field) {
                return Err(AppError::Validation(format!(
                    "invalid metadata filter field '{field}'"
                )));
            }
            clause.push_str(&format!(" AND metadata.{field} {operator} ${param}"));
            binds.push((param, value));
        }

        Ok((clause, binds))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub vector: QueryVector,
    pub top_k: usize,
    pub filter: Option<MetadataFilter>,
    pub include_metadata: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryMatch {
    pub id: String,
    pub score: f32,
    pub metadata: Option<Metadata>,
}

/// Uniform capability over one vector index. Dense and sparse stores are
/// addressed with identical namespaces and ids.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn kind(&self) -> IndexKind;

    /// Metadata for the ids that exist in `namespace`; missing ids are absent from the map.
    async fn fetch(
        &self,
        namespace: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Metadata>, AppError>;

    /// Overwrites only the given metadata keys of one record.
    async fn update(
        &self,
        namespace: &str,
        id: &str,
        set_metadata: Metadata,
    ) -> Result<(), AppError>;

    async fn query(
        &self,
        namespace: &str,
        request: QueryRequest,
    ) -> Result<Vec<QueryMatch>, AppError>;

    async fn upsert(&self, namespace: &str, records: Vec<VectorRecord>)
        -> Result<usize, AppError>;

    /// Returns how many records were removed.
    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<usize, AppError>;
}

#[derive(Debug, Deserialize)]
struct MetadataRow {
    chunk_id: String,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct DenseScoreRow {
    chunk_id: String,
    #[serde(default)]
    metadata: Metadata,
    score: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct SparseRow {
    chunk_id: String,
    #[serde(default)]
    metadata: Metadata,
    sparse_embedding: Option<SparseValues>,
}

#[derive(Debug, Serialize)]
struct StoredChunk {
    namespace: String,
    chunk_id: String,
    metadata: Metadata,
    #[serde(skip_serializing_if = "Option::is_none")]
    embedding: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sparse_embedding: Option<SparseValues>,
}

/// Vector index kept in one SurrealDB table, one row per chunk.
pub struct SurrealVectorStore {
    pool: Arc<SurrealPool>,
    kind: IndexKind,
    table: String,
}

impl SurrealVectorStore {
    pub fn new(
        pool: Arc<SurrealPool>,
        kind: IndexKind,
        table: impl Into<String>,
    ) -> Result<Self, AppError> {
        let table = table.into();
        if !is_identifier(&table) {
            return Err(AppError::Validation(format!(
                "invalid index table name '{table}'"
            )));
        }
        Ok(Self { pool, kind, table })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn unavailable(&self, operation: &str, err: impl fmt::Display) -> AppError {
        AppError::StoreUnavailable(format!("{} store {operation} failed: {err}", self.kind))
    }

    /// The connection saw a backend error; don't hand it out again.
    fn fail(
        &self,
        conn: PooledResource<SurrealDbClient>,
        operation: &str,
        err: impl fmt::Display,
    ) -> AppError {
        conn.discard();
        self.unavailable(operation, err)
    }

    async fn query_dense(
        &self,
        namespace: &str,
        embedding: Vec<f32>,
        request: &QueryRequest,
    ) -> Result<Vec<QueryMatch>, AppError> {
        let (filter_clause, binds) = match &request.filter {
            Some(filter) => filter.to_surql()?,
            None => (String::new(), Vec::new()),
        };
        let sql = format!(
            "SELECT chunk_id, metadata, vector::similarity::cosine(embedding, $vector) AS score \
             FROM type::table($table) \
             WHERE namespace = $namespace AND embedding != NONE{filter_clause} \
             ORDER BY score DESC \
             LIMIT $limit"
        );

        let conn = self.pool.acquire().await?;
        let mut query = conn
            .query(sql)
            .bind(("table", self.table.clone()))
            .bind(("namespace", namespace.to_owned()))
            .bind(("vector", embedding))
            .bind(("limit", i64::try_from(request.top_k).unwrap_or(i64::MAX)));
        for bind in binds {
            query = query.bind(bind);
        }
        let outcome = query.await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => return Err(self.fail(conn, "query", err)),
        };
        let rows: Vec<DenseScoreRow> = response
            .take(0)
            .map_err(|err| self.unavailable("query", err))?;

        Ok(rows
            .into_iter()
            .map(|row| QueryMatch {
                id: row.chunk_id,
                score: row.score.unwrap_or(0.0),
                metadata: request.include_metadata.then_some(row.metadata),
            })
            .collect())
    }

    async fn query_sparse(
        &self,
        namespace: &str,
        sparse: &SparseValues,
        request: &QueryRequest,
    ) -> Result<Vec<QueryMatch>, AppError> {
        let (filter_clause, binds) = match &request.filter {
            Some(filter) => filter.to_surql()?,
            None => (String::new(), Vec::new()),
        };
        let sql = format!(
            "SELECT chunk_id, metadata, sparse_embedding \
             FROM type::table($table) \
             WHERE namespace = $namespace AND sparse_embedding != NONE{filter_clause}"
        );

        let conn = self.pool.acquire().await?;
        let mut query = conn
            .query(sql)
            .bind(("table", self.table.clone()))
            .bind(("namespace", namespace.to_owned()));
        for bind in binds {
            query = query.bind(bind);
        }
        let outcome = query.await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => return Err(self.fail(conn, "query", err)),
        };
        let rows: Vec<SparseRow> = response
            .take(0)
            .map_err(|err| self.unavailable("query", err))?;
        drop(conn);

        let mut matches: Vec<QueryMatch> = rows
            .into_iter()
            .map(|row| {
                let score = row
                    .sparse_embedding
                    .as_ref()
                    .map_or(0.0, |stored| stored.dot(sparse));
                QueryMatch {
                    id: row.chunk_id,
                    score,
                    metadata: request.include_metadata.then_some(row.metadata),
                }
            })
            .collect();

        matches.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        matches.truncate(request.top_k);
        Ok(matches)
    }
}

#[async_trait]
impl VectorStore for SurrealVectorStore {
    fn kind(&self) -> IndexKind {
        self.kind
    }

    async fn fetch(
        &self,
        namespace: &str,
        ids: &[String],
    ) -> Result<HashMap<String, Metadata>, AppError> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let conn = self.pool.acquire().await?;
        let outcome = conn
            .query(
                "SELECT chunk_id, metadata FROM type::table($table) \
                 WHERE namespace = $namespace AND chunk_id IN $ids",
            )
            .bind(("table", self.table.clone()))
            .bind(("namespace", namespace.to_owned()))
            .bind(("ids", ids.to_vec()))
            .await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => return Err(self.fail(conn, "fetch", err)),
        };
        let rows: Vec<MetadataRow> = response
            .take(0)
            .map_err(|err| self.unavailable("fetch", err))?;

        Ok(rows
            .into_iter()
            .map(|row| (row.chunk_id, row.metadata))
            .collect())
    }

    async fn update(
        &self,
        namespace: &str,
        id: &str,
        set_metadata: Metadata,
    ) -> Result<(), AppError> {
        if set_metadata.is_empty() {
            return Ok(());
        }

        let mut assignments = Vec::with_capacity(set_metadata.len());
        let mut binds = Vec::with_capacity(set_metadata.len());
        for (position, (key, value)) in set_metadata.into_iter().enumerate() {
            if !is_identifier(&key) {
                return Err(AppError::Validation(format!(
                    "invalid metadata key '{key}'"
                )));
            }
            let param = format!("m{position}");
            assignments.push(format!("metadata.{key} = ${param}"));
            binds.push((param, value));
        }
        let sql = format!(
            "UPDATE type::table($table) SET {} \
             WHERE namespace = $namespace AND chunk_id = $chunk_id \
             RETURN AFTER",
            assignments.join(", ")
        );

        let conn = self.pool.acquire().await?;
        let mut query = conn
            .query(sql)
            .bind(("table", self.table.clone()))
            .bind(("namespace", namespace.to_owned()))
            .bind(("chunk_id", id.to_owned()));
        for bind in binds {
            query = query.bind(bind);
        }
        let outcome = query.await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => return Err(self.fail(conn, "update", err)),
        };
        let rows: Vec<MetadataRow> = response
            .take(0)
            .map_err(|err| self.unavailable("update", err))?;

        if rows.is_empty() {
            return Err(AppError::NotFound(format!(
                "chunk '{id}' in {} store namespace '{namespace}'",
                self.kind
            )));
        }
        debug!(store = %self.kind, chunk_id = id, "Updated chunk metadata");
        Ok(())
    }

    async fn query(
        &self,
        namespace: &str,
        request: QueryRequest,
    ) -> Result<Vec<QueryMatch>, AppError> {
        if request.top_k == 0 {
            return Ok(Vec::new());
        }

        match (&request.vector, self.kind) {
            (QueryVector::Dense(embedding), IndexKind::Dense) => {
                let embedding = embedding.clone();
                self.query_dense(namespace, embedding, &request).await
            }
            (QueryVector::Sparse(sparse), IndexKind::Sparse) => {
                self.query_sparse(namespace, sparse, &request).await
            }
            _ => Err(AppError::Validation(format!(
                "query vector does not match the {} store",
                self.kind
            ))),
        }
    }

    async fn upsert(
        &self,
        namespace: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, AppError> {
        let mut rows = Vec::with_capacity(records.len());
        for record in records {
            let matches_kind = match self.kind {
                IndexKind::Dense => record.embedding.is_some(),
                IndexKind::Sparse => record.sparse_embedding.is_some(),
            };
            if !matches_kind {
                return Err(AppError::Validation(format!(
                    "record '{}' carries no {} values",
                    record.id, self.kind
                )));
            }
            // Keying by namespace keeps tenants from colliding on a record id.
            let key = format!("{namespace}{}", record.id);
            rows.push((
                key,
                StoredChunk {
                    namespace: namespace.to_owned(),
                    chunk_id: record.id,
                    metadata: record.metadata,
                    embedding: record.embedding,
                    sparse_embedding: record.sparse_embedding,
                },
            ));
        }

        let total = rows.len();
        let conn = self.pool.acquire().await?;
        for (key, content) in rows {
            let outcome = conn
                .query("UPSERT type::thing($table, $key) CONTENT $content")
                .bind(("table", self.table.clone()))
                .bind(("key", key))
                .bind(("content", content))
                .await
                .and_then(surrealdb::Response::check);
            if let Err(err) = outcome {
                return Err(self.fail(conn, "upsert", err));
            }
        }

        Ok(total)
    }

    async fn delete(&self, namespace: &str, ids: &[String]) -> Result<usize, AppError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.pool.acquire().await?;
        let outcome = conn
            .query(
                "DELETE type::table($table) \
                 WHERE namespace = $namespace AND chunk_id IN $ids \
                 RETURN BEFORE",
            )
            .bind(("table", self.table.clone()))
            .bind(("namespace", namespace.to_owned()))
            .bind(("ids", ids.to_vec()))
            .await;
        let mut response = match outcome {
            Ok(response) => response,
            Err(err) => return Err(self.fail(conn, "delete", err)),
        };
        let rows: Vec<MetadataRow> = response
            .take(0)
            .map_err(|err| self.unavailable("delete", err))?;

        Ok(rows.len())
    }
}
