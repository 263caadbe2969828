use crate::error::AppError;

use super::types::{term_frequency::TermFrequencyRecord, StoredObject};
use std::ops::Deref;
use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
}

impl SurrealDbClient {
    /// # Initialize a new database client
    ///
    /// # Arguments
    /// * `address` - Any engine address understood by `surrealdb::engine::any`
    ///
    /// # Returns
    /// * `SurrealDbClient` signed in and scoped to `namespace`/`database`
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        // Sign in to database
        db.signin(Root { username, password }).await?;

        // Set namespace
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }

    /// Defines the lookup indexes the vector tables and the term-frequency table rely on.
    pub async fn ensure_initialized(
        &self,
        dense_table: &str,
        sparse_table: &str,
    ) -> Result<(), AppError> {
        for table in [dense_table, sparse_table] {
            if !is_identifier(table) {
                return Err(AppError::Validation(format!(
                    "invalid index table name '{table}'"
                )));
            }
            self.client
                .query(format!(
                    "DEFINE INDEX IF NOT EXISTS idx_{table}_chunk ON TABLE {table} FIELDS namespace, chunk_id UNIQUE"
                ))
                .await?
                .check()?;
        }

        self.client
            .query(format!(
                "DEFINE INDEX IF NOT EXISTS idx_term_frequency_file ON TABLE {} FIELDS org_id, file_id",
                TermFrequencyRecord::table_name()
            ))
            .await?
            .check()?;

        Ok(())
    }

    /// Liveness probe used by the connection pool.
    pub async fn is_healthy(&self) -> bool {
        self.client.health().await.is_ok()
    }

    /// Creates or replaces a object in SurrealDB, requires the struct to implement StoredObject
    ///
    /// # Arguments
    /// * `item` - The item to be stored
    ///
    /// # Returns
    /// * `Result` - Item or Error
    pub async fn upsert_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .upsert((T::table_name(), item.get_id()))
            .content(item)
            .await
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

/// Table and field names are interpolated into SurrealQL, so only plain identifiers pass.
pub fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient { client: db })
    }
}
