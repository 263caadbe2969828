use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::storage::addressing::DEFAULT_MAX_CHUNKS_PER_FILE;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

/// Which engine answers rerank requests.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RerankBackend {
    /// Remote cross-encoder endpoint speaking the `/v1/rerank` protocol.
    #[default]
    Service,
    /// In-process fastembed cross-encoder pool.
    Local,
    Disabled,
}

/// When pooled store connections are probed before being handed out.
#[derive(Clone, Copy, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LivenessPolicy {
    /// Probe every idle connection on checkout.
    #[default]
    Always,
    /// Probe only connections that sat idle longer than `store_pool_idle_probe_secs`.
    AfterIdle,
    Never,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_dense_index_table")]
    pub dense_index_table: String,
    #[serde(default = "default_sparse_index_table")]
    pub sparse_index_table: String,
    #[serde(default = "default_store_pool_max_size")]
    pub store_pool_max_size: usize,
    #[serde(default)]
    pub store_pool_liveness: LivenessPolicy,
    #[serde(default = "default_store_pool_idle_probe_secs")]
    pub store_pool_idle_probe_secs: u64,
    #[serde(default = "default_max_inflight_store_requests")]
    pub max_inflight_store_requests: usize,
    /// Files whose first chunk claims more chunks than this are reported as failed.
    #[serde(default = "default_max_chunks_per_file")]
    pub max_chunks_per_file: u32,
    #[serde(default)]
    pub rerank_backend: RerankBackend,
    #[serde(default = "default_rerank_service_url")]
    pub rerank_service_url: String,
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
    #[serde(default)]
    pub rerank_api_key: Option<String>,
    #[serde(default = "default_rerank_timeout_secs")]
    pub rerank_timeout_secs: u64,
    #[serde(default)]
    pub reranking_pool_size: Option<usize>,
    #[serde(default)]
    pub fastembed_cache_dir: Option<String>,
    #[serde(default)]
    pub fastembed_show_download_progress: Option<bool>,
    #[serde(default)]
    pub fastembed_max_length: Option<usize>,
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_dense_index_table() -> String {
    "dense_chunk".to_string()
}

fn default_sparse_index_table() -> String {
    "sparse_chunk".to_string()
}

fn default_store_pool_max_size() -> usize {
    8
}

fn default_store_pool_idle_probe_secs() -> u64 {
    30
}

fn default_max_inflight_store_requests() -> usize {
    32
}

fn default_max_chunks_per_file() -> u32 {
    DEFAULT_MAX_CHUNKS_PER_FILE
}

fn default_rerank_service_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_rerank_model() -> String {
    "rerank-english-v3.0".to_string()
}

fn default_rerank_timeout_secs() -> u64 {
    30
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "hybrid".to_string(),
            surrealdb_database: "index".to_string(),
            data_dir: default_data_dir(),
            storage: default_storage_kind(),
            dense_index_table: default_dense_index_table(),
            sparse_index_table: default_sparse_index_table(),
            store_pool_max_size: default_store_pool_max_size(),
            store_pool_liveness: LivenessPolicy::default(),
            store_pool_idle_probe_secs: default_store_pool_idle_probe_secs(),
            max_inflight_store_requests: default_max_inflight_store_requests(),
            max_chunks_per_file: default_max_chunks_per_file(),
            rerank_backend: RerankBackend::default(),
            rerank_service_url: default_rerank_service_url(),
            rerank_model: default_rerank_model(),
            rerank_api_key: None,
            rerank_timeout_secs: default_rerank_timeout_secs(),
            reranking_pool_size: None,
            fastembed_cache_dir: None,
            fastembed_show_download_progress: None,
            fastembed_max_length: None,
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
