//! Bounded, lazily-filled connection pool shared by every backing store.
//!
//! One `ResourcePool` is built per store (dense, sparse, relational). Leases
//! hand their connection back when dropped, so every exit path releases it.

use std::{
    ops::Deref,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_retry::{strategy::FixedInterval, Retry};
use tracing::{debug, warn};

use crate::{
    error::AppError,
    storage::db::SurrealDbClient,
    utils::config::{AppConfig, LivenessPolicy},
};

const RECONNECT_DELAY_MS: u64 = 50;

/// Opens and probes the resources a pool hands out.
#[async_trait]
pub trait ResourceManager<R>: Send + Sync {
    async fn connect(&self) -> Result<R, AppError>;
    async fn is_alive(&self, resource: &R) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub max_size: usize,
    pub liveness: LivenessPolicy,
    pub idle_probe_after: Duration,
}

impl PoolConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            max_size: config.store_pool_max_size,
            liveness: config.store_pool_liveness,
            idle_probe_after: Duration::from_secs(config.store_pool_idle_probe_secs),
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 8,
            liveness: LivenessPolicy::Always,
            idle_probe_after: Duration::from_secs(30),
        }
    }
}

struct IdleResource<R> {
    resource: R,
    returned_at: Instant,
}

pub struct ResourcePool<R> {
    name: &'static str,
    manager: Arc<dyn ResourceManager<R>>,
    idle: Mutex<Vec<IdleResource<R>>>,
    semaphore: Arc<Semaphore>,
    config: PoolConfig,
}

impl<R: Send + 'static> ResourcePool<R> {
    /// No connection is opened here; the first `acquire` opens one.
    pub fn new(
        name: &'static str,
        manager: Arc<dyn ResourceManager<R>>,
        config: PoolConfig,
    ) -> Result<Arc<Self>, AppError> {
        if config.max_size == 0 {
            return Err(AppError::Validation(format!(
                "pool '{name}' needs a max_size greater than zero"
            )));
        }

        Ok(Arc::new(Self {
            name,
            manager,
            idle: Mutex::new(Vec::with_capacity(config.max_size)),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            config,
        }))
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn idle_count(&self) -> usize {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Check out a connection, waiting while `max_size` leases are active.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledResource<R>, AppError> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AppError::StoreUnavailable(format!("pool '{}' is closed", self.name)))?;

        while let Some(idle) = self.pop_idle() {
            if self.passes_liveness(&idle).await {
                return Ok(self.lease(idle.resource, permit));
            }
            warn!(pool = self.name, "Discarding stale pooled connection");
        }

        let resource = self.connect_with_retry().await?;
        debug!(pool = self.name, "Opened new pooled connection");
        Ok(self.lease(resource, permit))
    }

    fn lease(self: &Arc<Self>, resource: R, permit: OwnedSemaphorePermit) -> PooledResource<R> {
        PooledResource {
            resource: Some(resource),
            pool: Arc::clone(self),
            _permit: permit,
        }
    }

    fn pop_idle(&self) -> Option<IdleResource<R>> {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
    }

    async fn passes_liveness(&self, idle: &IdleResource<R>) -> bool {
        let probe = match self.config.liveness {
            LivenessPolicy::Always => true,
            LivenessPolicy::AfterIdle => idle.returned_at.elapsed() >= self.config.idle_probe_after,
            LivenessPolicy::Never => false,
        };
        !probe || self.manager.is_alive(&idle.resource).await
    }

    async fn connect_with_retry(&self) -> Result<R, AppError> {
        // One reconnect attempt after the initial failure.
        let strategy = FixedInterval::from_millis(RECONNECT_DELAY_MS).take(1);
        Retry::spawn(strategy, || self.manager.connect())
            .await
            .map_err(|err| {
                AppError::StoreUnavailable(format!("pool '{}' could not connect: {err}", self.name))
            })
    }

    fn release(&self, resource: R) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.config.max_size {
            idle.push(IdleResource {
                resource,
                returned_at: Instant::now(),
            });
        }
    }
}

/// Active lease on a pooled connection.
pub struct PooledResource<R: Send + 'static> {
    resource: Option<R>,
    pool: Arc<ResourcePool<R>>,
    // Released after the resource went back to the idle list.
    _permit: OwnedSemaphorePermit,
}

impl<R: Send + 'static> PooledResource<R> {
    /// Drop the connection instead of returning it, e.g. after a transport error.
    pub fn discard(mut self) {
        self.resource.take();
    }
}

impl<R: Send + 'static> Deref for PooledResource<R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        match self.resource.as_ref() {
            Some(resource) => resource,
            // `resource` is only taken in `discard` and `drop`, both of which consume the lease.
            None => unreachable!("pooled resource accessed after release"),
        }
    }
}

impl<R: Send + 'static> Drop for PooledResource<R> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}

pub type SurrealPool = ResourcePool<SurrealDbClient>;

/// Opens authenticated SurrealDB connections from configuration.
pub struct SurrealConnector {
    address: String,
    username: String,
    password: String,
    namespace: String,
    database: String,
}

impl SurrealConnector {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            address: config.surrealdb_address.clone(),
            username: config.surrealdb_username.clone(),
            password: config.surrealdb_password.clone(),
            namespace: config.surrealdb_namespace.clone(),
            database: config.surrealdb_database.clone(),
        }
    }
}

#[async_trait]
impl ResourceManager<SurrealDbClient> for SurrealConnector {
    async fn connect(&self) -> Result<SurrealDbClient, AppError> {
        Ok(SurrealDbClient::new(
            &self.address,
            &self.username,
            &self.password,
            &self.namespace,
            &self.database,
        )
        .await?)
    }

    async fn is_alive(&self, resource: &SurrealDbClient) -> bool {
        resource.is_healthy().await
    }
}

/// Hands out clones of one already-open client.
///
/// Used for embedded engines such as `mem://`, where every fresh connection would
/// open a separate empty database.
pub struct SharedSurreal(pub SurrealDbClient);

#[async_trait]
impl ResourceManager<SurrealDbClient> for SharedSurreal {
    async fn connect(&self) -> Result<SurrealDbClient, AppError> {
        Ok(self.0.clone())
    }

    async fn is_alive(&self, resource: &SurrealDbClient) -> bool {
        resource.is_healthy().await
    }
}

/// One pool per backing store.
#[derive(Clone)]
pub struct StorePools {
    pub dense: Arc<SurrealPool>,
    pub sparse: Arc<SurrealPool>,
    pub relational: Arc<SurrealPool>,
}

impl StorePools {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let pool_config = PoolConfig::from_app_config(config);
        let build = |name: &'static str| {
            SurrealPool::new(
                name,
                Arc::new(SurrealConnector::from_config(config)),
                pool_config,
            )
        };

        Ok(Self {
            dense: build("dense")?,
            sparse: build("sparse")?,
            relational: build("relational")?,
        })
    }

    /// All three pools share a single client.
    pub fn shared(client: SurrealDbClient, config: PoolConfig) -> Result<Self, AppError> {
        let manager: Arc<dyn ResourceManager<SurrealDbClient>> = Arc::new(SharedSurreal(client));

        Ok(Self {
            dense: SurrealPool::new("dense", Arc::clone(&manager), config)?,
            sparse: SurrealPool::new("sparse", Arc::clone(&manager), config)?,
            relational: SurrealPool::new("relational", manager, config)?,
        })
    }
}
