//! Builds connectors and the failed-job store from configuration.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::sqlite::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{ConnectionConfig, FailedConfig, QueueConfig};
use crate::connector::{
    database, redis, Connector, DatabaseConnector, RedisConnector,
    SyncConnector,
};
use crate::error::QueueError;
use crate::events::Dispatcher;
use crate::failed::{
    DatabaseFailedJobProvider, FailedJobProvider, NullFailedJobProvider,
};
use crate::registry::Registry;
use crate::time::{Clock, Delay};
use crate::types::job::JobId;
use crate::types::payload::Payload;

/// Resolves named connections, building each one the first time it is asked
/// for and handing out the same instance afterwards.
pub struct QueueManager {
    config: QueueConfig,
    registry: Arc<Registry>,
    events: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    connections: Mutex<HashMap<String, Arc<dyn Connector>>>,
    pools: Mutex<HashMap<String, SqlitePool>>,
}

impl QueueManager {
    pub fn new(
        config: QueueConfig,
        registry: Arc<Registry>,
        events: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            registry,
            events,
            clock,
            connections: Mutex::default(),
            pools: Mutex::default(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn events(&self) -> &Arc<Dispatcher> {
        &self.events
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn default_connection(&self) -> &str {
        &self.config.default
    }

    /// Returns the named connection, or the default one.
    pub async fn connection(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn Connector>, QueueError> {
        let name = name.unwrap_or(&self.config.default);

        let mut connections = self.connections.lock().await;
        if let Some(connector) = connections.get(name) {
            return Ok(connector.clone());
        }

        let connector = self.build(name).await?;
        connections.insert(name.to_owned(), connector.clone());

        Ok(connector)
    }

    /// Installs a ready-made connector under `name`, replacing any cached
    /// one.
    pub async fn insert(&self, name: impl Into<String>, connector: Arc<dyn Connector>) {
        self.connections.lock().await.insert(name.into(), connector);
    }

    async fn pool(&self, url: &str) -> Result<SqlitePool, QueueError> {
        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get(url) {
            return Ok(pool.clone());
        }

        let pool = database::connect(url).await?;
        pools.insert(url.to_owned(), pool.clone());

        Ok(pool)
    }

    async fn build(&self, name: &str) -> Result<Arc<dyn Connector>, QueueError> {
        debug!(connection = name, "building queue connection");

        let connector: Arc<dyn Connector> = match self.config.connection(name)? {
            ConnectionConfig::Sync => Arc::new(
                SyncConnector::new(self.registry.clone(), self.events.clone())
                    .with_connection_name(name),
            ),
            ConnectionConfig::Database {
                url,
                table,
                queue,
                retry_after,
            } => Arc::new(
                DatabaseConnector::new(
                    self.pool(url).await?,
                    table,
                    queue,
                    *retry_after,
                    self.clock.clone(),
                )
                .with_connection_name(name),
            ),
            ConnectionConfig::Redis {
                url,
                queue,
                retry_after,
                block_for,
            } => Arc::new(
                RedisConnector::new(
                    redis::connect(url).await?,
                    queue,
                    *retry_after,
                    *block_for,
                    self.clock.clone(),
                )
                .with_connection_name(name),
            ),
        };

        Ok(connector)
    }

    /// Builds the configured failed-job store.
    pub async fn failer(&self) -> Result<Arc<dyn FailedJobProvider>, QueueError> {
        let failer: Arc<dyn FailedJobProvider> = match &self.config.failed {
            FailedConfig::Database { url, table } => {
                Arc::new(DatabaseFailedJobProvider::new(
                    self.pool(url).await?,
                    table,
                    self.clock.clone(),
                ))
            },
            FailedConfig::None => Arc::new(NullFailedJobProvider),
        };

        Ok(failer)
    }

    /// Creates the jobs table of a database connection (the default one if
    /// unnamed) and the failed jobs table, if the failed store is a database.
    pub async fn create_tables(&self, name: Option<&str>) -> Result<(), QueueError> {
        let name = name.unwrap_or(&self.config.default);

        match self.config.connection(name)? {
            ConnectionConfig::Database {
                url,
                table,
                queue,
                retry_after,
            } => {
                DatabaseConnector::new(
                    self.pool(url).await?,
                    table,
                    queue,
                    *retry_after,
                    self.clock.clone(),
                )
                .create_table()
                .await?;
                info!(connection = name, %table, "created jobs table");
            },
            _ => debug!(connection = name, "connection has no table to create"),
        }

        if let FailedConfig::Database { url, table } = &self.config.failed {
            DatabaseFailedJobProvider::new(
                self.pool(url).await?,
                table,
                self.clock.clone(),
            )
            .create_table()
            .await?;
            info!(%table, "created failed jobs table");
        }

        Ok(())
    }

    /// Pushes a job onto the default connection.
    pub async fn enqueue(
        &self,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        self.connection(None).await?.push(payload, queue).await
    }

    /// Pushes a job onto the default connection, available after `delay`. A
    /// delay that has already elapsed is a plain push.
    pub async fn enqueue_later(
        &self,
        delay: impl Into<Delay>,
        payload: Payload,
        queue: Option<&str>,
    ) -> Result<Option<JobId>, QueueError> {
        let delay = delay.into();
        let connector = self.connection(None).await?;

        if delay.is_immediate(self.clock.now()) {
            connector.push(payload, queue).await
        } else {
            connector.later(delay, payload, queue).await
        }
    }
}
