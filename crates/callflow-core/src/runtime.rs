// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for callflow-core.
//!
//! This module provides [`CoreRuntime`] which allows embedding the call-flow
//! core into an existing tokio application instead of running it as a
//! standalone server.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use callflow_core::runtime::CoreRuntime;
//! use callflow_core::persistence::SqlitePersistence;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_url("sqlite:callflow.db").await?);
//!
//!     let runtime = CoreRuntime::builder()
//!         .persistence(persistence)
//!         .bind_addr("0.0.0.0:9010".parse()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... run your application ...
//!
//!     // Graceful shutdown
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::activeflow_handlers::{ActiveflowHandler, EngineSettings};
use crate::command::CommandHandlerState;
use crate::driver::{CallDriver, LogDriver};
use crate::events::{EventPublisher, LogPublisher};
use crate::flow_handlers::{FlowHandler, FlowSettings};
use crate::persistence::{CacheSweeper, CacheSweeperConfig, FlowCache, Persistence};
use crate::pool::CommandPool;
use crate::server;

/// Default command surface port.
pub const DEFAULT_PORT: u16 = 9010;

/// Default command worker count.
pub const DEFAULT_WORKERS: usize = 16;

/// Default lifetime of temporary flows.
pub const DEFAULT_TEMP_FLOW_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Builder for creating a [`CoreRuntime`].
pub struct CoreRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    driver: Option<Arc<dyn CallDriver>>,
    engine_settings: EngineSettings,
    flow_settings: FlowSettings,
    bind_addr: SocketAddr,
    workers: usize,
    queue_capacity: Option<usize>,
    temp_flow_ttl: Duration,
    sweeper: CacheSweeperConfig,
}

impl std::fmt::Debug for CoreRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("publisher", &self.publisher.as_ref().map(|_| "..."))
            .field("driver", &self.driver.as_ref().map(|_| "..."))
            .field("engine_settings", &self.engine_settings)
            .field("flow_settings", &self.flow_settings)
            .field("bind_addr", &self.bind_addr)
            .field("workers", &self.workers)
            .field("temp_flow_ttl", &self.temp_flow_ttl)
            .finish()
    }
}

impl Default for CoreRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            publisher: None,
            driver: None,
            engine_settings: EngineSettings::default(),
            flow_settings: FlowSettings::default(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            workers: DEFAULT_WORKERS,
            queue_capacity: None,
            temp_flow_ttl: DEFAULT_TEMP_FLOW_TTL,
            sweeper: CacheSweeperConfig::default(),
        }
    }
}

impl CoreRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the event publisher.
    ///
    /// Default: [`LogPublisher`]
    pub fn publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Set the call driver notified on execute and forward.
    ///
    /// Default: [`LogDriver`]
    pub fn driver(mut self, driver: Arc<dyn CallDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set engine limits.
    pub fn engine_settings(mut self, settings: EngineSettings) -> Self {
        self.engine_settings = settings;
        self
    }

    /// Set flow store limits.
    pub fn flow_settings(mut self, settings: FlowSettings) -> Self {
        self.flow_settings = settings;
        self
    }

    /// Set the bind address for the command server.
    ///
    /// Default: `0.0.0.0:9010`
    pub fn bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the number of command workers.
    ///
    /// Default: 16
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the command queue capacity.
    ///
    /// Default: 64 per worker
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Set the lifetime of temporary flows.
    ///
    /// Default: 24 hours
    pub fn temp_flow_ttl(mut self, ttl: Duration) -> Self {
        self.temp_flow_ttl = ttl;
        self
    }

    /// Set how often expired temporary flows are swept.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweeper.interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<CoreRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.engine_settings.max_execute_count == 0 {
            anyhow::bail!("max_execute_count must be at least 1");
        }

        Ok(CoreRuntimeConfig {
            persistence,
            publisher: self.publisher.unwrap_or_else(|| Arc::new(LogPublisher)),
            driver: self.driver.unwrap_or_else(|| Arc::new(LogDriver)),
            engine_settings: self.engine_settings,
            flow_settings: self.flow_settings,
            bind_addr: self.bind_addr,
            workers: self.workers,
            queue_capacity: self.queue_capacity.unwrap_or(self.workers * 64),
            temp_flow_ttl: self.temp_flow_ttl,
            sweeper: self.sweeper,
        })
    }
}

/// Configuration for a [`CoreRuntime`].
pub struct CoreRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    publisher: Arc<dyn EventPublisher>,
    driver: Arc<dyn CallDriver>,
    engine_settings: EngineSettings,
    flow_settings: FlowSettings,
    bind_addr: SocketAddr,
    workers: usize,
    queue_capacity: usize,
    temp_flow_ttl: Duration,
    sweeper: CacheSweeperConfig,
}

impl std::fmt::Debug for CoreRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreRuntimeConfig")
            .field("persistence", &"...")
            .field("bind_addr", &self.bind_addr)
            .field("workers", &self.workers)
            .field("queue_capacity", &self.queue_capacity)
            .finish()
    }
}

impl CoreRuntimeConfig {
    /// Start the runtime: command workers, TCP server and cache sweeper.
    pub async fn start(self) -> Result<CoreRuntime> {
        let cache = Arc::new(FlowCache::new(self.temp_flow_ttl));
        let flows = Arc::new(FlowHandler::new(
            self.persistence.clone(),
            cache.clone(),
            self.publisher.clone(),
            self.flow_settings,
        ));
        let activeflows = Arc::new(ActiveflowHandler::new(
            self.persistence.clone(),
            flows,
            self.publisher,
            self.driver,
            self.engine_settings,
        ));
        let state = Arc::new(CommandHandlerState::new(activeflows, self.persistence));

        // Bind before spawning so address errors surface here
        let listener = TcpListener::bind(self.bind_addr).await?;
        let bind_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (pool, worker_handles) = CommandPool::start(
            state.clone(),
            self.workers,
            self.queue_capacity,
            shutdown_rx.clone(),
        );

        let server_handle = tokio::spawn(server::serve(listener, pool.clone(), shutdown_rx));

        let sweeper = CacheSweeper::new(cache, self.sweeper);
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(sweeper.run());

        info!(addr = %bind_addr, workers = self.workers, "CoreRuntime started");

        Ok(CoreRuntime {
            server_handle,
            worker_handles,
            sweeper_handle,
            sweeper_shutdown,
            shutdown_tx,
            state,
            pool,
            bind_addr,
        })
    }
}

/// A running call-flow core that can be embedded in an application.
///
/// The runtime manages:
/// - TCP command server
/// - Command worker pool
/// - Temporary flow cache sweeper
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct CoreRuntime {
    server_handle: JoinHandle<Result<()>>,
    worker_handles: Vec<JoinHandle<()>>,
    sweeper_handle: JoinHandle<()>,
    sweeper_shutdown: Arc<Notify>,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<CommandHandlerState>,
    pool: CommandPool,
    bind_addr: SocketAddr,
}

impl CoreRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> CoreRuntimeBuilder {
        CoreRuntimeBuilder::new()
    }

    /// Address the command server is listening on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Shared command state.
    pub fn state(&self) -> &Arc<CommandHandlerState> {
        &self.state
    }

    /// Activeflow engine, for in-process callers.
    pub fn activeflows(&self) -> &Arc<ActiveflowHandler> {
        &self.state.activeflows
    }

    /// Flow store, for in-process callers.
    pub fn flows(&self) -> &Arc<FlowHandler> {
        &self.state.flows
    }

    /// Get a reference to the persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.state.persistence
    }

    /// Handle for submitting commands without going through TCP.
    pub fn pool(&self) -> &CommandPool {
        &self.pool
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting connections, lets workers finish the command in hand
    /// and stops the cache sweeper.
    pub async fn shutdown(self) -> Result<()> {
        info!("CoreRuntime shutting down...");

        // Signal shutdown
        let _ = self.shutdown_tx.send(true);
        self.sweeper_shutdown.notify_one();

        for handle in self.worker_handles {
            if let Err(e) = handle.await {
                error!("Command worker panicked: {}", e);
            }
        }
        if let Err(e) = self.sweeper_handle.await {
            error!("Cache sweeper panicked: {}", e);
        }

        // Wait for server task to complete
        match self.server_handle.await {
            Ok(Ok(())) => {
                info!("CoreRuntime shutdown complete");
                Ok(())
            }
            Ok(Err(e)) => {
                error!("CoreRuntime server error during shutdown: {}", e);
                Err(e)
            }
            Err(e) => {
                error!("CoreRuntime server task panicked: {}", e);
                Err(anyhow::anyhow!("server task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.server_handle.is_finished()
    }
}
