// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Call-flow core server.
//!
//! Runs the flow store and the activeflow engine behind the TCP command
//! surface. Events and call driver notices go to the log.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use callflow_core::config::Config;
use callflow_core::driver::LogDriver;
use callflow_core::events::LogPublisher;
use callflow_core::persistence::{Persistence, SqlitePersistence};
use callflow_core::runtime::CoreRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("callflow_core=info".parse()?),
        )
        .init();

    info!("Starting call-flow core");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        addr = %config.bind_addr,
        workers = config.workers,
        max_execute_count = config.max_execute_count,
        max_flows_per_customer = config.max_flows_per_customer,
        request_timeout_ms = config.request_timeout.as_millis() as u64,
        temp_flow_ttl_secs = config.temp_flow_ttl.as_secs(),
        "Configuration loaded"
    );

    // Connect to database; migrations run on connect
    info!("Connecting to database...");
    let persistence = Arc::new(SqlitePersistence::from_url(&config.database_url).await?);
    if !persistence.health_check_db().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database connection established");

    let runtime = CoreRuntime::builder()
        .persistence(persistence.clone())
        .publisher(Arc::new(LogPublisher))
        .driver(Arc::new(LogDriver))
        .engine_settings(config.engine_settings())
        .flow_settings(config.flow_settings())
        .bind_addr(config.bind_addr)
        .workers(config.workers)
        .temp_flow_ttl(config.temp_flow_ttl)
        .build()?
        .start()
        .await?;

    info!(addr = %runtime.bind_addr(), "Call-flow core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    persistence.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
