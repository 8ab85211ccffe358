// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Short-lived cache for temporary flows.
//!
//! Flows created with `persist = false` never reach the database. They live
//! here until their TTL runs out; [`CacheSweeper`] drops expired entries in
//! the background and lookups treat an expired entry as absent.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use crate::flow::Flow;

struct CacheEntry {
    flow: Flow,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// TTL cache of temporary flows, keyed by flow id.
pub struct FlowCache {
    entries: DashMap<Uuid, CacheEntry>,
    ttl: Duration,
}

impl FlowCache {
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Entry lifetime.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Insert or replace a flow. Replacing restarts its TTL.
    pub fn insert(&self, flow: Flow) {
        let expires_at = Instant::now() + self.ttl;
        self.entries.insert(flow.id, CacheEntry { flow, expires_at });
    }

    /// Fetch a live flow.
    pub fn get(&self, id: &Uuid) -> Option<Flow> {
        let now = Instant::now();
        {
            let entry = self.entries.get(id)?;
            if !entry.is_expired(now) {
                return Some(entry.flow.clone());
            }
        }
        self.entries.remove_if(id, |_, entry| entry.is_expired(now));
        None
    }

    /// Live flows, optionally restricted to one owner.
    pub fn list(&self, customer_id: Option<Uuid>) -> Vec<Flow> {
        let now = Instant::now();
        self.entries
            .iter()
            .filter(|e| !e.is_expired(now))
            .filter(|e| customer_id.is_none_or(|c| e.flow.customer_id == c))
            .map(|e| e.flow.clone())
            .collect()
    }

    /// Remove a flow, returning it if it was present and live.
    pub fn remove(&self, id: &Uuid) -> Option<Flow> {
        let now = Instant::now();
        self.entries
            .remove(id)
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(_, entry)| entry.flow)
    }

    /// Drop expired entries. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Number of entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Cache sweeper configuration.
#[derive(Debug, Clone)]
pub struct CacheSweeperConfig {
    /// How often to sweep expired entries
    pub interval: Duration,
}

impl Default for CacheSweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Background task that evicts expired temporary flows.
pub struct CacheSweeper {
    cache: Arc<FlowCache>,
    config: CacheSweeperConfig,
    shutdown: Arc<Notify>,
}

impl CacheSweeper {
    /// Create a new sweeper over `cache`.
    pub fn new(cache: Arc<FlowCache>, config: CacheSweeperConfig) -> Self {
        Self {
            cache,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            ttl_secs = self.cache.ttl().as_secs(),
            "Flow cache sweeper started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("Flow cache sweeper shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.interval) => {
                    let evicted = self.cache.sweep();
                    if evicted > 0 {
                        debug!(evicted, remaining = self.cache.len(), "Evicted expired temporary flows");
                    }
                }
            }
        }
    }
}
