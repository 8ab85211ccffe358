// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for callflow-core integration tests.
//!
//! Provides TestContext wiring an in-memory SQLite store, a broadcast
//! publisher and a channel driver around the flow store and the engine.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use callflow_core::action::AuthoredAction;
use callflow_core::activeflow::Activeflow;
use callflow_core::activeflow_handlers::{
    ActiveflowHandler, CreateActiveflowRequest, EngineSettings, NextAction,
};
use callflow_core::driver::{ChannelDriver, DriverNotice};
use callflow_core::events::{BroadcastPublisher, Event, EventType};
use callflow_core::flow::Flow;
use callflow_core::flow_handlers::{CreateFlowRequest, FlowHandler, FlowSettings};
use callflow_core::persistence::{FlowCache, Persistence, SqlitePersistence};

/// Knobs for a test context.
#[derive(Debug, Clone)]
pub struct TestOptions {
    pub engine: EngineSettings,
    pub flow: FlowSettings,
    pub temp_flow_ttl: Duration,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            flow: FlowSettings::default(),
            temp_flow_ttl: Duration::from_secs(60),
        }
    }
}

/// Test context holding the engine and everything it talks to.
pub struct TestContext {
    pub sqlite: SqlitePersistence,
    pub persistence: Arc<dyn Persistence>,
    pub flows: Arc<FlowHandler>,
    pub engine: Arc<ActiveflowHandler>,
    pub publisher: BroadcastPublisher,
    pub events: broadcast::Receiver<Event>,
    pub driver_rx: mpsc::Receiver<DriverNotice>,
    pub customer_id: Uuid,
}

impl TestContext {
    /// Context with default settings.
    pub async fn new() -> Self {
        Self::with_options(TestOptions::default()).await
    }

    /// Context with custom settings.
    pub async fn with_options(options: TestOptions) -> Self {
        Self::with_persistence(options, |p| p).await
    }

    /// Context whose store is wrapped, for fault injection.
    pub async fn with_persistence(
        options: TestOptions,
        wrap: impl FnOnce(Arc<dyn Persistence>) -> Arc<dyn Persistence>,
    ) -> Self {
        // 1. Fresh in-memory database with migrations applied
        let sqlite = SqlitePersistence::from_url("sqlite::memory:")
            .await
            .expect("Failed to open in-memory SQLite");
        let persistence = wrap(Arc::new(sqlite.clone()));

        // 2. Publisher with a subscriber attached so events are buffered
        let publisher = BroadcastPublisher::new(1024);
        let events = publisher.subscribe();

        // 3. Channel driver
        let (driver, driver_rx) = ChannelDriver::new(64);

        // 4. Handlers
        let flows = Arc::new(FlowHandler::new(
            persistence.clone(),
            Arc::new(FlowCache::new(options.temp_flow_ttl)),
            Arc::new(publisher.clone()),
            options.flow,
        ));
        let engine = Arc::new(ActiveflowHandler::new(
            persistence.clone(),
            flows.clone(),
            Arc::new(publisher.clone()),
            Arc::new(driver),
            options.engine,
        ));

        Self {
            sqlite,
            persistence,
            flows,
            engine,
            publisher,
            events,
            driver_rx,
            customer_id: Uuid::new_v4(),
        }
    }

    /// Create a persisted flow owned by the context's customer.
    pub async fn create_flow(&self, actions: Vec<AuthoredAction>) -> Flow {
        self.flows
            .create(CreateFlowRequest::new(self.customer_id, actions))
            .await
            .expect("Failed to create flow")
    }

    /// Create a flow and start an activeflow over it.
    pub async fn start(&self, actions: Vec<AuthoredAction>) -> Activeflow {
        let flow = self.create_flow(actions).await;
        self.start_flow(flow.id).await
    }

    /// Start an activeflow over an existing flow.
    pub async fn start_flow(&self, flow_id: Uuid) -> Activeflow {
        self.engine
            .create(CreateActiveflowRequest::new(flow_id, Uuid::new_v4()))
            .await
            .expect("Failed to create activeflow")
    }

    /// Ask for the next action the way a driver does, passing the stored
    /// current action id.
    pub async fn next(&self, id: Uuid) -> callflow_core::Result<NextAction> {
        let current = self.engine.get(id).await?.current_action.id;
        self.engine.execute_next_action(id, current).await
    }

    /// Next action, which must be a driver action; returns its id.
    pub async fn next_id(&self, id: Uuid) -> Uuid {
        match self.next(id).await.expect("Failed to resolve next action") {
            NextAction::Action(action) => action.id,
            NextAction::Blocked => panic!("activeflow blocked unexpectedly"),
            NextAction::Finished => panic!("activeflow finished unexpectedly"),
        }
    }

    /// Event types received so far.
    pub fn drain_events(&mut self) -> Vec<EventType> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            seen.push(event.event_type);
        }
        seen
    }

    /// Wait for the next driver notice.
    pub async fn driver_notice(&mut self) -> DriverNotice {
        tokio::time::timeout(Duration::from_secs(2), self.driver_rx.recv())
            .await
            .expect("Timed out waiting for driver notice")
            .expect("Driver channel closed")
    }
}

/// Authored action of `action_type` with a preset id.
pub fn action(action_type: &str, id: Uuid) -> AuthoredAction {
    AuthoredAction::new(action_type).with_id(id)
}

/// `goto` jumping to `target` `loop_count` times.
pub fn goto(id: Uuid, target: Uuid, loop_count: u32) -> AuthoredAction {
    AuthoredAction::new("goto")
        .with_id(id)
        .with_option(json!({"target_id": target, "loop_count": loop_count}))
}

/// `n` fresh ids.
pub fn ids<const N: usize>() -> [Uuid; N] {
    std::array::from_fn(|_| Uuid::new_v4())
}
