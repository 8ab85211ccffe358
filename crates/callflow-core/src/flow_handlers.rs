// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow store handlers.
//!
//! Flows are compiled on create and on every action update, then treated as
//! read-only templates by the activeflow engine. Persisted flows go to the
//! database and count against a per-customer ceiling; temporary flows live
//! in the TTL cache only.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::action::AuthoredAction;
use crate::compiler::compile;
use crate::error::{CoreError, Result};
use crate::events::{EventPublisher, EventType, publish_logged};
use crate::flow::{Flow, FlowFilter, FlowType};
use crate::persistence::{self, FlowCache, Page, Persistence, with_deadline};

/// Default per-customer ceiling on persisted flows.
pub const DEFAULT_MAX_FLOWS_PER_CUSTOMER: i64 = 10_000;

/// Limits and deadlines for flow operations.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    /// Live persisted flows a customer may own.
    pub max_flows_per_customer: i64,
    /// Deadline for each store call.
    pub request_timeout: Duration,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            max_flows_per_customer: DEFAULT_MAX_FLOWS_PER_CUSTOMER,
            request_timeout: Duration::from_millis(3000),
        }
    }
}

/// Input of a flow creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFlowRequest {
    /// Owner.
    pub customer_id: Uuid,
    /// Flow type.
    #[serde(default, rename = "type")]
    pub flow_type: FlowType,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Description.
    #[serde(default)]
    pub detail: String,
    /// Store durably (true) or in the TTL cache (false).
    #[serde(default = "default_persist")]
    pub persist: bool,
    /// Authored actions.
    #[serde(default)]
    pub actions: Vec<AuthoredAction>,
    /// Flow spliced in once this one is exhausted.
    #[serde(default)]
    pub on_complete_flow_id: Option<Uuid>,
}

fn default_persist() -> bool {
    true
}

impl CreateFlowRequest {
    /// A persisted plain flow with no name.
    pub fn new(customer_id: Uuid, actions: Vec<AuthoredAction>) -> Self {
        Self {
            customer_id,
            flow_type: FlowType::Flow,
            name: String::new(),
            detail: String::new(),
            persist: true,
            actions,
            on_complete_flow_id: None,
        }
    }
}

/// Input of a whole-flow update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateFlowRequest {
    /// Flow to update.
    pub id: Uuid,
    /// New display name.
    #[serde(default)]
    pub name: String,
    /// New description.
    #[serde(default)]
    pub detail: String,
    /// Replacement actions.
    #[serde(default)]
    pub actions: Vec<AuthoredAction>,
    /// New on-complete flow.
    #[serde(default)]
    pub on_complete_flow_id: Option<Uuid>,
}

/// Flow store.
pub struct FlowHandler {
    persistence: Arc<dyn Persistence>,
    cache: Arc<FlowCache>,
    publisher: Arc<dyn EventPublisher>,
    settings: FlowSettings,
}

impl FlowHandler {
    /// Create a flow store over the given backends.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        cache: Arc<FlowCache>,
        publisher: Arc<dyn EventPublisher>,
        settings: FlowSettings,
    ) -> Self {
        Self {
            persistence,
            cache,
            publisher,
            settings,
        }
    }

    /// Temporary flow cache.
    pub fn cache(&self) -> &Arc<FlowCache> {
        &self.cache
    }

    // ========================================================================
    // Create
    // ========================================================================

    /// Compile and store a new flow.
    ///
    /// Persisted flows are refused once the owner reaches the ceiling;
    /// temporary flows never count against it.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, persist = request.persist))]
    pub async fn create(&self, request: CreateFlowRequest) -> Result<Flow> {
        // 1. Compile first; a bad graph never touches the store
        let actions = compile(&request.actions)?;

        // 2. Enforce the ceiling on persisted flows
        if request.persist {
            let count = with_deadline(
                "count_flows",
                self.settings.request_timeout,
                self.persistence.count_flows(request.customer_id),
            )
            .await?;
            if count >= self.settings.max_flows_per_customer {
                return Err(CoreError::validation(
                    "customer_id",
                    format!(
                        "flow limit of {} reached for customer '{}'",
                        self.settings.max_flows_per_customer, request.customer_id
                    ),
                ));
            }
        }

        let now = persistence::now();
        let flow = Flow {
            id: Uuid::new_v4(),
            customer_id: request.customer_id,
            flow_type: request.flow_type,
            name: request.name,
            detail: request.detail,
            persist: request.persist,
            actions,
            on_complete_flow_id: request.on_complete_flow_id,
            tm_create: now,
            tm_update: now,
            tm_delete: None,
        };

        // 3. Store
        self.store_new(&flow).await?;

        info!(flow_id = %flow.id, actions = flow.actions.len(), "Flow created");
        publish_logged(
            self.publisher.as_ref(),
            EventType::FlowCreated,
            flow.customer_id,
            &flow,
        )
        .await;

        Ok(flow)
    }

    async fn store_new(&self, flow: &Flow) -> Result<()> {
        if flow.persist {
            with_deadline(
                "insert_flow",
                self.settings.request_timeout,
                self.persistence.insert_flow(flow),
            )
            .await
        } else {
            self.cache.insert(flow.clone());
            Ok(())
        }
    }

    // ========================================================================
    // Read
    // ========================================================================

    /// Fetch a live flow, checking the temporary cache first.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> Result<Flow> {
        if let Some(flow) = self.cache.get(&id) {
            debug!("Flow served from cache");
            return Ok(flow);
        }

        let flow = with_deadline(
            "get_flow",
            self.settings.request_timeout,
            self.persistence.get_flow(id),
        )
        .await?;

        match flow {
            Some(flow) if !flow.is_deleted() => Ok(flow),
            _ => Err(CoreError::FlowNotFound {
                flow_id: id.to_string(),
            }),
        }
    }

    /// List persisted flows, newest first.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: &FlowFilter, page: &Page) -> Result<Vec<Flow>> {
        with_deadline(
            "list_flows",
            self.settings.request_timeout,
            self.persistence.list_flows(filter, page),
        )
        .await
    }

    // ========================================================================
    // Update
    // ========================================================================

    /// Replace name, detail, actions and on-complete flow.
    #[instrument(skip(self, request), fields(flow_id = %request.id))]
    pub async fn update(&self, request: UpdateFlowRequest) -> Result<Flow> {
        let actions = compile(&request.actions)?;
        let mut flow = self.get(request.id).await?;

        flow.name = request.name;
        flow.detail = request.detail;
        flow.actions = actions;
        flow.on_complete_flow_id = request.on_complete_flow_id;

        self.store_update(flow).await
    }

    /// Replace only the action graph.
    #[instrument(skip(self, actions))]
    pub async fn update_actions(&self, id: Uuid, actions: &[AuthoredAction]) -> Result<Flow> {
        let actions = compile(actions)?;
        let mut flow = self.get(id).await?;
        flow.actions = actions;

        self.store_update(flow).await
    }

    async fn store_update(&self, mut flow: Flow) -> Result<Flow> {
        flow.tm_update = persistence::now();

        if flow.persist {
            with_deadline(
                "update_flow",
                self.settings.request_timeout,
                self.persistence.update_flow(&flow),
            )
            .await?;
        } else {
            self.cache.insert(flow.clone());
        }

        info!(flow_id = %flow.id, actions = flow.actions.len(), "Flow updated");
        publish_logged(
            self.publisher.as_ref(),
            EventType::FlowUpdated,
            flow.customer_id,
            &flow,
        )
        .await;

        Ok(flow)
    }

    // ========================================================================
    // Delete
    // ========================================================================

    /// Soft-delete a flow. Temporary flows are dropped from the cache.
    ///
    /// Activeflows already running keep their own copy of the graph.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: Uuid) -> Result<Flow> {
        let mut flow = self.get(id).await?;
        let now = persistence::now();

        if flow.persist {
            with_deadline(
                "delete_flow",
                self.settings.request_timeout,
                self.persistence.delete_flow(id, now),
            )
            .await?;
        } else {
            self.cache.remove(&id);
        }

        flow.tm_update = now;
        flow.tm_delete = Some(now);

        info!("Flow deleted");
        publish_logged(
            self.publisher.as_ref(),
            EventType::FlowDeleted,
            flow.customer_id,
            &flow,
        )
        .await;

        Ok(flow)
    }
}
