// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Command surface.
//!
//! One [`Request`] maps to exactly one flow or activeflow operation.
//! [`handle_request`] dispatches it and turns every [`CoreError`] into a
//! [`Response::Error`] carrying the stable error code.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::action::{Action, AuthoredAction};
use crate::activeflow::{Activeflow, ActiveflowFilter};
use crate::activeflow_handlers::{ActiveflowHandler, CreateActiveflowRequest, NextAction};
use crate::error::CoreError;
use crate::flow::{Flow, FlowFilter};
use crate::flow_handlers::{CreateFlowRequest, FlowHandler, UpdateFlowRequest};
use crate::persistence::{Page, PageToken, Persistence};

/// A command addressed to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    // Activeflows
    /// Start an activeflow.
    CreateActiveflow(CreateActiveflowRequest),
    /// Fetch one activeflow.
    GetActiveflow {
        /// Activeflow id.
        id: Uuid,
    },
    /// List activeflows.
    ListActiveflows {
        /// Field filters.
        #[serde(default)]
        filter: ActiveflowFilter,
        /// Page cursor.
        #[serde(default)]
        page: Page,
    },
    /// Soft-delete an activeflow.
    DeleteActiveflow {
        /// Activeflow id.
        id: Uuid,
    },
    /// Resolve the next action.
    NextAction {
        /// Activeflow id.
        id: Uuid,
        /// Caller's believed current action.
        current_action_id: Uuid,
    },
    /// Set the forward override.
    SetForwardAction {
        /// Activeflow id.
        id: Uuid,
        /// Target action.
        forward_action_id: Uuid,
        /// Target frame; searched when absent.
        #[serde(default)]
        forward_stack_id: Option<Uuid>,
        /// Resolve right away.
        #[serde(default)]
        forward_now: bool,
    },
    /// Trigger execution.
    Execute {
        /// Activeflow id.
        id: Uuid,
    },
    /// Resume a blocked activeflow.
    ExecuteContinue {
        /// Activeflow id.
        id: Uuid,
        /// Action the driver resumes from.
        current_action_id: Uuid,
    },
    /// Stop an activeflow.
    Stop {
        /// Activeflow id.
        id: Uuid,
    },
    /// Abandon a sub-service's frames.
    ServiceStop {
        /// Activeflow id.
        id: Uuid,
        /// Service tag of the frames.
        service_id: Uuid,
    },
    /// Run actions in a new frame.
    PushActions {
        /// Activeflow id.
        id: Uuid,
        /// Authored actions.
        actions: Vec<AuthoredAction>,
        /// Service tag for the new frame.
        #[serde(default)]
        service_id: Option<Uuid>,
    },
    /// Splice actions after the current one.
    AddActions {
        /// Activeflow id.
        id: Uuid,
        /// Authored actions.
        actions: Vec<AuthoredAction>,
    },

    // Flows
    /// Compile and store a flow.
    CreateFlow(CreateFlowRequest),
    /// Fetch one flow.
    GetFlow {
        /// Flow id.
        id: Uuid,
    },
    /// List persisted flows.
    ListFlows {
        /// Field filters.
        #[serde(default)]
        filter: FlowFilter,
        /// Page cursor.
        #[serde(default)]
        page: Page,
    },
    /// Replace a flow's fields.
    UpdateFlow(UpdateFlowRequest),
    /// Replace a flow's actions.
    UpdateFlowActions {
        /// Flow id.
        id: Uuid,
        /// Authored actions.
        actions: Vec<AuthoredAction>,
    },
    /// Soft-delete a flow.
    DeleteFlow {
        /// Flow id.
        id: Uuid,
    },

    /// Server and database health.
    HealthCheck,
}

impl Request {
    /// Operation name, for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::CreateActiveflow(_) => "create_activeflow",
            Request::GetActiveflow { .. } => "get_activeflow",
            Request::ListActiveflows { .. } => "list_activeflows",
            Request::DeleteActiveflow { .. } => "delete_activeflow",
            Request::NextAction { .. } => "next_action",
            Request::SetForwardAction { .. } => "set_forward_action",
            Request::Execute { .. } => "execute",
            Request::ExecuteContinue { .. } => "execute_continue",
            Request::Stop { .. } => "stop",
            Request::ServiceStop { .. } => "service_stop",
            Request::PushActions { .. } => "push_actions",
            Request::AddActions { .. } => "add_actions",
            Request::CreateFlow(_) => "create_flow",
            Request::GetFlow { .. } => "get_flow",
            Request::ListFlows { .. } => "list_flows",
            Request::UpdateFlow(_) => "update_flow",
            Request::UpdateFlowActions { .. } => "update_flow_actions",
            Request::DeleteFlow { .. } => "delete_flow",
            Request::HealthCheck => "health_check",
        }
    }
}

/// Answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    /// One activeflow.
    Activeflow {
        /// The record.
        activeflow: Box<Activeflow>,
    },
    /// A page of activeflows.
    Activeflows {
        /// The records, newest first.
        activeflows: Vec<Activeflow>,
        /// Token for the following page.
        next_page_token: Option<PageToken>,
    },
    /// The resolved next action.
    Action {
        /// The action.
        action: Action,
    },
    /// Parked on a block action until continued.
    Blocked,
    /// The activeflow is terminal; there is no next action.
    Finished,
    /// One flow.
    Flow {
        /// The record.
        flow: Box<Flow>,
    },
    /// A page of flows.
    Flows {
        /// The records, newest first.
        flows: Vec<Flow>,
        /// Token for the following page.
        next_page_token: Option<PageToken>,
    },
    /// Accepted, no payload.
    Ack,
    /// Health report.
    Health {
        /// Whether the database answers.
        healthy: bool,
        /// Server version.
        version: String,
        /// Uptime in milliseconds.
        uptime_ms: u64,
    },
    /// The operation failed.
    Error {
        /// Stable error code.
        code: String,
        /// Human-readable message.
        message: String,
    },
}

impl From<CoreError> for Response {
    fn from(err: CoreError) -> Self {
        Response::Error {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Shared state for command handling.
pub struct CommandHandlerState {
    /// Activeflow engine.
    pub activeflows: Arc<ActiveflowHandler>,
    /// Flow store.
    pub flows: Arc<FlowHandler>,
    /// Store, for health checks.
    pub persistence: Arc<dyn Persistence>,
    /// When the server started (for uptime calculation).
    pub start_time: Instant,
    /// Server version string.
    pub version: String,
}

impl CommandHandlerState {
    /// Create command state over an engine.
    pub fn new(activeflows: Arc<ActiveflowHandler>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            flows: Arc::clone(activeflows.flows()),
            activeflows,
            persistence,
            start_time: Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get the server uptime in milliseconds.
    pub fn uptime_ms(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn respond<T>(result: Result<T, CoreError>, ok: impl FnOnce(T) -> Response) -> Response {
    match result {
        Ok(value) => ok(value),
        Err(e) => {
            if e.is_not_found() {
                debug!(code = e.error_code(), error = %e, "Request failed");
            } else {
                warn!(code = e.error_code(), error = %e, "Request failed");
            }
            e.into()
        }
    }
}

fn activeflow_response(activeflow: Activeflow) -> Response {
    Response::Activeflow {
        activeflow: Box::new(activeflow),
    }
}

fn flow_response(flow: Flow) -> Response {
    Response::Flow {
        flow: Box::new(flow),
    }
}

/// Dispatch one request.
#[instrument(skip(state, request), fields(op = request.op()))]
pub async fn handle_request(state: &CommandHandlerState, request: Request) -> Response {
    match request {
        // ====================================================================
        // Activeflows
        // ====================================================================
        Request::CreateActiveflow(req) => {
            respond(state.activeflows.create(req).await, activeflow_response)
        }
        Request::GetActiveflow { id } => {
            respond(state.activeflows.get(id).await, activeflow_response)
        }
        Request::ListActiveflows { filter, page } => {
            respond(state.activeflows.list(&filter, &page).await, |activeflows| {
                Response::Activeflows {
                    next_page_token: activeflows
                        .last()
                        .map(|af| PageToken::new(af.tm_create, af.id)),
                    activeflows,
                }
            })
        }
        Request::DeleteActiveflow { id } => {
            respond(state.activeflows.delete(id).await, activeflow_response)
        }
        Request::NextAction {
            id,
            current_action_id,
        } => respond(
            state
                .activeflows
                .execute_next_action(id, current_action_id)
                .await,
            |next| match next {
                NextAction::Action(action) => Response::Action { action },
                NextAction::Blocked => Response::Blocked,
                NextAction::Finished => Response::Finished,
            },
        ),
        Request::SetForwardAction {
            id,
            forward_action_id,
            forward_stack_id,
            forward_now,
        } => respond(
            state
                .activeflows
                .set_forward_action_id(id, forward_action_id, forward_stack_id, forward_now)
                .await,
            |()| Response::Ack,
        ),
        Request::Execute { id } => {
            state.activeflows.execute(id);
            Response::Ack
        }
        Request::ExecuteContinue {
            id,
            current_action_id,
        } => respond(
            state
                .activeflows
                .execute_continue(id, current_action_id)
                .await,
            |()| Response::Ack,
        ),
        Request::Stop { id } => respond(state.activeflows.stop(id).await, activeflow_response),
        Request::ServiceStop { id, service_id } => respond(
            state.activeflows.service_stop(id, service_id).await,
            |()| Response::Ack,
        ),
        Request::PushActions {
            id,
            actions,
            service_id,
        } => respond(
            state
                .activeflows
                .push_actions(id, &actions, service_id)
                .await,
            activeflow_response,
        ),
        Request::AddActions { id, actions } => respond(
            state.activeflows.add_actions(id, &actions).await,
            activeflow_response,
        ),

        // ====================================================================
        // Flows
        // ====================================================================
        Request::CreateFlow(req) => respond(state.flows.create(req).await, flow_response),
        Request::GetFlow { id } => respond(state.flows.get(id).await, flow_response),
        Request::ListFlows { filter, page } => {
            respond(state.flows.list(&filter, &page).await, |flows| {
                Response::Flows {
                    next_page_token: flows.last().map(|f| PageToken::new(f.tm_create, f.id)),
                    flows,
                }
            })
        }
        Request::UpdateFlow(req) => respond(state.flows.update(req).await, flow_response),
        Request::UpdateFlowActions { id, actions } => respond(
            state.flows.update_actions(id, &actions).await,
            flow_response,
        ),
        Request::DeleteFlow { id } => respond(state.flows.delete(id).await, flow_response),

        // ====================================================================
        // Health
        // ====================================================================
        Request::HealthCheck => {
            let healthy = state.persistence.health_check_db().await.unwrap_or(false);
            Response::Health {
                healthy,
                version: state.version.clone(),
                uptime_ms: state.uptime_ms(),
            }
        }
    }
}
