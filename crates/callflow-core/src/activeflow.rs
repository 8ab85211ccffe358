// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activeflow model: one running instance of a flow bound to a reference.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{Action, ID_EMPTY};
use crate::flow::Flow;
use crate::persistence;
use crate::stack::{STACK_ID_EMPTY, STACK_ID_MAIN, StackMap};

/// Lifecycle status of an activeflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveflowStatus {
    /// Accepting next-action resolution.
    Running,
    /// Stopped explicitly. Terminal.
    Stopped,
    /// Ran out of actions. Terminal.
    Completed,
}

impl ActiveflowStatus {
    /// Storage/wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActiveflowStatus::Running => "running",
            ActiveflowStatus::Stopped => "stopped",
            ActiveflowStatus::Completed => "completed",
        }
    }

    /// Whether no transition leaves this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActiveflowStatus::Stopped | ActiveflowStatus::Completed)
    }
}

impl fmt::Display for ActiveflowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActiveflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(ActiveflowStatus::Running),
            "stopped" => Ok(ActiveflowStatus::Stopped),
            "completed" => Ok(ActiveflowStatus::Completed),
            other => Err(format!("unknown activeflow status '{}'", other)),
        }
    }
}

/// Kind of entity an activeflow drives.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceType {
    #[default]
    Call,
    Message,
    Conversation,
    Ai,
    Api,
    Recording,
    Transcribe,
}

impl ReferenceType {
    /// Storage/wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReferenceType::Call => "call",
            ReferenceType::Message => "message",
            ReferenceType::Conversation => "conversation",
            ReferenceType::Ai => "ai",
            ReferenceType::Api => "api",
            ReferenceType::Recording => "recording",
            ReferenceType::Transcribe => "transcribe",
        }
    }
}

impl fmt::Display for ReferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReferenceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "call" => Ok(ReferenceType::Call),
            "message" => Ok(ReferenceType::Message),
            "conversation" => Ok(ReferenceType::Conversation),
            "ai" => Ok(ReferenceType::Ai),
            "api" => Ok(ReferenceType::Api),
            "recording" => Ok(ReferenceType::Recording),
            "transcribe" => Ok(ReferenceType::Transcribe),
            other => Err(format!("unknown reference type '{}'", other)),
        }
    }
}

/// One running instance of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activeflow {
    /// Activeflow identity.
    pub id: Uuid,
    /// Owner, inherited from the flow.
    pub customer_id: Uuid,
    /// Flow currently spliced in as the main frame.
    pub flow_id: Uuid,
    /// Lifecycle status.
    pub status: ActiveflowStatus,

    /// What this activeflow drives.
    pub reference_type: ReferenceType,
    /// Id of the driven entity.
    pub reference_id: Uuid,
    /// Non-owning link to the activeflow that spawned this one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_activeflow_id: Option<Uuid>,

    /// Frame the current action lives in.
    pub current_stack_id: Uuid,
    /// Call stack.
    pub stack_map: StackMap,
    /// Action last handed out, or the start marker.
    pub current_action: Action,

    /// One-shot override frame, [`STACK_ID_EMPTY`] when unset.
    pub forward_stack_id: Uuid,
    /// One-shot override action, [`ID_EMPTY`] when unset.
    pub forward_action_id: Uuid,

    /// Resolution steps taken so far.
    pub execute_count: u64,
    /// Actions handed out, oldest first.
    pub executed_actions: Vec<Action>,

    /// Compare-and-set version, bumped on every committed write.
    pub version: i64,

    /// Creation time.
    pub tm_create: DateTime<Utc>,
    /// Last update time.
    pub tm_update: DateTime<Utc>,
    /// Soft-delete time.
    #[serde(default)]
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Activeflow {
    /// Fresh running activeflow over `flow`, pointing at the start marker.
    pub fn new(
        id: Uuid,
        flow: &Flow,
        reference_type: ReferenceType,
        reference_id: Uuid,
        reference_activeflow_id: Option<Uuid>,
    ) -> Self {
        let now = persistence::now();
        Self {
            id,
            customer_id: flow.customer_id,
            flow_id: flow.id,
            status: ActiveflowStatus::Running,
            reference_type,
            reference_id,
            reference_activeflow_id,
            current_stack_id: STACK_ID_MAIN,
            stack_map: StackMap::new(flow.actions.clone()),
            current_action: Action::start(),
            forward_stack_id: STACK_ID_EMPTY,
            forward_action_id: ID_EMPTY,
            execute_count: 0,
            executed_actions: Vec::new(),
            version: 0,
            tm_create: now,
            tm_update: now,
            tm_delete: None,
        }
    }

    /// Whether the activeflow has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.tm_delete.is_some()
    }

    /// Whether a forward override is pending.
    pub fn has_forward(&self) -> bool {
        self.forward_action_id != ID_EMPTY
    }

    /// Drop the pending forward override.
    pub fn clear_forward(&mut self) {
        self.forward_stack_id = STACK_ID_EMPTY;
        self.forward_action_id = ID_EMPTY;
    }
}

/// Filters for listing activeflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActiveflowFilter {
    /// Only activeflows owned by this customer.
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    /// Only activeflows driving this reference.
    #[serde(default)]
    pub reference_id: Option<Uuid>,
    /// Only activeflows in this status.
    #[serde(default)]
    pub status: Option<ActiveflowStatus>,
    /// Include soft-deleted activeflows instead of live ones.
    #[serde(default)]
    pub deleted: bool,
}
