// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Flow model: a named, owned action graph template.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::Action;

/// What a flow is dedicated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    /// Plain flow attached to numbers, calls and messages.
    #[default]
    Flow,
    /// Flow owned by a conference.
    Conference,
    /// Flow owned by a queue.
    Queue,
    /// Flow owned by a campaign.
    Campaign,
    /// Flow owned by a transfer.
    Transfer,
}

impl FlowType {
    /// Storage/wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowType::Flow => "flow",
            FlowType::Conference => "conference",
            FlowType::Queue => "queue",
            FlowType::Campaign => "campaign",
            FlowType::Transfer => "transfer",
        }
    }
}

impl fmt::Display for FlowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "flow" => Ok(FlowType::Flow),
            "conference" => Ok(FlowType::Conference),
            "queue" => Ok(FlowType::Queue),
            "campaign" => Ok(FlowType::Campaign),
            "transfer" => Ok(FlowType::Transfer),
            other => Err(format!("unknown flow type '{}'", other)),
        }
    }
}

/// A compiled flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flow {
    /// Flow identity.
    pub id: Uuid,
    /// Owner.
    pub customer_id: Uuid,
    /// Flow type.
    #[serde(rename = "type")]
    pub flow_type: FlowType,
    /// Display name.
    pub name: String,
    /// Free text description.
    pub detail: String,
    /// Durably stored (true) or cached with a TTL (false).
    pub persist: bool,
    /// Compiled action graph.
    pub actions: Vec<Action>,
    /// Flow spliced in once this flow's chain is exhausted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_complete_flow_id: Option<Uuid>,
    /// Creation time.
    pub tm_create: DateTime<Utc>,
    /// Last update time.
    pub tm_update: DateTime<Utc>,
    /// Soft-delete time.
    #[serde(default)]
    pub tm_delete: Option<DateTime<Utc>>,
}

impl Flow {
    /// Whether the flow has been soft-deleted.
    pub fn is_deleted(&self) -> bool {
        self.tm_delete.is_some()
    }
}

/// Filters for listing flows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowFilter {
    /// Only flows owned by this customer.
    #[serde(default)]
    pub customer_id: Option<Uuid>,
    /// Only flows of this type.
    #[serde(default, rename = "type")]
    pub flow_type: Option<FlowType>,
    /// Include soft-deleted flows instead of live ones.
    #[serde(default)]
    pub deleted: bool,
}
