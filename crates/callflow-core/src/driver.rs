// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Outbound seam to the call-processing driver.
//!
//! The driver is the external side that performs actions on real calls and
//! asks for the next one. The core only tells it when to start pulling
//! (`Execute`), when to resume (`ExecuteContinue`), and when a forward-now
//! override already resolved an action on its behalf.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::action::Action;
use crate::activeflow::ReferenceType;

/// Notification sent to the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriverNotice {
    /// Start pulling actions for a fresh activeflow.
    Execute {
        /// Activeflow to drive.
        activeflow_id: Uuid,
        /// Kind of the driven entity.
        reference_type: ReferenceType,
        /// Driven entity.
        reference_id: Uuid,
    },
    /// Resume pulling after an interruption.
    Continue {
        /// Activeflow to drive.
        activeflow_id: Uuid,
        /// Kind of the driven entity.
        reference_type: ReferenceType,
        /// Driven entity.
        reference_id: Uuid,
        /// Action the driver is resuming from.
        current_action_id: Uuid,
    },
    /// A forward-now override resolved this action; run it right away.
    Forwarded {
        /// Activeflow to drive.
        activeflow_id: Uuid,
        /// Kind of the driven entity.
        reference_type: ReferenceType,
        /// Driven entity.
        reference_id: Uuid,
        /// The resolved action.
        action: Action,
    },
}

impl DriverNotice {
    /// Activeflow the notice is about.
    pub fn activeflow_id(&self) -> Uuid {
        match self {
            DriverNotice::Execute { activeflow_id, .. }
            | DriverNotice::Continue { activeflow_id, .. }
            | DriverNotice::Forwarded { activeflow_id, .. } => *activeflow_id,
        }
    }
}

/// Error returned when the driver cannot be reached.
#[derive(Debug, thiserror::Error)]
#[error("driver unavailable: {0}")]
pub struct DriverError(pub String);

/// Outbound notification sink towards the call-processing side.
#[async_trait]
pub trait CallDriver: Send + Sync {
    /// Deliver one notice.
    async fn notify(&self, notice: DriverNotice) -> Result<(), DriverError>;
}

/// Driver backed by a tokio mpsc channel; the receiver is the driver side.
#[derive(Clone)]
pub struct ChannelDriver {
    tx: mpsc::Sender<DriverNotice>,
}

impl ChannelDriver {
    /// Create a driver and the receiver that consumes its notices.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<DriverNotice>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CallDriver for ChannelDriver {
    async fn notify(&self, notice: DriverNotice) -> Result<(), DriverError> {
        self.tx
            .send(notice)
            .await
            .map_err(|e| DriverError(format!("receiver dropped: {}", e)))
    }
}

/// Driver that only logs notices.
#[derive(Debug, Clone, Default)]
pub struct LogDriver;

#[async_trait]
impl CallDriver for LogDriver {
    async fn notify(&self, notice: DriverNotice) -> Result<(), DriverError> {
        info!(activeflow_id = %notice.activeflow_id(), ?notice, "Driver notice");
        Ok(())
    }
}
