// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle events.
//!
//! Every state-changing flow or activeflow operation emits one [`Event`]
//! carrying the full post-mutation record. The core only produces events;
//! delivery is up to the [`EventPublisher`] implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event type tag.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ActiveflowCreated,
    ActiveflowUpdated,
    ActiveflowStopped,
    ActiveflowDeleted,
    FlowCreated,
    FlowUpdated,
    FlowDeleted,
}

impl EventType {
    /// Wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ActiveflowCreated => "activeflow_created",
            EventType::ActiveflowUpdated => "activeflow_updated",
            EventType::ActiveflowStopped => "activeflow_stopped",
            EventType::ActiveflowDeleted => "activeflow_deleted",
            EventType::FlowCreated => "flow_created",
            EventType::FlowUpdated => "flow_updated",
            EventType::FlowDeleted => "flow_deleted",
        }
    }
}

/// A published lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type.
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Owner of the record.
    pub customer_id: Uuid,
    /// Publish time.
    pub published_at: DateTime<Utc>,
    /// The record after the mutation.
    pub data: Value,
}

impl Event {
    /// Build an event from any serializable record.
    pub fn new<T: Serialize>(
        event_type: EventType,
        customer_id: Uuid,
        record: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type,
            customer_id,
            published_at: Utc::now(),
            data: serde_json::to_value(record)?,
        })
    }
}

/// Error returned by a publisher.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// No subscriber is listening.
    #[error("no subscribers for event '{0}'")]
    NoSubscribers(&'static str),
    /// Transport failure.
    #[error("publish failed: {0}")]
    Transport(String),
}

/// Outbound event sink.
///
/// Failures are reported to the caller, which logs them; a committed
/// mutation is never rolled back because its event could not be delivered.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one event.
    async fn publish(&self, event: Event) -> Result<(), PublishError>;
}

/// Build and publish an event, logging instead of failing.
pub async fn publish_logged<T: Serialize>(
    publisher: &dyn EventPublisher,
    event_type: EventType,
    customer_id: Uuid,
    record: &T,
) {
    let event = match Event::new(event_type, customer_id, record) {
        Ok(event) => event,
        Err(e) => {
            warn!(event_type = event_type.as_str(), error = %e, "Failed to encode event");
            return;
        }
    };
    if let Err(e) = publisher.publish(event).await {
        warn!(event_type = event_type.as_str(), error = %e, "Failed to publish event");
    }
}

/// In-process publisher backed by a tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Event>,
}

impl BroadcastPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventPublisher for BroadcastPublisher {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        let event_type = event.event_type.as_str();
        self.tx
            .send(event)
            .map(|receivers| debug!(event_type, receivers, "Event published"))
            .map_err(|_| PublishError::NoSubscribers(event_type))
    }
}

/// Publisher that only writes events to the log.
#[derive(Debug, Clone, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: Event) -> Result<(), PublishError> {
        let id = event.data.get("id").and_then(Value::as_str).unwrap_or_default();
        info!(
            event_type = event.event_type.as_str(),
            customer_id = %event.customer_id,
            id,
            "Event"
        );
        Ok(())
    }
}
