//! Persistence interfaces and backends for callflow-core.
//!
//! This module defines the persistence abstraction, the row types the SQLite
//! backend reads, and the short-lived cache used for temporary flows.

pub mod cache;
pub mod sqlite;

pub use self::cache::{CacheSweeper, CacheSweeperConfig, FlowCache};
pub use self::sqlite::SqlitePersistence;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::activeflow::{Activeflow, ActiveflowFilter};
use crate::error::{CoreError, Result};
use crate::flow::{Flow, FlowFilter};

/// Default number of records per list page.
pub const DEFAULT_PAGE_SIZE: u32 = 100;

/// Upper bound on a requested page size.
pub const MAX_PAGE_SIZE: u32 = 1000;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Position of the last record of a page.
///
/// Records are ordered by `(tm_create, id)` descending, so records sharing a
/// creation time still page deterministically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    /// Creation time of the last record.
    pub tm_create: DateTime<Utc>,
    /// Id of the last record.
    pub id: Uuid,
}

impl PageToken {
    /// Token pointing at a record.
    pub fn new(tm_create: DateTime<Utc>, id: Uuid) -> Self {
        Self { tm_create, id }
    }
}

/// Cursor for listing records newest first.
///
/// The next page holds the records strictly after `token` in
/// `(tm_create, id)` descending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Exclusive position to continue after.
    #[serde(default)]
    pub token: Option<PageToken>,
    /// Maximum number of records.
    #[serde(default = "default_page_size")]
    pub size: u32,
}

fn default_page_size() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for Page {
    fn default() -> Self {
        Self {
            token: None,
            size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl Page {
    /// Page size clamped to `1..=MAX_PAGE_SIZE`.
    pub fn limit(&self) -> i64 {
        i64::from(self.size.clamp(1, MAX_PAGE_SIZE))
    }
}

/// Run a store call under a deadline.
///
/// Expiry surfaces as [`CoreError::Timeout`]. A write that already reached
/// the store stays committed.
pub async fn with_deadline<T, F>(operation: &str, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::Timeout {
            operation: operation.to_string(),
        }),
    }
}

/// Current time at storage precision (microseconds).
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Format a timestamp the way it is stored.
///
/// Fixed-width microseconds keep lexicographic and chronological order equal.
pub fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Parse a stored timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| decode_error(format!("invalid timestamp '{}': {}", value, e)))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| decode_error(format!("invalid uuid '{}': {}", value, e)))
}

fn decode_error(details: String) -> CoreError {
    CoreError::DatabaseError {
        operation: "decode".to_string(),
        details,
    }
}

/// Flow row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FlowRecord {
    /// Flow id.
    pub id: String,
    /// Owner id.
    pub customer_id: String,
    /// Flow type name.
    #[sqlx(rename = "type")]
    pub flow_type: String,
    /// Display name.
    pub name: String,
    /// Description.
    pub detail: String,
    /// Durable flag.
    pub persist: bool,
    /// Compiled actions as JSON.
    pub actions: String,
    /// Flow spliced in on exhaustion.
    pub on_complete_flow_id: Option<String>,
    /// Creation time.
    pub tm_create: String,
    /// Last update time.
    pub tm_update: String,
    /// Soft-delete time.
    pub tm_delete: Option<String>,
}

impl TryFrom<FlowRecord> for Flow {
    type Error = CoreError;

    fn try_from(record: FlowRecord) -> Result<Self> {
        Ok(Flow {
            id: parse_uuid(&record.id)?,
            customer_id: parse_uuid(&record.customer_id)?,
            flow_type: record.flow_type.parse().map_err(decode_error)?,
            name: record.name,
            detail: record.detail,
            persist: record.persist,
            actions: serde_json::from_str(&record.actions)?,
            on_complete_flow_id: record
                .on_complete_flow_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            tm_create: parse_timestamp(&record.tm_create)?,
            tm_update: parse_timestamp(&record.tm_update)?,
            tm_delete: record.tm_delete.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// Activeflow row from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActiveflowRecord {
    /// Activeflow id.
    pub id: String,
    /// Owner id.
    pub customer_id: String,
    /// Flow id of the main frame.
    pub flow_id: String,
    /// Status name.
    pub status: String,
    /// Reference type name.
    pub reference_type: String,
    /// Driven entity id.
    pub reference_id: String,
    /// Parent activeflow id.
    pub reference_activeflow_id: Option<String>,
    /// Current frame id.
    pub current_stack_id: String,
    /// Stack map as JSON.
    pub stack_map: String,
    /// Current action as JSON.
    pub current_action: String,
    /// Forward frame id.
    pub forward_stack_id: String,
    /// Forward action id.
    pub forward_action_id: String,
    /// Resolution step counter.
    pub execute_count: i64,
    /// Executed actions as JSON.
    pub executed_actions: String,
    /// Compare-and-set version.
    pub version: i64,
    /// Creation time.
    pub tm_create: String,
    /// Last update time.
    pub tm_update: String,
    /// Soft-delete time.
    pub tm_delete: Option<String>,
}

impl TryFrom<ActiveflowRecord> for Activeflow {
    type Error = CoreError;

    fn try_from(record: ActiveflowRecord) -> Result<Self> {
        Ok(Activeflow {
            id: parse_uuid(&record.id)?,
            customer_id: parse_uuid(&record.customer_id)?,
            flow_id: parse_uuid(&record.flow_id)?,
            status: record.status.parse().map_err(decode_error)?,
            reference_type: record.reference_type.parse().map_err(decode_error)?,
            reference_id: parse_uuid(&record.reference_id)?,
            reference_activeflow_id: record
                .reference_activeflow_id
                .as_deref()
                .map(parse_uuid)
                .transpose()?,
            current_stack_id: parse_uuid(&record.current_stack_id)?,
            stack_map: serde_json::from_str(&record.stack_map)?,
            current_action: serde_json::from_str(&record.current_action)?,
            forward_stack_id: parse_uuid(&record.forward_stack_id)?,
            forward_action_id: parse_uuid(&record.forward_action_id)?,
            execute_count: u64::try_from(record.execute_count)
                .map_err(|e| decode_error(format!("invalid execute_count: {}", e)))?,
            executed_actions: serde_json::from_str(&record.executed_actions)?,
            version: record.version,
            tm_create: parse_timestamp(&record.tm_create)?,
            tm_update: parse_timestamp(&record.tm_update)?,
            tm_delete: record.tm_delete.as_deref().map(parse_timestamp).transpose()?,
        })
    }
}

/// Persistence interface for callflow-core.
///
/// Lookups return soft-deleted records too; callers decide whether a
/// deleted record counts as missing.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ========================================================================
    // Flows
    // ========================================================================

    async fn insert_flow(&self, flow: &Flow) -> Result<()>;

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>>;

    async fn list_flows(&self, filter: &FlowFilter, page: &Page) -> Result<Vec<Flow>>;

    /// Overwrite a flow's mutable fields.
    async fn update_flow(&self, flow: &Flow) -> Result<()>;

    async fn delete_flow(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Live persisted flows owned by `customer_id`.
    async fn count_flows(&self, customer_id: Uuid) -> Result<i64>;

    // ========================================================================
    // Activeflows
    // ========================================================================

    async fn insert_activeflow(&self, activeflow: &Activeflow) -> Result<()>;

    async fn get_activeflow(&self, id: Uuid) -> Result<Option<Activeflow>>;

    async fn list_activeflows(
        &self,
        filter: &ActiveflowFilter,
        page: &Page,
    ) -> Result<Vec<Activeflow>>;

    /// Compare-and-set write.
    ///
    /// Stores `activeflow` only if the stored version still equals
    /// `expected_version`. Returns whether the write happened. The caller
    /// sets `activeflow.version` to the new version before calling.
    async fn update_activeflow(&self, activeflow: &Activeflow, expected_version: i64)
    -> Result<bool>;

    async fn health_check_db(&self) -> Result<bool> {
        Ok(true)
    }
}
