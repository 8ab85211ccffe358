//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use uuid::Uuid;

use crate::activeflow::{Activeflow, ActiveflowFilter};
use crate::error::{CoreError, Result};
use crate::flow::{Flow, FlowFilter};
use crate::migrations::SQLITE as MIGRATOR;

use super::{ActiveflowRecord, FlowRecord, Page, Persistence, format_timestamp};

const FLOW_COLUMNS: &str = r#"
    id, customer_id, type, name, detail, persist, actions,
    on_complete_flow_id, tm_create, tm_update, tm_delete
"#;

const ACTIVEFLOW_COLUMNS: &str = r#"
    id, customer_id, flow_id, status, reference_type, reference_id,
    reference_activeflow_id, current_stack_id, stack_map, current_action,
    forward_stack_id, forward_action_id, execute_count, executed_actions,
    version, tm_create, tm_update, tm_delete
"#;

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// Migrations are expected to have been applied already.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/callflow.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Connect using a `sqlite:` URL, or treat anything else as a file path.
    pub async fn from_url(url: &str) -> Result<Self> {
        if url.starts_with("sqlite:") {
            Self::connect(url).await
        } else {
            Self::from_path(url).await
        }
    }

    async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL '{}': {}", url, e),
            })?
            .create_if_missing(true);

        // In-memory databases are per connection
        let max_connections = if url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at '{}': {}", url, e),
            })?;

        MIGRATOR
            .run(&pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })?;

        Ok(Self { pool })
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_flow(&self, flow: &Flow) -> Result<()> {
        let actions = serde_json::to_string(&flow.actions)?;

        sqlx::query(
            r#"
            INSERT INTO flows (
                id, customer_id, type, name, detail, persist, actions,
                on_complete_flow_id, tm_create, tm_update, tm_delete
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(flow.id.to_string())
        .bind(flow.customer_id.to_string())
        .bind(flow.flow_type.as_str())
        .bind(&flow.name)
        .bind(&flow.detail)
        .bind(flow.persist)
        .bind(actions)
        .bind(flow.on_complete_flow_id.map(|id| id.to_string()))
        .bind(format_timestamp(&flow.tm_create))
        .bind(format_timestamp(&flow.tm_update))
        .bind(flow.tm_delete.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        let record = sqlx::query_as::<_, FlowRecord>(&format!(
            "SELECT {} FROM flows WHERE id = ?",
            FLOW_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record.map(Flow::try_from).transpose()
    }

    async fn list_flows(&self, filter: &FlowFilter, page: &Page) -> Result<Vec<Flow>> {
        let records = sqlx::query_as::<_, FlowRecord>(&format!(
            r#"
            SELECT {}
            FROM flows
            WHERE (?1 IS NULL OR customer_id = ?1)
              AND (?2 IS NULL OR type = ?2)
              AND ((?3 = 1 AND tm_delete IS NOT NULL) OR (?3 = 0 AND tm_delete IS NULL))
              AND (?4 IS NULL OR tm_create < ?4 OR (tm_create = ?4 AND id < ?5))
            ORDER BY tm_create DESC, id DESC
            LIMIT ?6
            "#,
            FLOW_COLUMNS
        ))
        .bind(filter.customer_id.map(|id| id.to_string()))
        .bind(filter.flow_type.map(|t| t.as_str()))
        .bind(filter.deleted)
        .bind(page.token.map(|t| format_timestamp(&t.tm_create)))
        .bind(page.token.map(|t| t.id.to_string()))
        .bind(page.limit())
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(Flow::try_from).collect()
    }

    async fn update_flow(&self, flow: &Flow) -> Result<()> {
        let actions = serde_json::to_string(&flow.actions)?;

        sqlx::query(
            r#"
            UPDATE flows
            SET name = ?, detail = ?, actions = ?, on_complete_flow_id = ?, tm_update = ?
            WHERE id = ?
            "#,
        )
        .bind(&flow.name)
        .bind(&flow.detail)
        .bind(actions)
        .bind(flow.on_complete_flow_id.map(|id| id.to_string()))
        .bind(format_timestamp(&flow.tm_update))
        .bind(flow.id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_flow(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let at = format_timestamp(&at);
        sqlx::query(
            r#"
            UPDATE flows
            SET tm_delete = ?, tm_update = ?
            WHERE id = ? AND tm_delete IS NULL
            "#,
        )
        .bind(&at)
        .bind(&at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn count_flows(&self, customer_id: Uuid) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM flows
            WHERE customer_id = ? AND persist = 1 AND tm_delete IS NULL
            "#,
        )
        .bind(customer_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    async fn insert_activeflow(&self, activeflow: &Activeflow) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO activeflows (
                id, customer_id, flow_id, status, reference_type, reference_id,
                reference_activeflow_id, current_stack_id, stack_map, current_action,
                forward_stack_id, forward_action_id, execute_count, executed_actions,
                version, tm_create, tm_update, tm_delete
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(activeflow.id.to_string())
        .bind(activeflow.customer_id.to_string())
        .bind(activeflow.flow_id.to_string())
        .bind(activeflow.status.as_str())
        .bind(activeflow.reference_type.as_str())
        .bind(activeflow.reference_id.to_string())
        .bind(activeflow.reference_activeflow_id.map(|id| id.to_string()))
        .bind(activeflow.current_stack_id.to_string())
        .bind(serde_json::to_string(&activeflow.stack_map)?)
        .bind(serde_json::to_string(&activeflow.current_action)?)
        .bind(activeflow.forward_stack_id.to_string())
        .bind(activeflow.forward_action_id.to_string())
        .bind(execute_count(activeflow)?)
        .bind(serde_json::to_string(&activeflow.executed_actions)?)
        .bind(activeflow.version)
        .bind(format_timestamp(&activeflow.tm_create))
        .bind(format_timestamp(&activeflow.tm_update))
        .bind(activeflow.tm_delete.as_ref().map(format_timestamp))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_activeflow(&self, id: Uuid) -> Result<Option<Activeflow>> {
        let record = sqlx::query_as::<_, ActiveflowRecord>(&format!(
            "SELECT {} FROM activeflows WHERE id = ?",
            ACTIVEFLOW_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        record.map(Activeflow::try_from).transpose()
    }

    async fn list_activeflows(
        &self,
        filter: &ActiveflowFilter,
        page: &Page,
    ) -> Result<Vec<Activeflow>> {
        let records = sqlx::query_as::<_, ActiveflowRecord>(&format!(
            r#"
            SELECT {}
            FROM activeflows
            WHERE (?1 IS NULL OR customer_id = ?1)
              AND (?2 IS NULL OR reference_id = ?2)
              AND (?3 IS NULL OR status = ?3)
              AND ((?4 = 1 AND tm_delete IS NOT NULL) OR (?4 = 0 AND tm_delete IS NULL))
              AND (?5 IS NULL OR tm_create < ?5 OR (tm_create = ?5 AND id < ?6))
            ORDER BY tm_create DESC, id DESC
            LIMIT ?7
            "#,
            ACTIVEFLOW_COLUMNS
        ))
        .bind(filter.customer_id.map(|id| id.to_string()))
        .bind(filter.reference_id.map(|id| id.to_string()))
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.deleted)
        .bind(page.token.map(|t| format_timestamp(&t.tm_create)))
        .bind(page.token.map(|t| t.id.to_string()))
        .bind(page.limit())
        .fetch_all(&self.pool)
        .await?;

        records.into_iter().map(Activeflow::try_from).collect()
    }

    async fn update_activeflow(
        &self,
        activeflow: &Activeflow,
        expected_version: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE activeflows
            SET flow_id = ?,
                status = ?,
                current_stack_id = ?,
                stack_map = ?,
                current_action = ?,
                forward_stack_id = ?,
                forward_action_id = ?,
                execute_count = ?,
                executed_actions = ?,
                version = ?,
                tm_update = ?,
                tm_delete = ?
            WHERE id = ? AND version = ?
            "#,
        )
        .bind(activeflow.flow_id.to_string())
        .bind(activeflow.status.as_str())
        .bind(activeflow.current_stack_id.to_string())
        .bind(serde_json::to_string(&activeflow.stack_map)?)
        .bind(serde_json::to_string(&activeflow.current_action)?)
        .bind(activeflow.forward_stack_id.to_string())
        .bind(activeflow.forward_action_id.to_string())
        .bind(execute_count(activeflow)?)
        .bind(serde_json::to_string(&activeflow.executed_actions)?)
        .bind(activeflow.version)
        .bind(format_timestamp(&activeflow.tm_update))
        .bind(activeflow.tm_delete.as_ref().map(format_timestamp))
        .bind(activeflow.id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool> {
        let result: std::result::Result<(i64,), _> =
            sqlx::query_as("SELECT 1").fetch_one(&self.pool).await;
        Ok(result.is_ok())
    }
}

fn execute_count(activeflow: &Activeflow) -> Result<i64> {
    i64::try_from(activeflow.execute_count).map_err(|e| CoreError::DatabaseError {
        operation: "encode".to_string(),
        details: format!("execute_count out of range: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::AuthoredAction;
    use crate::activeflow::{ActiveflowStatus, ReferenceType};
    use crate::compiler::compile;
    use crate::flow::FlowType;
    use crate::persistence::PageToken;
    use chrono::Duration;

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        MIGRATOR.run(&pool).await.expect("Failed to run migrations");

        pool
    }

    fn test_flow(customer_id: Uuid) -> Flow {
        let now = Utc::now();
        Flow {
            id: Uuid::new_v4(),
            customer_id,
            flow_type: FlowType::Flow,
            name: "inbound".to_string(),
            detail: "inbound calls".to_string(),
            persist: true,
            actions: compile(&[AuthoredAction::new("answer"), AuthoredAction::new("echo")])
                .unwrap(),
            on_complete_flow_id: None,
            tm_create: now,
            tm_update: now,
            tm_delete: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_flow() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let flow = test_flow(Uuid::new_v4());

        persistence.insert_flow(&flow).await.expect("insert flow");
        let loaded = persistence
            .get_flow(flow.id)
            .await
            .expect("get flow")
            .expect("flow should exist");

        assert_eq!(loaded.id, flow.id);
        assert_eq!(loaded.name, "inbound");
        assert_eq!(loaded.actions, flow.actions);
        assert!(loaded.persist);
    }

    #[tokio::test]
    async fn test_get_flow_not_found() {
        let persistence = SqlitePersistence::new(test_pool().await);
        assert!(persistence.get_flow(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_flow_is_soft() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let customer = Uuid::new_v4();
        let flow = test_flow(customer);
        persistence.insert_flow(&flow).await.unwrap();
        assert_eq!(persistence.count_flows(customer).await.unwrap(), 1);

        persistence.delete_flow(flow.id, Utc::now()).await.unwrap();

        let loaded = persistence.get_flow(flow.id).await.unwrap().unwrap();
        assert!(loaded.is_deleted());
        assert_eq!(persistence.count_flows(customer).await.unwrap(), 0);

        let live = persistence
            .list_flows(&FlowFilter { customer_id: Some(customer), ..Default::default() }, &Page::default())
            .await
            .unwrap();
        assert!(live.is_empty());

        let deleted = persistence
            .list_flows(
                &FlowFilter { customer_id: Some(customer), deleted: true, ..Default::default() },
                &Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
    }

    #[tokio::test]
    async fn test_list_flows_pages_newest_first() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let customer = Uuid::new_v4();
        let base = Utc::now();

        for i in 0..5 {
            let mut flow = test_flow(customer);
            flow.tm_create = base + Duration::milliseconds(i);
            flow.name = format!("flow-{}", i);
            persistence.insert_flow(&flow).await.unwrap();
        }
        // another customer's flow is filtered out
        persistence.insert_flow(&test_flow(Uuid::new_v4())).await.unwrap();

        let filter = FlowFilter {
            customer_id: Some(customer),
            ..Default::default()
        };
        let first = persistence
            .list_flows(&filter, &Page { token: None, size: 3 })
            .await
            .unwrap();
        let names: Vec<_> = first.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["flow-4", "flow-3", "flow-2"]);

        let second = persistence
            .list_flows(
                &filter,
                &Page {
                    token: Some(PageToken::new(first[2].tm_create, first[2].id)),
                    size: 3,
                },
            )
            .await
            .unwrap();
        let names: Vec<_> = second.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["flow-1", "flow-0"]);
    }

    #[tokio::test]
    async fn test_list_pages_through_shared_timestamps() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let customer = Uuid::new_v4();
        let created = Utc::now();

        let mut inserted = Vec::new();
        for _ in 0..5 {
            let mut flow = test_flow(customer);
            flow.tm_create = created;
            persistence.insert_flow(&flow).await.unwrap();
            inserted.push(flow.id);

            let mut af = Activeflow::new(Uuid::new_v4(), &flow, ReferenceType::Call, Uuid::new_v4(), None);
            af.tm_create = created;
            persistence.insert_activeflow(&af).await.unwrap();
        }

        let flow_filter = FlowFilter {
            customer_id: Some(customer),
            ..Default::default()
        };
        let mut seen = Vec::new();
        let mut page = Page { token: None, size: 2 };
        loop {
            let flows = persistence.list_flows(&flow_filter, &page).await.unwrap();
            let Some(last) = flows.last() else { break };
            page.token = Some(PageToken::new(last.tm_create, last.id));
            seen.extend(flows.iter().map(|f| f.id));
        }
        assert_eq!(seen.len(), 5);
        seen.sort();
        inserted.sort();
        assert_eq!(seen, inserted);

        let af_filter = ActiveflowFilter {
            customer_id: Some(customer),
            ..Default::default()
        };
        let mut seen = Vec::new();
        let mut page = Page { token: None, size: 2 };
        loop {
            let activeflows = persistence.list_activeflows(&af_filter, &page).await.unwrap();
            let Some(last) = activeflows.last() else { break };
            page.token = Some(PageToken::new(last.tm_create, last.id));
            seen.extend(activeflows.iter().map(|af| af.id));
        }
        let total = seen.len();
        seen.sort();
        seen.dedup();
        assert_eq!((total, seen.len()), (5, 5));
    }

    #[tokio::test]
    async fn test_count_flows_excludes_temporary() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let customer = Uuid::new_v4();
        let mut temp = test_flow(customer);
        temp.persist = false;
        persistence.insert_flow(&temp).await.unwrap();
        persistence.insert_flow(&test_flow(customer)).await.unwrap();

        assert_eq!(persistence.count_flows(customer).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_activeflow_round_trip() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let flow = test_flow(Uuid::new_v4());
        let af = Activeflow::new(Uuid::new_v4(), &flow, ReferenceType::Call, Uuid::new_v4(), None);

        persistence.insert_activeflow(&af).await.unwrap();
        let loaded = persistence.get_activeflow(af.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, af.id);
        assert_eq!(loaded.status, ActiveflowStatus::Running);
        assert_eq!(loaded.stack_map, af.stack_map);
        assert_eq!(loaded.current_action, af.current_action);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn test_update_activeflow_compare_and_set() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let flow = test_flow(Uuid::new_v4());
        let mut af = Activeflow::new(Uuid::new_v4(), &flow, ReferenceType::Call, Uuid::new_v4(), None);
        persistence.insert_activeflow(&af).await.unwrap();

        af.execute_count = 1;
        af.version = 1;
        assert!(persistence.update_activeflow(&af, 0).await.unwrap());

        // stale writer still believes version 0
        af.execute_count = 99;
        af.version = 1;
        assert!(!persistence.update_activeflow(&af, 0).await.unwrap());

        let loaded = persistence.get_activeflow(af.id).await.unwrap().unwrap();
        assert_eq!(loaded.execute_count, 1);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_list_activeflows_filters() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let flow = test_flow(Uuid::new_v4());
        let reference = Uuid::new_v4();

        let running = Activeflow::new(Uuid::new_v4(), &flow, ReferenceType::Call, reference, None);
        let mut stopped = Activeflow::new(Uuid::new_v4(), &flow, ReferenceType::Call, Uuid::new_v4(), None);
        stopped.status = ActiveflowStatus::Stopped;
        persistence.insert_activeflow(&running).await.unwrap();
        persistence.insert_activeflow(&stopped).await.unwrap();

        let by_reference = persistence
            .list_activeflows(
                &ActiveflowFilter { reference_id: Some(reference), ..Default::default() },
                &Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_reference.len(), 1);
        assert_eq!(by_reference[0].id, running.id);

        let by_status = persistence
            .list_activeflows(
                &ActiveflowFilter {
                    customer_id: Some(flow.customer_id),
                    status: Some(ActiveflowStatus::Stopped),
                    ..Default::default()
                },
                &Page::default(),
            )
            .await
            .unwrap();
        assert_eq!(by_status.len(), 1);
        assert_eq!(by_status[0].id, stopped.id);
    }

    #[tokio::test]
    async fn test_health_check() {
        let persistence = SqlitePersistence::new(test_pool().await);
        assert!(persistence.health_check_db().await.unwrap());
    }

    #[tokio::test]
    async fn test_from_path_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("callflow.db");

        let persistence = SqlitePersistence::from_path(&path).await.unwrap();
        assert!(path.exists());
        assert!(persistence.health_check_db().await.unwrap());
    }
}
