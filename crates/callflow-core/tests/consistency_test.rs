// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Compare-and-set commits, store deadlines and the loop guard.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use callflow_core::action::{Action, ActionType, AuthoredAction, ID_EMPTY};
use callflow_core::activeflow::{Activeflow, ActiveflowFilter, ActiveflowStatus, ReferenceType};
use callflow_core::activeflow_handlers::{EngineSettings, NextAction};
use callflow_core::error::{CoreError, Result};
use callflow_core::flow::{Flow, FlowFilter, FlowType};
use callflow_core::persistence::{Page, Persistence};

use common::{TestContext, TestOptions, action, goto, ids};

/// Store wrapper that can lose compare-and-set races and stall reads.
struct FaultyPersistence {
    inner: Arc<dyn Persistence>,
    lost_updates: AtomicUsize,
    read_delay: Option<Duration>,
}

impl FaultyPersistence {
    fn losing(inner: Arc<dyn Persistence>, lost_updates: usize) -> Self {
        Self {
            inner,
            lost_updates: AtomicUsize::new(lost_updates),
            read_delay: None,
        }
    }

    fn slow(inner: Arc<dyn Persistence>, read_delay: Duration) -> Self {
        Self {
            inner,
            lost_updates: AtomicUsize::new(0),
            read_delay: Some(read_delay),
        }
    }
}

#[async_trait]
impl Persistence for FaultyPersistence {
    async fn insert_flow(&self, flow: &Flow) -> Result<()> {
        self.inner.insert_flow(flow).await
    }

    async fn get_flow(&self, id: Uuid) -> Result<Option<Flow>> {
        self.inner.get_flow(id).await
    }

    async fn list_flows(&self, filter: &FlowFilter, page: &Page) -> Result<Vec<Flow>> {
        self.inner.list_flows(filter, page).await
    }

    async fn update_flow(&self, flow: &Flow) -> Result<()> {
        self.inner.update_flow(flow).await
    }

    async fn delete_flow(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.inner.delete_flow(id, at).await
    }

    async fn count_flows(&self, customer_id: Uuid) -> Result<i64> {
        self.inner.count_flows(customer_id).await
    }

    async fn insert_activeflow(&self, activeflow: &Activeflow) -> Result<()> {
        self.inner.insert_activeflow(activeflow).await
    }

    async fn get_activeflow(&self, id: Uuid) -> Result<Option<Activeflow>> {
        if let Some(delay) = self.read_delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get_activeflow(id).await
    }

    async fn list_activeflows(
        &self,
        filter: &ActiveflowFilter,
        page: &Page,
    ) -> Result<Vec<Activeflow>> {
        self.inner.list_activeflows(filter, page).await
    }

    async fn update_activeflow(&self, activeflow: &Activeflow, expected_version: i64) -> Result<bool> {
        let lose = self
            .lost_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Ok(false);
        }
        self.inner.update_activeflow(activeflow, expected_version).await
    }
}

// ============================================================================
// Compare-and-set
// ============================================================================

#[tokio::test]
async fn test_lost_race_is_retried_once() {
    let ctx = TestContext::with_persistence(TestOptions::default(), |inner| {
        Arc::new(FaultyPersistence::losing(inner, 1))
    })
    .await;
    let [a] = ids();
    let af = ctx.start(vec![action("answer", a)]).await;

    assert_eq!(ctx.next_id(af.id).await, a);

    let stored = ctx.engine.get(af.id).await.unwrap();
    assert_eq!(stored.version, 1);
    // The mutation ran against fresh state, not on top of the lost attempt
    assert_eq!(stored.execute_count, 1);
    assert_eq!(stored.executed_actions.len(), 1);
}

#[tokio::test]
async fn test_repeated_lost_race_is_conflict() {
    let ctx = TestContext::with_persistence(TestOptions::default(), |inner| {
        Arc::new(FaultyPersistence::losing(inner, usize::MAX))
    })
    .await;
    let af = ctx.start(vec![AuthoredAction::new("answer")]).await;

    let err = ctx.next(af.id).await.unwrap_err();
    assert!(matches!(err, CoreError::Conflict { .. }));
    assert_eq!(err.error_code(), "CONFLICT");

    let stored = ctx.engine.get(af.id).await.unwrap();
    assert_eq!(stored.version, 0);
    assert_eq!(stored.execute_count, 0);
    assert!(stored.current_action.is_start());
}

#[tokio::test]
async fn test_stale_version_is_refused_by_store() {
    let ctx = TestContext::new().await;
    let af = ctx.start(vec![AuthoredAction::new("answer")]).await;
    ctx.next(af.id).await.unwrap();

    let mut stale = af.clone();
    stale.version = 1;
    stale.execute_count = 42;
    let written = ctx.persistence.update_activeflow(&stale, 0).await.unwrap();
    assert!(!written);

    let stored = ctx.engine.get(af.id).await.unwrap();
    assert_eq!(stored.execute_count, 1);
}

#[tokio::test]
async fn test_concurrent_pushes_never_lose_frames() {
    let ctx = TestContext::new().await;
    let af = ctx.start(vec![AuthoredAction::new("answer")]).await;
    ctx.next(af.id).await.unwrap();

    let id = af.id;
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let engine = ctx.engine.clone();
            tokio::spawn(async move {
                engine
                    .push_actions(id, &[AuthoredAction::new("play")], None)
                    .await
            })
        })
        .collect();

    // Each push makes its own frame's entry the pending forward
    let mut pushed = Vec::new();
    for result in futures::future::join_all(tasks).await {
        match result.unwrap() {
            Ok(updated) => pushed.push(updated.forward_action_id),
            Err(CoreError::Conflict { .. }) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
    assert!(!pushed.is_empty());

    let stored = ctx.engine.get(af.id).await.unwrap();
    assert_eq!(stored.stack_map.len(), 1 + pushed.len());
    assert_eq!(stored.version, 1 + pushed.len() as i64);

    // Every pushed action is handed out exactly once, last pushed first
    let mut handed_out = Vec::new();
    while let NextAction::Action(action) = ctx.next(af.id).await.unwrap() {
        handed_out.push(action.id);
    }
    pushed.sort();
    let mut sorted = handed_out.clone();
    sorted.sort();
    assert_eq!(sorted, pushed);

    let stored = ctx.engine.get(af.id).await.unwrap();
    assert_eq!(stored.status, ActiveflowStatus::Completed);
    assert_eq!(stored.stack_map.len(), 1);
}

// ============================================================================
// Deadlines
// ============================================================================

#[tokio::test]
async fn test_slow_store_times_out() {
    let options = TestOptions {
        engine: EngineSettings {
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    };
    let ctx = TestContext::with_persistence(options, |inner| {
        Arc::new(FaultyPersistence::slow(inner, Duration::from_millis(500)))
    })
    .await;
    let flow = ctx.create_flow(vec![AuthoredAction::new("answer")]).await;
    let af = ctx.start_flow(flow.id).await;

    let err = ctx
        .engine
        .execute_next_action(af.id, af.current_action.id)
        .await
        .unwrap_err();
    match err {
        CoreError::Timeout { operation } => assert_eq!(operation, "get_activeflow"),
        other => panic!("unexpected error: {other}"),
    }
}

// ============================================================================
// Loop guard
// ============================================================================

#[tokio::test]
async fn test_goto_cycle_trips_loop_guard() {
    let ctx = TestContext::new().await;
    let [e, jump] = ids();
    let af = ctx
        .start(vec![action("empty", e), goto(jump, e, 1_000)])
        .await;

    let err = ctx.next(af.id).await.unwrap_err();
    match &err {
        CoreError::LoopDetected { execute_count, .. } => {
            assert_eq!(*execute_count, ctx.engine.settings().max_execute_count + 1)
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.error_code(), "LOOP_DETECTED");

    // Nothing was written
    let stored = ctx.engine.get(af.id).await.unwrap();
    assert_eq!(stored.version, 0);
    assert_eq!(stored.execute_count, 0);
    assert!(stored.current_action.is_start());
}

#[tokio::test]
async fn test_linked_cycle_trips_loop_guard() {
    let ctx = TestContext::new().await;
    let [first, second] = ids();

    // A graph the compiler never produces: two empties pointing at each other
    let actions = vec![
        Action {
            id: first,
            next_id: second,
            action_type: ActionType::Empty,
            option: Default::default(),
        },
        Action {
            id: second,
            next_id: first,
            action_type: ActionType::Empty,
            option: Default::default(),
        },
    ];
    let now = Utc::now();
    let flow = Flow {
        id: Uuid::new_v4(),
        customer_id: ctx.customer_id,
        flow_type: FlowType::Flow,
        name: "cycle".to_string(),
        detail: String::new(),
        persist: true,
        actions,
        on_complete_flow_id: None,
        tm_create: now,
        tm_update: now,
        tm_delete: None,
    };
    ctx.persistence.insert_flow(&flow).await.unwrap();
    let af = Activeflow::new(Uuid::new_v4(), &flow, ReferenceType::Call, Uuid::new_v4(), None);
    ctx.persistence.insert_activeflow(&af).await.unwrap();

    let err = ctx.next(af.id).await.unwrap_err();
    assert!(matches!(err, CoreError::LoopDetected { .. }));
}

#[tokio::test]
async fn test_execute_count_budget_spans_requests() {
    let options = TestOptions {
        engine: EngineSettings {
            max_execute_count: 3,
            ..Default::default()
        },
        ..Default::default()
    };
    let ctx = TestContext::with_options(options).await;
    let [a, b, c, d] = ids();
    let af = ctx
        .start(vec![
            action("answer", a),
            action("talk", b),
            action("play", c),
            action("hangup", d),
        ])
        .await;

    assert_eq!(ctx.next_id(af.id).await, a);
    assert_eq!(ctx.next_id(af.id).await, b);
    assert_eq!(ctx.next_id(af.id).await, c);

    let err = ctx.next(af.id).await.unwrap_err();
    assert!(matches!(err, CoreError::LoopDetected { execute_count: 4, .. }));

    let stored = ctx.engine.get(af.id).await.unwrap();
    assert_eq!(stored.current_action.id, c);
    assert_eq!(stored.current_action.next_id, d);
    assert_ne!(stored.current_action.next_id, ID_EMPTY);
}
