// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activeflow engine.
//!
//! Owns the runtime interpretation of a flow: next-action resolution over the
//! execution stack, forward overrides, pushed and added actions, sub-service
//! termination, and the loop guard.
//!
//! Every mutating operation is a read-modify-write of one activeflow record,
//! committed with a compare-and-set on the record version. A lost race is
//! retried once against fresh state before surfacing as
//! [`CoreError::Conflict`]. Nothing is written when an operation fails.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::action::{Action, ActionType, AuthoredAction, ID_EMPTY, OptionGoto};
use crate::activeflow::{Activeflow, ActiveflowFilter, ActiveflowStatus, ReferenceType};
use crate::compiler::compile;
use crate::driver::{CallDriver, DriverNotice};
use crate::error::{CoreError, Result};
use crate::events::{EventPublisher, EventType, publish_logged};
use crate::flow::Flow;
use crate::flow_handlers::FlowHandler;
use crate::persistence::{self, Page, Persistence, with_deadline};
use crate::stack::{ReturnMode, STACK_ID_EMPTY, STACK_ID_MAIN, Step};

/// Default loop guard ceiling.
pub const DEFAULT_MAX_EXECUTE_COUNT: u64 = 100;

/// Attempts per compare-and-set commit.
const COMMIT_ATTEMPTS: usize = 2;

/// Engine limits and deadlines.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Resolution steps allowed before [`CoreError::LoopDetected`].
    pub max_execute_count: u64,
    /// Deadline for each store call.
    pub request_timeout: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_execute_count: DEFAULT_MAX_EXECUTE_COUNT,
            request_timeout: Duration::from_millis(3000),
        }
    }
}

/// Outcome of a next-action resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum NextAction {
    /// Hand this action to the driver.
    Action(Action),
    /// Parked on a `block` action until [`ActiveflowHandler::execute_continue`].
    Blocked,
    /// The activeflow reached a terminal status; nothing more to run.
    Finished,
}

impl NextAction {
    /// The resolved action, if any.
    pub fn action(&self) -> Option<&Action> {
        match self {
            NextAction::Action(action) => Some(action),
            NextAction::Blocked | NextAction::Finished => None,
        }
    }

    /// Whether resolution ended the activeflow.
    pub fn is_finished(&self) -> bool {
        matches!(self, NextAction::Finished)
    }
}

/// Input of an activeflow creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateActiveflowRequest {
    /// Preset id; generated when absent.
    #[serde(default)]
    pub id: Option<Uuid>,
    /// Flow to run.
    pub flow_id: Uuid,
    /// Kind of the driven entity.
    #[serde(default)]
    pub reference_type: ReferenceType,
    /// Driven entity.
    pub reference_id: Uuid,
    /// Activeflow that spawned this one.
    #[serde(default)]
    pub reference_activeflow_id: Option<Uuid>,
}

impl CreateActiveflowRequest {
    /// A call-driven activeflow with a generated id.
    pub fn new(flow_id: Uuid, reference_id: Uuid) -> Self {
        Self {
            id: None,
            flow_id,
            reference_type: ReferenceType::Call,
            reference_id,
            reference_activeflow_id: None,
        }
    }
}

/// The activeflow engine.
pub struct ActiveflowHandler {
    persistence: Arc<dyn Persistence>,
    flows: Arc<FlowHandler>,
    publisher: Arc<dyn EventPublisher>,
    driver: Arc<dyn CallDriver>,
    settings: EngineSettings,
}

impl ActiveflowHandler {
    /// Create the engine.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        flows: Arc<FlowHandler>,
        publisher: Arc<dyn EventPublisher>,
        driver: Arc<dyn CallDriver>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            persistence,
            flows,
            publisher,
            driver,
            settings,
        }
    }

    /// Flow store the engine reads templates from.
    pub fn flows(&self) -> &Arc<FlowHandler> {
        &self.flows
    }

    /// Engine settings.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    // ========================================================================
    // Create / Get / List / Delete
    // ========================================================================

    /// Start a new activeflow over a flow's graph.
    #[instrument(skip(self, request), fields(flow_id = %request.flow_id, reference_id = %request.reference_id))]
    pub async fn create(&self, request: CreateActiveflowRequest) -> Result<Activeflow> {
        // 1. Load the template
        let flow = self.flows.get(request.flow_id).await?;

        // 2. Refuse a preset id that is taken
        let id = match request.id {
            Some(id) => {
                if self.fetch(id).await?.is_some() {
                    return Err(CoreError::validation(
                        "id",
                        format!("activeflow '{}' already exists", id),
                    ));
                }
                id
            }
            None => Uuid::new_v4(),
        };

        // 3. Persist the fresh record
        let activeflow = Activeflow::new(
            id,
            &flow,
            request.reference_type,
            request.reference_id,
            request.reference_activeflow_id,
        );
        with_deadline(
            "insert_activeflow",
            self.settings.request_timeout,
            self.persistence.insert_activeflow(&activeflow),
        )
        .await?;

        info!(activeflow_id = %activeflow.id, "Activeflow created");
        self.publish(EventType::ActiveflowCreated, &activeflow).await;

        Ok(activeflow)
    }

    /// Fetch a live activeflow.
    #[instrument(skip(self))]
    pub async fn get(&self, id: Uuid) -> Result<Activeflow> {
        self.load_live(id).await
    }

    /// List activeflows, newest first.
    #[instrument(skip(self))]
    pub async fn list(&self, filter: &ActiveflowFilter, page: &Page) -> Result<Vec<Activeflow>> {
        with_deadline(
            "list_activeflows",
            self.settings.request_timeout,
            self.persistence.list_activeflows(filter, page),
        )
        .await
    }

    /// Soft-delete an activeflow, stopping it in the same write if running.
    #[instrument(skip(self), fields(activeflow_id = %id))]
    pub async fn delete(&self, id: Uuid) -> Result<Activeflow> {
        let (activeflow, ()) = self.commit(id, &DeleteMutation).await?;

        info!(status = %activeflow.status, "Activeflow deleted");
        self.publish(EventType::ActiveflowDeleted, &activeflow).await;

        Ok(activeflow)
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Resolve the next action to hand to the driver.
    ///
    /// `current_action_id` is the caller's belief about the current action.
    /// It is advisory: on mismatch the stored state wins.
    #[instrument(skip(self), fields(activeflow_id = %id))]
    pub async fn execute_next_action(&self, id: Uuid, current_action_id: Uuid) -> Result<NextAction> {
        let mutation = NextActionMutation { current_action_id };
        let (activeflow, next) = self.commit(id, &mutation).await.inspect_err(|e| {
            if matches!(e, CoreError::LoopDetected { .. }) {
                error!(error = %e, "Loop guard tripped, activeflow left unresolved");
            }
        })?;

        match &next {
            NextAction::Action(action) => debug!(
                action_id = %action.id,
                action_type = %action.action_type,
                execute_count = activeflow.execute_count,
                "Next action resolved"
            ),
            NextAction::Blocked => info!(
                action_id = %activeflow.current_action.id,
                "Activeflow blocked"
            ),
            NextAction::Finished => info!(status = %activeflow.status, "Activeflow finished"),
        }
        self.publish_status(&activeflow).await;

        Ok(next)
    }

    /// Set the one-shot forward override.
    ///
    /// Without `stack_id` the action is searched from the current frame
    /// outwards. With `forward_now` the override is resolved immediately in
    /// the same write and the resulting action is pushed to the driver.
    #[instrument(skip(self), fields(activeflow_id = %id))]
    pub async fn set_forward_action_id(
        &self,
        id: Uuid,
        action_id: Uuid,
        stack_id: Option<Uuid>,
        forward_now: bool,
    ) -> Result<()> {
        let mutation = SetForwardMutation {
            action_id,
            stack_id,
            forward_now,
        };
        let (activeflow, resolved) = self.commit(id, &mutation).await?;

        info!(
            forward_stack_id = %activeflow.forward_stack_id,
            forward_action_id = %action_id,
            forward_now,
            "Forward override set"
        );
        self.publish_status(&activeflow).await;

        if let Some(NextAction::Action(action)) = resolved {
            let notice = DriverNotice::Forwarded {
                activeflow_id: activeflow.id,
                reference_type: activeflow.reference_type,
                reference_id: activeflow.reference_id,
                action,
            };
            if let Err(e) = self.driver.notify(notice).await {
                error!(error = %e, "Failed to notify driver of forwarded action");
            }
        }

        Ok(())
    }

    // ========================================================================
    // Detached triggers
    // ========================================================================

    /// Tell the driver to start pulling actions.
    ///
    /// Returns at once; the notification runs on a detached task and its
    /// failures are only logged.
    pub fn execute(self: &Arc<Self>, id: Uuid) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.notify_execute(id).await {
                error!(activeflow_id = %id, error = %e, "Execute trigger failed");
            }
        });
    }

    /// Tell the driver to resume a blocked activeflow.
    ///
    /// The activeflow must be parked on a `block` action. The check runs
    /// before returning; the driver notification itself is detached like
    /// [`Self::execute`]. A stale `current_action_id` is replaced by the
    /// stored current action.
    #[instrument(skip(self), fields(activeflow_id = %id))]
    pub async fn execute_continue(&self, id: Uuid, current_action_id: Uuid) -> Result<()> {
        let activeflow = self.load_live(id).await?;
        ensure_running(&activeflow)?;
        if activeflow.current_action.action_type != ActionType::Block {
            return Err(CoreError::validation(
                "current_action",
                format!(
                    "activeflow '{}' is not blocked, current action type is '{}'",
                    id, activeflow.current_action.action_type
                ),
            ));
        }
        if activeflow.current_action.id != current_action_id {
            warn!(
                caller_action_id = %current_action_id,
                stored_action_id = %activeflow.current_action.id,
                "Stale current action on continue, resuming from stored state"
            );
        }

        let notice = DriverNotice::Continue {
            activeflow_id: activeflow.id,
            reference_type: activeflow.reference_type,
            reference_id: activeflow.reference_id,
            current_action_id: activeflow.current_action.id,
        };
        let driver = Arc::clone(&self.driver);
        tokio::spawn(async move {
            match driver.notify(notice).await {
                Ok(()) => debug!(activeflow_id = %id, "Driver notified to continue"),
                Err(e) => error!(activeflow_id = %id, error = %e, "Failed to notify driver to continue"),
            }
        });
        Ok(())
    }

    async fn notify_execute(&self, id: Uuid) -> Result<()> {
        let activeflow = self.load_live(id).await?;
        if activeflow.status.is_terminal() {
            warn!(activeflow_id = %id, status = %activeflow.status, "Not executing terminal activeflow");
            return Ok(());
        }

        let notice = DriverNotice::Execute {
            activeflow_id: activeflow.id,
            reference_type: activeflow.reference_type,
            reference_id: activeflow.reference_id,
        };
        match self.driver.notify(notice).await {
            Ok(()) => debug!(activeflow_id = %id, "Driver notified to execute"),
            Err(e) => error!(activeflow_id = %id, error = %e, "Failed to notify driver to execute"),
        }
        Ok(())
    }

    // ========================================================================
    // Stack manipulation
    // ========================================================================

    /// Run a compiled sequence in a new frame.
    ///
    /// The new frame's first action is the next one handed out. Once
    /// exhausted, the frame returns to the current action, or runs a pending
    /// forward override when one is set. Repeated pushes before resolution
    /// therefore run last-pushed first. `service_id` tags the frame for
    /// [`Self::service_stop`].
    #[instrument(skip(self, actions), fields(activeflow_id = %id, actions = actions.len()))]
    pub async fn push_actions(
        &self,
        id: Uuid,
        actions: &[AuthoredAction],
        service_id: Option<Uuid>,
    ) -> Result<Activeflow> {
        let compiled = compile(actions)?;
        if compiled.is_empty() {
            return Err(CoreError::validation("actions", "no actions to push"));
        }

        let mutation = PushActionsMutation {
            actions: compiled,
            service_id,
        };
        let (activeflow, stack_id) = self.commit(id, &mutation).await?;

        info!(%stack_id, frames = activeflow.stack_map.len(), "Actions pushed");
        self.publish_status(&activeflow).await;

        Ok(activeflow)
    }

    /// Splice compiled actions into the current frame right after the current
    /// action.
    #[instrument(skip(self, actions), fields(activeflow_id = %id, actions = actions.len()))]
    pub async fn add_actions(&self, id: Uuid, actions: &[AuthoredAction]) -> Result<Activeflow> {
        let compiled = compile(actions)?;
        let mutation = AddActionsMutation { actions: compiled };
        let (activeflow, ()) = self.commit(id, &mutation).await?;

        info!(stack_id = %activeflow.current_stack_id, "Actions added");
        self.publish_status(&activeflow).await;

        Ok(activeflow)
    }

    // ========================================================================
    // Termination
    // ========================================================================

    /// Stop the activeflow. Idempotent on terminal activeflows.
    #[instrument(skip(self), fields(activeflow_id = %id))]
    pub async fn stop(&self, id: Uuid) -> Result<Activeflow> {
        let (activeflow, changed) = self.commit(id, &StopMutation).await?;

        if changed {
            info!("Activeflow stopped");
            self.publish(EventType::ActiveflowStopped, &activeflow).await;
        } else {
            debug!(status = %activeflow.status, "Activeflow already terminal");
        }

        Ok(activeflow)
    }

    /// Abandon the frames of one sub-service and return control to the frame
    /// that started it. Unknown services are ignored.
    #[instrument(skip(self), fields(activeflow_id = %id, %service_id))]
    pub async fn service_stop(&self, id: Uuid, service_id: Uuid) -> Result<()> {
        let (activeflow, removed) = self.commit(id, &ServiceStopMutation { service_id }).await?;

        if removed {
            info!(stack_id = %activeflow.current_stack_id, "Service frames removed");
            self.publish_status(&activeflow).await;
        } else {
            debug!("No frame for service");
        }

        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn fetch(&self, id: Uuid) -> Result<Option<Activeflow>> {
        with_deadline(
            "get_activeflow",
            self.settings.request_timeout,
            self.persistence.get_activeflow(id),
        )
        .await
    }

    async fn load_live(&self, id: Uuid) -> Result<Activeflow> {
        match self.fetch(id).await? {
            Some(activeflow) if !activeflow.is_deleted() => Ok(activeflow),
            _ => Err(CoreError::ActiveflowNotFound {
                activeflow_id: id.to_string(),
            }),
        }
    }

    /// Read, mutate and compare-and-set one record, retrying once on a lost
    /// race.
    async fn commit<M: Mutation>(&self, id: Uuid, mutation: &M) -> Result<(Activeflow, M::Output)> {
        for attempt in 1..=COMMIT_ATTEMPTS {
            let mut activeflow = self.load_live(id).await?;
            let expected_version = activeflow.version;

            let output = mutation.apply(self, &mut activeflow).await?;

            activeflow.version = expected_version + 1;
            activeflow.tm_update = persistence::now();

            let written = with_deadline(
                "update_activeflow",
                self.settings.request_timeout,
                self.persistence.update_activeflow(&activeflow, expected_version),
            )
            .await?;
            if written {
                return Ok((activeflow, output));
            }

            warn!(
                activeflow_id = %id,
                mutation = mutation.name(),
                attempt,
                expected_version,
                "Concurrent modification, re-reading"
            );
        }

        Err(CoreError::Conflict {
            activeflow_id: id.to_string(),
        })
    }

    /// Resolve, then drop frames that neither the current frame nor a
    /// pending forward can reach any more.
    async fn resolve(&self, af: &mut Activeflow) -> Result<NextAction> {
        let next = self.advance(af).await?;

        let mut roots = vec![af.current_stack_id];
        if af.has_forward() {
            roots.push(af.forward_stack_id);
        }
        let dropped = af.stack_map.retain_reachable(&roots);
        if dropped > 0 {
            debug!(activeflow_id = %af.id, dropped, "Dropped unreachable frames");
        }

        Ok(next)
    }

    /// Resolve forward, stack and internal actions until a driver action, a
    /// block or a terminal status is reached.
    async fn advance(&self, af: &mut Activeflow) -> Result<NextAction> {
        if af.status.is_terminal() {
            return Err(terminal(af));
        }

        let mut step = if af.has_forward() {
            let (stack_id, action_id) = (af.forward_stack_id, af.forward_action_id);
            af.clear_forward();
            debug!(%stack_id, %action_id, "Following forward override");
            jump(af, stack_id, action_id)?
        } else {
            af.stack_map.next_action(af.current_stack_id, &af.current_action)?
        };

        loop {
            af.execute_count += 1;
            if af.execute_count > self.settings.max_execute_count {
                return Err(CoreError::LoopDetected {
                    activeflow_id: af.id.to_string(),
                    execute_count: af.execute_count,
                });
            }

            let (stack_id, action) = match step {
                Step::Action { stack_id, action } => (stack_id, action),
                Step::Exhausted => match self.on_complete_flow(af).await? {
                    Some(flow) => {
                        info!(activeflow_id = %af.id, flow_id = %flow.id, "Splicing on-complete flow");
                        af.flow_id = flow.id;
                        af.stack_map.reset_main(flow.actions);
                        af.current_stack_id = STACK_ID_MAIN;
                        af.current_action = Action::start();
                        step = af.stack_map.next_action(STACK_ID_MAIN, &af.current_action)?;
                        continue;
                    }
                    None => {
                        af.current_stack_id = STACK_ID_MAIN;
                        af.status = ActiveflowStatus::Completed;
                        return Ok(NextAction::Finished);
                    }
                },
            };

            af.current_stack_id = stack_id;
            af.current_action = action.clone();
            af.executed_actions.push(action.clone());

            step = match action.action_type {
                ActionType::Empty => af.stack_map.next_action(stack_id, &action)?,
                ActionType::Goto => goto(af, stack_id, &action)?,
                ActionType::Stop => {
                    af.status = ActiveflowStatus::Stopped;
                    return Ok(NextAction::Finished);
                }
                ActionType::Block => return Ok(NextAction::Blocked),
                _ => return Ok(NextAction::Action(action)),
            };
        }
    }

    /// Flow to splice in once the main frame is exhausted.
    async fn on_complete_flow(&self, af: &Activeflow) -> Result<Option<Flow>> {
        let current = match self.flows.get(af.flow_id).await {
            Ok(flow) => flow,
            Err(e) if e.is_not_found() => {
                debug!(flow_id = %af.flow_id, "Flow gone, completing");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let Some(next_flow_id) = current.on_complete_flow_id else {
            return Ok(None);
        };
        match self.flows.get(next_flow_id).await {
            Ok(flow) => Ok(Some(flow)),
            Err(e) if e.is_not_found() => {
                warn!(flow_id = %next_flow_id, "On-complete flow not found, completing");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn publish(&self, event_type: EventType, activeflow: &Activeflow) {
        publish_logged(
            self.publisher.as_ref(),
            event_type,
            activeflow.customer_id,
            activeflow,
        )
        .await;
    }

    async fn publish_status(&self, activeflow: &Activeflow) {
        let event_type = match activeflow.status {
            ActiveflowStatus::Stopped => EventType::ActiveflowStopped,
            ActiveflowStatus::Running | ActiveflowStatus::Completed => EventType::ActiveflowUpdated,
        };
        self.publish(event_type, activeflow).await;
    }
}

fn terminal(af: &Activeflow) -> CoreError {
    CoreError::Terminal {
        activeflow_id: af.id.to_string(),
        status: af.status.to_string(),
    }
}

fn ensure_running(af: &Activeflow) -> Result<()> {
    if af.status.is_terminal() {
        return Err(terminal(af));
    }
    Ok(())
}

/// Move control to `action_id` in `stack_id`, unwinding frames stacked above
/// the target when it is an ancestor of the current frame.
fn jump(af: &mut Activeflow, stack_id: Uuid, action_id: Uuid) -> Result<Step> {
    af.stack_map.unwind(af.current_stack_id, stack_id);

    let action = af
        .stack_map
        .get(stack_id)
        .and_then(|frame| frame.get(action_id))
        .cloned()
        .ok_or_else(|| {
            CoreError::validation(
                "action_id",
                format!("action '{}' not found in stack '{}'", action_id, stack_id),
            )
        })?;

    Ok(Step::Action { stack_id, action })
}

fn goto(af: &mut Activeflow, stack_id: Uuid, action: &Action) -> Result<Step> {
    let mut option = OptionGoto::parse(&action.option)
        .map_err(|e| CoreError::validation("option", e.to_string()))?;
    if option.loop_count == 0 {
        return af.stack_map.next_action(stack_id, action);
    }

    option.loop_count -= 1;
    let updated = option.to_option();
    if let Some(frame) = af.stack_map.get_mut(stack_id) {
        frame.set_option(action.id, updated.clone())?;
    }
    af.current_action.option = updated;

    let target_stack = af
        .stack_map
        .search_action(stack_id, option.target_id)
        .ok_or_else(|| {
            CoreError::validation(
                "target_id",
                format!("goto target '{}' not found", option.target_id),
            )
        })?;
    jump(af, target_stack, option.target_id)
}

// ============================================================================
// Mutations
// ============================================================================

/// One logical change to an activeflow, re-applied on retry.
#[async_trait]
trait Mutation: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn apply(&self, engine: &ActiveflowHandler, af: &mut Activeflow) -> Result<Self::Output>;
}

struct NextActionMutation {
    current_action_id: Uuid,
}

#[async_trait]
impl Mutation for NextActionMutation {
    type Output = NextAction;

    fn name(&self) -> &'static str {
        "next_action"
    }

    async fn apply(&self, engine: &ActiveflowHandler, af: &mut Activeflow) -> Result<NextAction> {
        if af.current_action.id != self.current_action_id {
            debug!(
                activeflow_id = %af.id,
                caller_action_id = %self.current_action_id,
                stored_action_id = %af.current_action.id,
                "Caller's current action is stale, resolving from stored state"
            );
        }
        engine.resolve(af).await
    }
}

struct SetForwardMutation {
    action_id: Uuid,
    stack_id: Option<Uuid>,
    forward_now: bool,
}

#[async_trait]
impl Mutation for SetForwardMutation {
    type Output = Option<NextAction>;

    fn name(&self) -> &'static str {
        "set_forward"
    }

    async fn apply(
        &self,
        engine: &ActiveflowHandler,
        af: &mut Activeflow,
    ) -> Result<Option<NextAction>> {
        ensure_running(af)?;

        let stack_id = match self.stack_id {
            Some(stack_id) if stack_id != STACK_ID_EMPTY => {
                let found = af
                    .stack_map
                    .get(stack_id)
                    .is_some_and(|frame| frame.get(self.action_id).is_some());
                if !found {
                    return Err(CoreError::validation(
                        "forward_action_id",
                        format!("action '{}' not found in stack '{}'", self.action_id, stack_id),
                    ));
                }
                stack_id
            }
            _ => af
                .stack_map
                .search_action(af.current_stack_id, self.action_id)
                .ok_or_else(|| {
                    CoreError::validation(
                        "forward_action_id",
                        format!("action '{}' not found in any stack", self.action_id),
                    )
                })?,
        };

        af.forward_stack_id = stack_id;
        af.forward_action_id = self.action_id;

        if self.forward_now {
            return engine.resolve(af).await.map(Some);
        }
        Ok(None)
    }
}

struct PushActionsMutation {
    actions: Vec<Action>,
    service_id: Option<Uuid>,
}

#[async_trait]
impl Mutation for PushActionsMutation {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "push_actions"
    }

    async fn apply(&self, _engine: &ActiveflowHandler, af: &mut Activeflow) -> Result<Uuid> {
        ensure_running(af)?;

        // A pending override runs once this frame is exhausted
        let (return_stack_id, return_action_id, return_mode) = if af.has_forward() {
            (af.forward_stack_id, af.forward_action_id, ReturnMode::At)
        } else {
            (af.current_stack_id, af.current_action.id, ReturnMode::After)
        };
        let stack_id = af.stack_map.push_with_mode(
            self.actions.clone(),
            return_stack_id,
            return_action_id,
            return_mode,
            self.service_id,
        )?;

        af.forward_stack_id = stack_id;
        af.forward_action_id = self.actions[0].id;
        Ok(stack_id)
    }
}

struct AddActionsMutation {
    actions: Vec<Action>,
}

#[async_trait]
impl Mutation for AddActionsMutation {
    type Output = ();

    fn name(&self) -> &'static str {
        "add_actions"
    }

    async fn apply(&self, _engine: &ActiveflowHandler, af: &mut Activeflow) -> Result<()> {
        ensure_running(af)?;

        let current_id = af.current_action.id;
        let frame = af.stack_map.get_mut(af.current_stack_id).ok_or_else(|| {
            CoreError::validation(
                "current_stack_id",
                format!("stack '{}' not found", af.current_stack_id),
            )
        })?;
        frame.insert_after(current_id, self.actions.clone())?;

        if let Some(stored) = frame.get(current_id) {
            af.current_action.next_id = stored.next_id;
        }
        Ok(())
    }
}

struct StopMutation;

#[async_trait]
impl Mutation for StopMutation {
    type Output = bool;

    fn name(&self) -> &'static str {
        "stop"
    }

    async fn apply(&self, _engine: &ActiveflowHandler, af: &mut Activeflow) -> Result<bool> {
        if af.status.is_terminal() {
            return Ok(false);
        }
        af.status = ActiveflowStatus::Stopped;
        Ok(true)
    }
}

struct ServiceStopMutation {
    service_id: Uuid,
}

#[async_trait]
impl Mutation for ServiceStopMutation {
    type Output = bool;

    fn name(&self) -> &'static str {
        "service_stop"
    }

    async fn apply(&self, _engine: &ActiveflowHandler, af: &mut Activeflow) -> Result<bool> {
        ensure_running(af)?;

        let Some(root) = af.stack_map.find_service(self.service_id) else {
            return Ok(false);
        };
        let removed = af.stack_map.remove_subtree(root)?;
        let return_stack_id = removed.return_stack_id();
        let parent = af.stack_map.get(return_stack_id).ok_or_else(|| {
            CoreError::validation(
                "return_stack_id",
                format!("stack '{}' not found", return_stack_id),
            )
        })?;

        // Control, or the pending forward, was inside the abandoned frames
        let current_gone = af.stack_map.get(af.current_stack_id).is_none();
        let forward_gone = af.has_forward() && af.stack_map.get(af.forward_stack_id).is_none();

        match removed.return_mode() {
            ReturnMode::After => {
                if current_gone {
                    af.current_action = parent
                        .get(removed.return_action_id())
                        .cloned()
                        .unwrap_or_else(Action::start);
                }
                if forward_gone {
                    af.clear_forward();
                }
            }
            ReturnMode::At if current_gone || forward_gone => {
                let resume_id = removed.resume_in(parent)?;
                if current_gone {
                    af.current_action = Action::start();
                }
                if resume_id == ID_EMPTY {
                    af.clear_forward();
                } else {
                    af.forward_stack_id = return_stack_id;
                    af.forward_action_id = resume_id;
                }
            }
            ReturnMode::At => {}
        }
        if current_gone {
            af.current_stack_id = return_stack_id;
        }
        Ok(true)
    }
}

struct DeleteMutation;

#[async_trait]
impl Mutation for DeleteMutation {
    type Output = ();

    fn name(&self) -> &'static str {
        "delete"
    }

    async fn apply(&self, _engine: &ActiveflowHandler, af: &mut Activeflow) -> Result<()> {
        if af.status == ActiveflowStatus::Running {
            af.status = ActiveflowStatus::Stopped;
        }
        af.tm_delete = Some(persistence::now());
        Ok(())
    }
}
