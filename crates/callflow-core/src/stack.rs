// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution stack of an activeflow.
//!
//! A [`StackMap`] maps stack ids to frames. The bottom frame ([`STACK_ID_MAIN`])
//! holds the flow's graph; every nested invocation pushes a frame that records
//! where control returns (`return_stack_id` / `return_action_id`) once its
//! chain runs out. Frames form a single chain from the current frame down to
//! the main frame; a frame pushed but not yet entered hangs off the pending
//! forward override instead. Frames reachable from neither are dropped.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::action::{Action, ActionOption, ID_EMPTY, ID_START};
use crate::error::{CoreError, Result};

/// Reserved "no stack" identifier.
pub const STACK_ID_EMPTY: Uuid = Uuid::nil();

/// Identifier of the bottom frame.
pub const STACK_ID_MAIN: Uuid = Uuid::from_u128(1);

/// How an exhausted frame hands control back to its parent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnMode {
    /// Continue with the successor of the return action.
    #[default]
    After,
    /// Run the return action itself.
    At,
}

/// One frame: an action graph plus its return address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StackRepr", into = "StackRepr")]
pub struct Stack {
    id: Uuid,
    actions: Vec<Action>,
    index: HashMap<Uuid, usize>,
    return_stack_id: Uuid,
    return_action_id: Uuid,
    return_mode: ReturnMode,
    service_id: Option<Uuid>,
}

#[derive(Serialize, Deserialize)]
struct StackRepr {
    id: Uuid,
    actions: Vec<Action>,
    return_stack_id: Uuid,
    return_action_id: Uuid,
    #[serde(default)]
    return_mode: ReturnMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_id: Option<Uuid>,
}

impl From<StackRepr> for Stack {
    fn from(repr: StackRepr) -> Self {
        let mut stack = Stack {
            id: repr.id,
            actions: repr.actions,
            index: HashMap::new(),
            return_stack_id: repr.return_stack_id,
            return_action_id: repr.return_action_id,
            return_mode: repr.return_mode,
            service_id: repr.service_id,
        };
        stack.reindex();
        stack
    }
}

impl From<Stack> for StackRepr {
    fn from(stack: Stack) -> Self {
        StackRepr {
            id: stack.id,
            actions: stack.actions,
            return_stack_id: stack.return_stack_id,
            return_action_id: stack.return_action_id,
            return_mode: stack.return_mode,
            service_id: stack.service_id,
        }
    }
}

impl Stack {
    /// Build a frame.
    pub fn new(
        id: Uuid,
        actions: Vec<Action>,
        return_stack_id: Uuid,
        return_action_id: Uuid,
        return_mode: ReturnMode,
        service_id: Option<Uuid>,
    ) -> Self {
        StackRepr {
            id,
            actions,
            return_stack_id,
            return_action_id,
            return_mode,
            service_id,
        }
        .into()
    }

    fn reindex(&mut self) {
        self.index = self
            .actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id, i))
            .collect();
    }

    /// Frame id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Actions of the frame, in storage order.
    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    /// Stack control returns to when this frame is exhausted.
    pub fn return_stack_id(&self) -> Uuid {
        self.return_stack_id
    }

    /// Action whose successor runs when this frame is exhausted.
    pub fn return_action_id(&self) -> Uuid {
        self.return_action_id
    }

    /// Whether the return action itself or its successor runs next.
    pub fn return_mode(&self) -> ReturnMode {
        self.return_mode
    }

    /// Action that runs in `parent` once this frame is exhausted, or
    /// [`ID_EMPTY`] when the parent has nothing left to run.
    pub fn resume_in(&self, parent: &Stack) -> Result<Uuid> {
        let return_action_id = self.return_action_id;
        if return_action_id == ID_START || return_action_id == ID_EMPTY {
            return Ok(parent.entry().map(|a| a.id).unwrap_or(ID_EMPTY));
        }
        let action = parent.get(return_action_id).ok_or_else(|| {
            CoreError::validation(
                "return_action_id",
                format!(
                    "return action '{}' not found in stack '{}'",
                    return_action_id, parent.id
                ),
            )
        })?;
        Ok(match self.return_mode {
            ReturnMode::After => action.next_id,
            ReturnMode::At => action.id,
        })
    }

    /// Sub-service this frame belongs to, if any.
    pub fn service_id(&self) -> Option<Uuid> {
        self.service_id
    }

    /// Look up an action by id.
    pub fn get(&self, action_id: Uuid) -> Option<&Action> {
        self.index.get(&action_id).map(|&i| &self.actions[i])
    }

    /// First action of the graph, where a fresh entry into the frame lands.
    pub fn entry(&self) -> Option<&Action> {
        self.actions.first()
    }

    /// Replace the option bag of one action.
    pub fn set_option(&mut self, action_id: Uuid, option: ActionOption) -> Result<()> {
        let idx = *self.index.get(&action_id).ok_or_else(|| {
            CoreError::validation(
                "action_id",
                format!("action '{}' not found in stack '{}'", action_id, self.id),
            )
        })?;
        self.actions[idx].option = option;
        Ok(())
    }

    /// Splice compiled actions in right after `after_id`.
    ///
    /// The last inserted action inherits the old successor of `after_id`. With
    /// `after_id` equal to [`ID_START`] the actions become the new entry.
    pub fn insert_after(&mut self, after_id: Uuid, mut actions: Vec<Action>) -> Result<()> {
        if actions.is_empty() {
            return Ok(());
        }
        if let Some(dup) = actions.iter().find(|a| self.index.contains_key(&a.id)) {
            return Err(CoreError::validation(
                "actions",
                format!("action id '{}' already exists in stack '{}'", dup.id, self.id),
            ));
        }

        let (position, old_next) = if after_id == ID_START {
            (0, self.entry().map(|a| a.id).unwrap_or(ID_EMPTY))
        } else {
            let idx = *self.index.get(&after_id).ok_or_else(|| {
                CoreError::validation(
                    "current_action_id",
                    format!("action '{}' not found in stack '{}'", after_id, self.id),
                )
            })?;
            let old_next = self.actions[idx].next_id;
            self.actions[idx].next_id = actions[0].id;
            (idx + 1, old_next)
        };

        if let Some(last) = actions.last_mut() {
            last.next_id = old_next;
        }
        self.actions.splice(position..position, actions);
        self.reindex();
        Ok(())
    }
}

/// Result of one resolution step over the stack.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// The next action and the frame it lives in.
    Action {
        /// Frame of the resolved action.
        stack_id: Uuid,
        /// The resolved action.
        action: Action,
    },
    /// The main frame ran out of actions.
    Exhausted,
}

/// Mapping from stack id to frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StackMap(BTreeMap<Uuid, Stack>);

impl StackMap {
    /// Create a stack map whose main frame holds `actions`.
    pub fn new(actions: Vec<Action>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(
            STACK_ID_MAIN,
            Stack::new(
                STACK_ID_MAIN,
                actions,
                STACK_ID_EMPTY,
                ID_EMPTY,
                ReturnMode::After,
                None,
            ),
        );
        Self(map)
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no frames at all.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a frame.
    pub fn get(&self, stack_id: Uuid) -> Option<&Stack> {
        self.0.get(&stack_id)
    }

    /// Look up a frame mutably.
    pub fn get_mut(&mut self, stack_id: Uuid) -> Option<&mut Stack> {
        self.0.get_mut(&stack_id)
    }

    fn frame(&self, stack_id: Uuid) -> Result<&Stack> {
        self.get(stack_id).ok_or_else(|| {
            CoreError::validation("stack_id", format!("stack '{}' not found", stack_id))
        })
    }

    /// Iterate frames in id order.
    pub fn frames(&self) -> impl Iterator<Item = &Stack> {
        self.0.values()
    }

    /// Push a new frame returning after `return_action_id` in
    /// `return_stack_id`.
    pub fn push(
        &mut self,
        actions: Vec<Action>,
        return_stack_id: Uuid,
        return_action_id: Uuid,
        service_id: Option<Uuid>,
    ) -> Result<Uuid> {
        self.push_with_mode(
            actions,
            return_stack_id,
            return_action_id,
            ReturnMode::After,
            service_id,
        )
    }

    /// Push a new frame with an explicit return mode.
    pub fn push_with_mode(
        &mut self,
        actions: Vec<Action>,
        return_stack_id: Uuid,
        return_action_id: Uuid,
        return_mode: ReturnMode,
        service_id: Option<Uuid>,
    ) -> Result<Uuid> {
        self.frame(return_stack_id)?;

        let stack_id = Uuid::new_v4();
        self.0.insert(
            stack_id,
            Stack::new(
                stack_id,
                actions,
                return_stack_id,
                return_action_id,
                return_mode,
                service_id,
            ),
        );
        Ok(stack_id)
    }

    /// Remove a nested frame. The main frame cannot be popped.
    pub fn pop(&mut self, stack_id: Uuid) -> Result<Stack> {
        if stack_id == STACK_ID_MAIN {
            return Err(CoreError::validation(
                "stack_id",
                "the main stack cannot be popped",
            ));
        }
        self.0.remove(&stack_id).ok_or_else(|| {
            CoreError::validation("stack_id", format!("stack '{}' not found", stack_id))
        })
    }

    /// Replace the main frame's graph, dropping every nested frame.
    pub fn reset_main(&mut self, actions: Vec<Action>) {
        *self = Self::new(actions);
    }

    /// Chain of frame ids from `stack_id` down to the main frame.
    fn chain(&self, stack_id: Uuid) -> Vec<Uuid> {
        let mut chain = Vec::new();
        let mut cursor = stack_id;
        while let Some(frame) = self.get(cursor) {
            if chain.contains(&cursor) {
                break;
            }
            chain.push(cursor);
            if cursor == STACK_ID_MAIN {
                break;
            }
            cursor = frame.return_stack_id;
        }
        chain
    }

    /// Find the frame holding `action_id`, starting at `from_stack_id` and
    /// walking outwards through its parents before trying the other frames.
    pub fn search_action(&self, from_stack_id: Uuid, action_id: Uuid) -> Option<Uuid> {
        let chain = self.chain(from_stack_id);
        chain
            .iter()
            .copied()
            .find(|id| self.get(*id).is_some_and(|f| f.get(action_id).is_some()))
            .or_else(|| {
                self.0
                    .values()
                    .find(|f| !chain.contains(&f.id) && f.get(action_id).is_some())
                    .map(|f| f.id)
            })
    }

    /// Drop the frames stacked above `to_stack_id` on the chain starting at
    /// `from_stack_id`. Does nothing if `to_stack_id` is not an ancestor.
    pub fn unwind(&mut self, from_stack_id: Uuid, to_stack_id: Uuid) -> usize {
        let chain = self.chain(from_stack_id);
        let Some(pos) = chain.iter().position(|id| *id == to_stack_id) else {
            return 0;
        };
        for id in &chain[..pos] {
            self.0.remove(id);
        }
        pos
    }

    /// Drop every frame that is not on the chain of one of `roots`. The main
    /// frame always stays. Returns the number of frames dropped.
    pub fn retain_reachable(&mut self, roots: &[Uuid]) -> usize {
        let mut keep: HashSet<Uuid> = roots.iter().flat_map(|root| self.chain(*root)).collect();
        keep.insert(STACK_ID_MAIN);

        let before = self.0.len();
        self.0.retain(|id, _| keep.contains(id));
        before - self.0.len()
    }

    /// Frame tagged with `service_id`.
    pub fn find_service(&self, service_id: Uuid) -> Option<Uuid> {
        self.0
            .values()
            .find(|f| f.service_id == Some(service_id))
            .map(|f| f.id)
    }

    /// Remove `root` and every frame stacked on top of it.
    ///
    /// Returns the removed root so the caller can restore its return address.
    pub fn remove_subtree(&mut self, root: Uuid) -> Result<Stack> {
        if root == STACK_ID_MAIN {
            return Err(CoreError::validation(
                "stack_id",
                "the main stack cannot be removed",
            ));
        }
        let doomed: HashSet<Uuid> = self
            .0
            .keys()
            .copied()
            .filter(|id| self.chain(*id).contains(&root))
            .collect();

        let mut removed_root = None;
        for id in doomed {
            if let Some(frame) = self.0.remove(&id)
                && id == root
            {
                removed_root = Some(frame);
            }
        }
        removed_root.ok_or_else(|| {
            CoreError::validation("stack_id", format!("stack '{}' not found", root))
        })
    }

    /// Resolve the successor of `current` inside `stack_id`.
    ///
    /// Nested frames that run out are popped and resolution continues at the
    /// successor of their return action. Running out of the main frame yields
    /// [`Step::Exhausted`]. The frame's copy of `current` wins over the
    /// caller's copy so links rewritten by splicing are honoured.
    pub fn next_action(&mut self, stack_id: Uuid, current: &Action) -> Result<Step> {
        let mut stack_id = stack_id;
        let mut next_id = {
            let frame = self.frame(stack_id)?;
            successor_of(frame, current.id, current.next_id)
        };

        loop {
            let frame = self.frame(stack_id)?;
            if next_id != ID_EMPTY {
                let action = frame.get(next_id).cloned().ok_or_else(|| {
                    CoreError::validation(
                        "next_id",
                        format!("action '{}' not found in stack '{}'", next_id, stack_id),
                    )
                })?;
                return Ok(Step::Action { stack_id, action });
            }

            if stack_id == STACK_ID_MAIN {
                return Ok(Step::Exhausted);
            }

            let popped = self.pop(stack_id)?;
            stack_id = popped.return_stack_id;
            next_id = popped.resume_in(self.frame(stack_id)?)?;
        }
    }
}

fn successor_of(frame: &Stack, action_id: Uuid, fallback: Uuid) -> Uuid {
    if action_id == ID_START {
        return frame.entry().map(|a| a.id).unwrap_or(ID_EMPTY);
    }
    frame.get(action_id).map(|a| a.next_id).unwrap_or(fallback)
}
