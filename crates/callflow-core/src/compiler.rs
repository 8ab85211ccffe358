// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action graph compiler.
//!
//! Turns an authored, ordered action list into a linked graph: every action
//! gets an identity and a `next_id` pointing at the action authored after it.
//! The last action points at [`ID_EMPTY`]. Compilation is all-or-nothing.

use std::collections::HashSet;

use serde_json::Value;
use uuid::Uuid;

use crate::action::{Action, ActionType, AuthoredAction, ID_EMPTY, ID_START, OptionGoto};
use crate::error::{CoreError, Result};

/// Compile authored actions into a linked action graph.
///
/// Preset identities are kept; missing ones are generated. Fails with a
/// validation error on an unknown type, a non-object option, a malformed
/// `goto` option, a reserved or duplicated identity.
pub fn compile(actions: &[AuthoredAction]) -> Result<Vec<Action>> {
    let mut compiled = Vec::with_capacity(actions.len());
    let mut seen = HashSet::with_capacity(actions.len());

    for (idx, authored) in actions.iter().enumerate() {
        let action_type: ActionType = authored.action_type.parse().map_err(|_| {
            CoreError::validation(
                format!("actions[{}].type", idx),
                format!("unknown action type '{}'", authored.action_type),
            )
        })?;

        let option = match &authored.option {
            Value::Null => serde_json::Map::new(),
            Value::Object(map) => map.clone(),
            other => {
                return Err(CoreError::validation(
                    format!("actions[{}].option", idx),
                    format!("option must be an object, got {}", json_kind(other)),
                ));
            }
        };

        if action_type == ActionType::Goto {
            OptionGoto::parse(&option).map_err(|e| {
                CoreError::validation(format!("actions[{}].option", idx), e.to_string())
            })?;
        }

        let id = match authored.id {
            Some(id) if id == ID_EMPTY || id == ID_START => {
                return Err(CoreError::validation(
                    format!("actions[{}].id", idx),
                    format!("'{}' is a reserved action id", id),
                ));
            }
            Some(id) => id,
            None => Uuid::new_v4(),
        };
        if !seen.insert(id) {
            return Err(CoreError::validation(
                format!("actions[{}].id", idx),
                format!("duplicate action id '{}'", id),
            ));
        }

        compiled.push(Action {
            id,
            next_id: ID_EMPTY,
            action_type,
            option,
        });
    }

    // Chain in authored order
    for i in 1..compiled.len() {
        let next = compiled[i].id;
        compiled[i - 1].next_id = next;
    }

    Ok(compiled)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn authored(types: &[&str]) -> Vec<AuthoredAction> {
        types.iter().map(|t| AuthoredAction::new(*t)).collect()
    }

    #[test]
    fn test_compile_empty() {
        let compiled = compile(&[]).unwrap();
        assert!(compiled.is_empty());
    }

    #[test]
    fn test_compile_answer_echo() {
        let compiled = compile(&authored(&["answer", "echo"])).unwrap();

        assert_eq!(compiled.len(), 2);
        assert_eq!(compiled[0].action_type, ActionType::Answer);
        assert_eq!(compiled[1].action_type, ActionType::Echo);
        assert_eq!(compiled[0].next_id, compiled[1].id);
        assert_eq!(compiled[1].next_id, ID_EMPTY);
    }

    #[test]
    fn test_chain_visits_every_action_once() {
        let compiled = compile(&authored(&[
            "answer", "talk", "play", "digits_receive", "hangup",
        ]))
        .unwrap();

        let mut visited = Vec::new();
        let mut cursor = compiled[0].id;
        while cursor != ID_EMPTY {
            let action = compiled.iter().find(|a| a.id == cursor).unwrap();
            assert!(!visited.contains(&action.id), "action visited twice");
            visited.push(action.id);
            cursor = action.next_id;
        }

        assert_eq!(visited.len(), compiled.len());
    }

    #[test]
    fn test_compile_keeps_preset_ids() {
        let preset = Uuid::new_v4();
        let compiled = compile(&[
            AuthoredAction::new("answer").with_id(preset),
            AuthoredAction::new("echo"),
        ])
        .unwrap();

        assert_eq!(compiled[0].id, preset);
        assert_ne!(compiled[1].id, preset);
        assert_eq!(compiled[0].next_id, compiled[1].id);
    }

    #[test]
    fn test_compile_keeps_option() {
        let compiled = compile(&[
            AuthoredAction::new("talk").with_option(json!({"text": "hello", "language": "en-US"})),
        ])
        .unwrap();

        assert_eq!(compiled[0].option["text"], "hello");
        assert_eq!(compiled[0].option["language"], "en-US");
    }

    #[test]
    fn test_compile_unknown_type() {
        let err = compile(&authored(&["answer", "dance"])).unwrap_err();
        match err {
            CoreError::ValidationError { field, message } => {
                assert_eq!(field, "actions[1].type");
                assert!(message.contains("dance"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_compile_non_object_option() {
        let err = compile(&[AuthoredAction::new("talk").with_option(json!(["hello"]))])
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
        assert!(err.to_string().contains("array"));
    }

    #[test]
    fn test_compile_malformed_goto() {
        let err = compile(&[AuthoredAction::new("goto").with_option(json!({"loop_count": 2}))])
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let ok = compile(&[AuthoredAction::new("goto")
            .with_option(json!({"target_id": Uuid::new_v4(), "loop_count": 2}))]);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_compile_duplicate_id() {
        let id = Uuid::new_v4();
        let err = compile(&[
            AuthoredAction::new("answer").with_id(id),
            AuthoredAction::new("echo").with_id(id),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_compile_reserved_id() {
        let err = compile(&[AuthoredAction::new("answer").with_id(ID_START)]).unwrap_err();
        assert!(err.to_string().contains("reserved"));
    }

    #[test]
    fn test_compile_is_deterministic_for_preset_ids() {
        let input = vec![
            AuthoredAction::new("answer").with_id(Uuid::from_u128(100)),
            AuthoredAction::new("echo").with_id(Uuid::from_u128(101)),
        ];
        assert_eq!(compile(&input).unwrap(), compile(&input).unwrap());
    }
}
