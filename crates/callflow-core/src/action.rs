// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Action model: one step of a flow and the link to its successor.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Reserved "end of chain" identifier.
pub const ID_EMPTY: Uuid = Uuid::nil();

/// Reserved identifier of the start marker a fresh activeflow points at.
pub const ID_START: Uuid = Uuid::from_u128(1);

/// Option bag attached to an action. Opaque to the engine.
pub type ActionOption = Map<String, Value>;

/// Action type tag.
///
/// The engine only interprets `empty`, `goto` and `stop`; every other type is
/// handed to the call-processing driver untouched.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    AgentCall,
    AiSummary,
    AiTalk,
    AiTask,
    Amd,
    Answer,
    Beep,
    Block,
    Branch,
    Call,
    ConditionCallDigits,
    ConditionCallStatus,
    ConditionDatetime,
    ConditionVariable,
    ConfbridgeJoin,
    ConferenceJoin,
    Connect,
    ConversationSend,
    DigitsReceive,
    DigitsSend,
    Echo,
    EmailSend,
    Empty,
    ExternalMediaStart,
    ExternalMediaStop,
    Fetch,
    FetchFlow,
    Goto,
    Hangup,
    MessageSend,
    Play,
    QueueJoin,
    RecordingStart,
    RecordingStop,
    Sleep,
    Stop,
    StreamEcho,
    Talk,
    TranscribeRecording,
    TranscribeStart,
    TranscribeStop,
    VariableSet,
    WebhookSend,
}

impl ActionType {
    /// Every recognized action type.
    pub const ALL: &'static [ActionType] = &[
        ActionType::AgentCall,
        ActionType::AiSummary,
        ActionType::AiTalk,
        ActionType::AiTask,
        ActionType::Amd,
        ActionType::Answer,
        ActionType::Beep,
        ActionType::Block,
        ActionType::Branch,
        ActionType::Call,
        ActionType::ConditionCallDigits,
        ActionType::ConditionCallStatus,
        ActionType::ConditionDatetime,
        ActionType::ConditionVariable,
        ActionType::ConfbridgeJoin,
        ActionType::ConferenceJoin,
        ActionType::Connect,
        ActionType::ConversationSend,
        ActionType::DigitsReceive,
        ActionType::DigitsSend,
        ActionType::Echo,
        ActionType::EmailSend,
        ActionType::Empty,
        ActionType::ExternalMediaStart,
        ActionType::ExternalMediaStop,
        ActionType::Fetch,
        ActionType::FetchFlow,
        ActionType::Goto,
        ActionType::Hangup,
        ActionType::MessageSend,
        ActionType::Play,
        ActionType::QueueJoin,
        ActionType::RecordingStart,
        ActionType::RecordingStop,
        ActionType::Sleep,
        ActionType::Stop,
        ActionType::StreamEcho,
        ActionType::Talk,
        ActionType::TranscribeRecording,
        ActionType::TranscribeStart,
        ActionType::TranscribeStop,
        ActionType::VariableSet,
        ActionType::WebhookSend,
    ];

    /// Wire name of the type.
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::AgentCall => "agent_call",
            ActionType::AiSummary => "ai_summary",
            ActionType::AiTalk => "ai_talk",
            ActionType::AiTask => "ai_task",
            ActionType::Amd => "amd",
            ActionType::Answer => "answer",
            ActionType::Beep => "beep",
            ActionType::Block => "block",
            ActionType::Branch => "branch",
            ActionType::Call => "call",
            ActionType::ConditionCallDigits => "condition_call_digits",
            ActionType::ConditionCallStatus => "condition_call_status",
            ActionType::ConditionDatetime => "condition_datetime",
            ActionType::ConditionVariable => "condition_variable",
            ActionType::ConfbridgeJoin => "confbridge_join",
            ActionType::ConferenceJoin => "conference_join",
            ActionType::Connect => "connect",
            ActionType::ConversationSend => "conversation_send",
            ActionType::DigitsReceive => "digits_receive",
            ActionType::DigitsSend => "digits_send",
            ActionType::Echo => "echo",
            ActionType::EmailSend => "email_send",
            ActionType::Empty => "empty",
            ActionType::ExternalMediaStart => "external_media_start",
            ActionType::ExternalMediaStop => "external_media_stop",
            ActionType::Fetch => "fetch",
            ActionType::FetchFlow => "fetch_flow",
            ActionType::Goto => "goto",
            ActionType::Hangup => "hangup",
            ActionType::MessageSend => "message_send",
            ActionType::Play => "play",
            ActionType::QueueJoin => "queue_join",
            ActionType::RecordingStart => "recording_start",
            ActionType::RecordingStop => "recording_stop",
            ActionType::Sleep => "sleep",
            ActionType::Stop => "stop",
            ActionType::StreamEcho => "stream_echo",
            ActionType::Talk => "talk",
            ActionType::TranscribeRecording => "transcribe_recording",
            ActionType::TranscribeStart => "transcribe_start",
            ActionType::TranscribeStop => "transcribe_stop",
            ActionType::VariableSet => "variable_set",
            ActionType::WebhookSend => "webhook_send",
        }
    }

    /// Types resolved inside the engine instead of being handed to the driver.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            ActionType::Block | ActionType::Empty | ActionType::Goto | ActionType::Stop
        )
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a type tag is not recognized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownActionType(pub String);

impl FromStr for ActionType {
    type Err = UnknownActionType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownActionType(s.to_string()))
    }
}

/// A compiled action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Identity, unique within its frame.
    pub id: Uuid,
    /// Successor, or [`ID_EMPTY`] at the end of the chain.
    pub next_id: Uuid,
    /// Type tag.
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Parameters for the driver.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub option: ActionOption,
}

impl Action {
    /// The start marker a new activeflow points at before its first resolution.
    pub fn start() -> Self {
        Self {
            id: ID_START,
            next_id: ID_EMPTY,
            action_type: ActionType::Empty,
            option: Map::new(),
        }
    }

    /// Whether this is the start marker.
    pub fn is_start(&self) -> bool {
        self.id == ID_START
    }
}

/// An action as authored, before compilation.
///
/// The type is kept as a raw string so an unknown tag surfaces as a
/// validation error from the compiler rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthoredAction {
    /// Optional preset identity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Type tag.
    #[serde(rename = "type")]
    pub action_type: String,
    /// Parameter bag; must be a JSON object or absent.
    #[serde(default)]
    pub option: Value,
}

impl AuthoredAction {
    /// Build an authored action with no option.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            id: None,
            action_type: action_type.into(),
            option: Value::Null,
        }
    }

    /// Attach a preset identity.
    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Attach an option bag.
    pub fn with_option(mut self, option: Value) -> Self {
        self.option = option;
        self
    }
}

impl From<&Action> for AuthoredAction {
    fn from(action: &Action) -> Self {
        Self {
            id: Some(action.id),
            action_type: action.action_type.as_str().to_string(),
            option: Value::Object(action.option.clone()),
        }
    }
}

/// Option of the `goto` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionGoto {
    /// Action to jump to, searched from the current frame outwards.
    pub target_id: Uuid,
    /// Remaining jumps. At zero the action falls through to its successor.
    #[serde(default)]
    pub loop_count: u32,
}

impl OptionGoto {
    /// Parse a goto option bag.
    pub fn parse(option: &ActionOption) -> Result<Self, serde_json::Error> {
        serde_json::from_value(Value::Object(option.clone()))
    }

    /// Serialize back into an option bag.
    pub fn to_option(&self) -> ActionOption {
        let mut map = Map::new();
        map.insert("target_id".to_string(), Value::String(self.target_id.to_string()));
        map.insert("loop_count".to_string(), Value::from(self.loop_count));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_type_round_trips_every_name() {
        for t in ActionType::ALL {
            assert_eq!(t.as_str().parse::<ActionType>(), Ok(*t));
            let encoded = serde_json::to_value(t).unwrap();
            assert_eq!(encoded, json!(t.as_str()));
        }
    }

    #[test]
    fn test_unknown_action_type() {
        let err = "dance".parse::<ActionType>().unwrap_err();
        assert_eq!(err, UnknownActionType("dance".to_string()));
    }

    #[test]
    fn test_internal_types() {
        assert!(ActionType::Goto.is_internal());
        assert!(ActionType::Empty.is_internal());
        assert!(ActionType::Stop.is_internal());
        assert!(!ActionType::Answer.is_internal());
        assert!(ActionType::Block.is_internal());
    }

    #[test]
    fn test_start_marker() {
        let start = Action::start();
        assert!(start.is_start());
        assert_eq!(start.id.to_string(), "00000000-0000-0000-0000-000000000001");
        assert_eq!(start.next_id, ID_EMPTY);
    }

    #[test]
    fn test_action_json_shape() {
        let action = Action {
            id: Uuid::from_u128(10),
            next_id: ID_EMPTY,
            action_type: ActionType::Talk,
            option: json!({"text": "hello"}).as_object().unwrap().clone(),
        };

        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "talk");
        assert_eq!(value["option"]["text"], "hello");
        assert_eq!(value["next_id"], "00000000-0000-0000-0000-000000000000");

        let no_option = Action {
            option: Map::new(),
            ..action
        };
        let value = serde_json::to_value(&no_option).unwrap();
        assert!(value.get("option").is_none());
    }

    #[test]
    fn test_authored_action_decode() {
        let authored: AuthoredAction =
            serde_json::from_str(r#"{"type":"answer"}"#).unwrap();
        assert_eq!(authored.action_type, "answer");
        assert!(authored.id.is_none());
        assert!(authored.option.is_null());
    }

    #[test]
    fn test_goto_option() {
        let target = Uuid::new_v4();
        let opt = OptionGoto {
            target_id: target,
            loop_count: 3,
        };
        let parsed = OptionGoto::parse(&opt.to_option()).unwrap();
        assert_eq!(parsed, opt);

        let bad = json!({"loop_count": 2}).as_object().unwrap().clone();
        assert!(OptionGoto::parse(&bad).is_err());
    }
}
