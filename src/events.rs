//! Session event types and the guards used to pull usage out of raw records.
//!
//! Only the fields needed to attribute token usage are interpreted; every other
//! event type is carried as [`EventKind::Other`] and ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::util::{estimate_input_tokens, estimate_output_tokens};

pub const SESSION_START: &str = "session.start";
pub const SESSION_MODEL_CHANGE: &str = "session.model_change";
pub const USER_MESSAGE: &str = "user.message";
pub const TURN_START: &str = "assistant.turn_start";
pub const TURN_END: &str = "assistant.turn_end";
pub const ASSISTANT_MESSAGE: &str = "assistant.message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    SessionStart,
    ModelChange,
    UserMessage,
    TurnStart,
    TurnEnd,
    AssistantMessage,
    Other(String),
}

impl EventKind {
    pub fn from_type(raw: &str) -> Self {
        match raw {
            SESSION_START => Self::SessionStart,
            SESSION_MODEL_CHANGE => Self::ModelChange,
            USER_MESSAGE => Self::UserMessage,
            TURN_START => Self::TurnStart,
            TURN_END => Self::TurnEnd,
            ASSISTANT_MESSAGE => Self::AssistantMessage,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStart {
    pub session_id: String,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelChange {
    pub new_model: String,
    pub previous_model: Option<String>,
    pub timestamp: Option<String>,
}

/// Vendor usage block; every count is optional and taken as reported.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VendorUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cached_tokens: Option<u64>,
    pub total_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub message_id: String,
    pub content: String,
    pub usage: Option<VendorUsage>,
    pub model: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tokens {
    pub input: u64,
    pub output: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_write: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenFigures {
    pub tokens: Tokens,
    pub is_estimated: bool,
}

impl AssistantMessage {
    /// Vendor counts win when `prompt_tokens` is positive; otherwise both sides
    /// are estimated from the content length.
    pub fn token_figures(&self) -> TokenFigures {
        let usage = self.usage.clone().unwrap_or_default();
        let cache_read = usage
            .cache_read_input_tokens
            .or(usage.cached_tokens)
            .filter(|count| *count > 0);
        let cache_write = usage.cache_creation_input_tokens.filter(|count| *count > 0);

        if let Some(prompt) = usage.prompt_tokens.filter(|count| *count > 0) {
            return TokenFigures {
                tokens: Tokens {
                    input: prompt,
                    output: usage.completion_tokens.unwrap_or(0),
                    cache_read,
                    cache_write,
                },
                is_estimated: false,
            };
        }

        let output = estimate_output_tokens(&self.content);
        TokenFigures {
            tokens: Tokens {
                input: estimate_input_tokens(output),
                output,
                cache_read,
                cache_write,
            },
            is_estimated: true,
        }
    }
}

/// A log record narrowed by the type guards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedEvent {
    SessionStart(SessionStart),
    ModelChange(ModelChange),
    AssistantMessage(AssistantMessage),
    Other(EventKind),
}

pub fn classify(value: &Value) -> TypedEvent {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(EventKind::from_type)
        .unwrap_or_else(|| EventKind::Other(String::new()));
    let typed = match kind {
        EventKind::SessionStart => as_session_start(value).map(TypedEvent::SessionStart),
        EventKind::ModelChange => as_model_change(value).map(TypedEvent::ModelChange),
        EventKind::AssistantMessage => {
            as_assistant_message(value).map(TypedEvent::AssistantMessage)
        }
        _ => None,
    };
    typed.unwrap_or(TypedEvent::Other(kind))
}

/// Accepts `assistant.message` records whose `data.messageId` is a non-empty
/// string and whose `data.content` is a string, possibly empty.
pub fn as_assistant_message(value: &Value) -> Option<AssistantMessage> {
    let data = typed_data(value, ASSISTANT_MESSAGE)?;
    let message_id = data
        .get("messageId")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())?;
    let content = data.get("content").and_then(Value::as_str)?;

    Some(AssistantMessage {
        message_id: message_id.to_string(),
        content: content.to_string(),
        usage: data.get("usage").filter(|usage| usage.is_object()).map(parse_usage),
        model: data
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|model| !model.is_empty())
            .map(ToString::to_string),
        timestamp: str_at(value, &["timestamp"]),
    })
}

pub fn as_session_start(value: &Value) -> Option<SessionStart> {
    let data = typed_data(value, SESSION_START)?;
    let session_id = data.get("sessionId").and_then(Value::as_str)?;
    Some(SessionStart {
        session_id: session_id.to_string(),
        timestamp: str_at(value, &["timestamp"]),
    })
}

pub fn as_model_change(value: &Value) -> Option<ModelChange> {
    let data = typed_data(value, SESSION_MODEL_CHANGE)?;
    let new_model = data
        .get("newModel")
        .and_then(Value::as_str)
        .filter(|model| !model.is_empty())?;
    Some(ModelChange {
        new_model: new_model.to_string(),
        previous_model: str_at(data, &["previousModel"]),
        timestamp: str_at(value, &["timestamp"]),
    })
}

fn typed_data<'a>(value: &'a Value, expected_type: &str) -> Option<&'a Value> {
    if value.get("type").and_then(Value::as_str) != Some(expected_type) {
        return None;
    }
    value.get("data").filter(|data| data.is_object())
}

fn parse_usage(usage: &Value) -> VendorUsage {
    VendorUsage {
        prompt_tokens: count_at(usage, "prompt_tokens"),
        completion_tokens: count_at(usage, "completion_tokens"),
        cache_creation_input_tokens: count_at(usage, "cache_creation_input_tokens"),
        cache_read_input_tokens: count_at(usage, "cache_read_input_tokens"),
        cached_tokens: count_at(usage, "cached_tokens"),
        total_tokens: count_at(usage, "total_tokens"),
    }
}

fn str_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(*key)?;
    }
    cursor.as_str().map(|s| s.to_string())
}

fn count_at(value: &Value, key: &str) -> Option<u64> {
    let cursor = value.get(key)?;
    cursor.as_u64().or_else(|| {
        cursor
            .as_f64()
            .filter(|n| n.is_finite() && *n >= 0.0)
            .map(|n| n.round() as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assistant(data: Value) -> Value {
        json!({"type": "assistant.message", "timestamp": "2026-02-09T16:33:13Z", "data": data})
    }

    #[test]
    fn assistant_guard_requires_id_and_string_content() {
        let accepted = assistant(json!({"messageId": "m1", "content": ""}));
        assert!(as_assistant_message(&accepted).is_some());

        for data in [
            json!({"messageId": "", "content": "x"}),
            json!({"content": "x"}),
            json!({"messageId": "m1", "content": 4}),
            json!("not an object"),
        ] {
            assert!(as_assistant_message(&assistant(data)).is_none());
        }

        let wrong_type = json!({
            "type": "user.message",
            "data": {"messageId": "m1", "content": "x"}
        });
        assert!(as_assistant_message(&wrong_type).is_none());
        assert!(as_assistant_message(&Value::Null).is_none());
    }

    #[test]
    fn model_change_guard_requires_new_model() {
        let ok = json!({
            "type": "session.model_change",
            "timestamp": "t",
            "data": {"newModel": "gpt-5", "previousModel": "claude"}
        });
        let change = as_model_change(&ok).expect("model change");
        assert_eq!(change.new_model, "gpt-5");
        assert_eq!(change.previous_model.as_deref(), Some("claude"));

        let blank = json!({"type": "session.model_change", "data": {"newModel": ""}});
        assert!(as_model_change(&blank).is_none());
        let missing = json!({"type": "session.model_change", "data": {}});
        assert!(as_model_change(&missing).is_none());
    }

    #[test]
    fn session_start_guard_requires_string_id() {
        let ok = json!({"type": "session.start", "data": {"sessionId": "abc"}});
        assert!(as_session_start(&ok).is_some());
        let numeric = json!({"type": "session.start", "data": {"sessionId": 12}});
        assert!(as_session_start(&numeric).is_none());
    }

    #[test]
    fn classify_keeps_unknown_types() {
        let typed = classify(&json!({"type": "tool.execution_start", "data": {}}));
        assert_eq!(
            typed,
            TypedEvent::Other(EventKind::Other("tool.execution_start".to_string()))
        );
        let malformed = classify(&json!({"type": "assistant.message", "data": {"content": "x"}}));
        assert_eq!(malformed, TypedEvent::Other(EventKind::AssistantMessage));
    }

    #[test]
    fn vendor_usage_takes_precedence() {
        let message = as_assistant_message(&assistant(json!({
            "messageId": "m1",
            "content": "x".repeat(400),
            "usage": {
                "prompt_tokens": 120,
                "completion_tokens": 30,
                "cache_read_input_tokens": 0,
                "cache_creation_input_tokens": 8
            }
        })))
        .expect("assistant");
        let figures = message.token_figures();
        assert!(!figures.is_estimated);
        assert_eq!(figures.tokens.input, 120);
        assert_eq!(figures.tokens.output, 30);
        assert_eq!(figures.tokens.cache_read, None);
        assert_eq!(figures.tokens.cache_write, Some(8));
    }

    #[test]
    fn zero_prompt_tokens_falls_back_to_estimate() {
        let message = as_assistant_message(&assistant(json!({
            "messageId": "m1",
            "content": "abcde",
            "usage": {"prompt_tokens": 0, "completion_tokens": 99, "cached_tokens": 4}
        })))
        .expect("assistant");
        let figures = message.token_figures();
        assert!(figures.is_estimated);
        assert_eq!(figures.tokens.output, 2);
        assert_eq!(figures.tokens.input, 1);
        assert_eq!(figures.tokens.cache_read, Some(4));
    }
}
