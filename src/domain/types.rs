use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One conversation message as the bridge and model layer see it. Tool
/// plumbing fields stay `None` for plain user/assistant text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn assistant_with_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_call_id: None,
            tool_calls: Some(calls),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: content.into(),
            tool_call_id: Some(call_id.into()),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON argument text exactly as the model produced it.
    pub arguments: String,
}

/// Outcome of one remote tool invocation. `Structured` carries content the
/// endpoint returned in the expected result shape; anything else is kept
/// verbatim as `Opaque` so downstream renderers can pattern-match on the tag
/// instead of sniffing arbitrary JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ToolResult {
    #[serde(rename_all = "camelCase")]
    Structured {
        #[schema(value_type = Object)]
        content: Value,
        is_error: bool,
    },
    Opaque {
        #[schema(value_type = Object)]
        raw: Value,
    },
}

impl ToolResult {
    /// MCP `tools/call` results carry a `content` array and an optional
    /// `isError` flag; everything else is treated as opaque.
    pub fn from_value(value: Value) -> Self {
        match value.get("content") {
            Some(content @ Value::Array(_)) => ToolResult::Structured {
                content: content.clone(),
                is_error: value
                    .get("isError")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            },
            _ => ToolResult::Opaque { raw: value },
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            ToolResult::Structured { is_error, .. } => *is_error,
            ToolResult::Opaque { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ToolInvocation {
    pub tool_name: String,
    #[schema(value_type = Object)]
    pub args: Value,
    pub result: ToolResult,
}

/// One completed user/assistant exchange, handed to the persistence adapter
/// after the stream finishes. Built once, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ConversationTurn {
    pub chat_id: String,
    pub title: Option<String>,
    pub user_message: ChatMessage,
    pub assistant_message_id: String,
    pub assistant_message: ChatMessage,
    pub tool_invocations: Vec<ToolInvocation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SideChannelKind {
    AuthRequired,
    ApiKeyAccepted,
    Status,
    Diagnostic,
}

/// Wire contract consumed by the UI layer. Emission order is the contract:
/// a `ToolCallResult` never precedes its `ToolCallStarted`, and `Error` or
/// end-of-stream terminates the sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StreamEvent {
    TextDelta {
        delta: String,
    },
    ReasoningDelta {
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallStarted {
        call_id: String,
        tool: String,
        #[schema(value_type = Object)]
        args: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallResult {
        call_id: String,
        tool: String,
        result: ToolResult,
    },
    SideChannel {
        kind: SideChannelKind,
        #[schema(value_type = Object)]
        payload: Value,
    },
    Error {
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_result_tags_mcp_shape_as_structured() {
        let value = json!({
            "content": [{"type": "text", "text": "ok"}],
            "isError": false
        });
        match ToolResult::from_value(value) {
            ToolResult::Structured { content, is_error } => {
                assert!(!is_error);
                assert_eq!(content[0]["text"], "ok");
            }
            other => panic!("expected structured result, got {other:?}"),
        }
    }

    #[test]
    fn tool_result_keeps_unknown_shapes_opaque() {
        let value = json!({"rows": [1, 2, 3]});
        match ToolResult::from_value(value.clone()) {
            ToolResult::Opaque { raw } => assert_eq!(raw, value),
            other => panic!("expected opaque result, got {other:?}"),
        }
    }

    #[test]
    fn conversation_turn_exposes_an_api_schema() {
        use utoipa::PartialSchema;
        // Covers the timestamp field; schema generation fails to compile
        // without chrono support in the schema derive.
        let _ = ConversationTurn::schema();
    }

    #[test]
    fn stream_events_serialize_with_type_tag() {
        let event = StreamEvent::TextDelta {
            delta: "hi".into(),
        };
        let wire = serde_json::to_value(&event).expect("serialize");
        assert_eq!(wire["type"], "textDelta");
        assert_eq!(wire["delta"], "hi");

        let event = StreamEvent::SideChannel {
            kind: SideChannelKind::AuthRequired,
            payload: json!({"message": "key please"}),
        };
        let wire = serde_json::to_value(&event).expect("serialize");
        assert_eq!(wire["type"], "sideChannel");
        assert_eq!(wire["kind"], "authRequired");
    }
}
