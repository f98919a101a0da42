// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provider-neutral conversation model.
//!
//! The runner and transcript speak this shape; the provider adapter lowers
//! it to each wire format and raises responses back into it.

use serde::{Deserialize, Serialize};

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// End-user / directive input.
    User,
    /// Model output.
    Assistant,
    /// Tool result rejoining the conversation.
    Tool,
    /// System prompt carried as a message (provider-dependent).
    System,
}

impl Role {
    /// Stable snake_case name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned (or synthesised) call id.
    pub id: String,
    /// API-safe tool name as the model saw it.
    pub name: String,
    /// Parsed input object.
    pub input: serde_json::Value,
    /// Raw wire block, preserved when the provider needs it replayed
    /// verbatim on the next request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_block: Option<serde_json::Value>,
}

impl ToolCall {
    /// Construct a call with no preserved raw block.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
            raw_block: None,
        }
    }
}

/// One message in the provider-neutral conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Who produced the message.
    pub role: Role,
    /// Text content. Tool messages carry the stringified tool output here.
    pub content: String,
    /// For tool messages: the id of the call this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool messages: the tool name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// For assistant messages: the tool calls issued this turn.
    ///
    /// Required for faithful wire reconstruction — a tool result without a
    /// preceding call is rejected by providers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Assistant reasoning text, when the provider surfaced it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Marks a tool message as an error result.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_error: bool,
}

impl Message {
    /// A plain user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(Role::User, content)
    }

    /// A plain assistant message.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(Role::Assistant, content)
    }

    /// A tool result answering `tool_call_id`.
    #[must_use]
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: None,
            tool_calls: Vec::new(),
            thinking: None,
            is_error: false,
        }
    }

    fn plain(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
            tool_name: None,
            tool_calls: Vec::new(),
            thinking: None,
            is_error: false,
        }
    }
}

/// Check conversation shape: every tool message must answer a tool call
/// issued by the nearest preceding assistant message, and every assistant
/// tool call must be answered before the next user/assistant message.
///
/// Providers reject conversations with orphaned tool results; validating
/// here turns that into a detectable shape error before the wire.
///
/// # Errors
///
/// A description of the first orphaned call or result.
pub fn validate_conversation_shape(messages: &[Message]) -> Result<(), String> {
    let mut open_calls: Vec<String> = Vec::new();

    for (i, msg) in messages.iter().enumerate() {
        match msg.role {
            Role::Assistant => {
                if let Some(unanswered) = open_calls.first() {
                    return Err(format!(
                        "tool call '{unanswered}' is unanswered before message {i}"
                    ));
                }
                open_calls = msg.tool_calls.iter().map(|tc| tc.id.clone()).collect();
            }
            Role::Tool => {
                let id = msg.tool_call_id.clone().unwrap_or_default();
                match open_calls.iter().position(|open| *open == id) {
                    Some(pos) => {
                        open_calls.remove(pos);
                    }
                    None => {
                        return Err(format!(
                            "orphan tool result '{id}' at message {i} has no matching tool call"
                        ));
                    }
                }
            }
            Role::User | Role::System => {
                if let Some(unanswered) = open_calls.first() {
                    return Err(format!(
                        "tool call '{unanswered}' is unanswered before message {i}"
                    ));
                }
            }
        }
    }

    match open_calls.first() {
        Some(unanswered) => Err(format!(
            "tool call '{unanswered}' is unanswered at end of conversation"
        )),
        None => Ok(()),
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Natural end of turn.
    EndTurn,
    /// The model requested tool use.
    ToolUse,
    /// Output token ceiling reached.
    MaxTokens,
    /// Any other provider-specific reason, preserved verbatim.
    #[serde(untagged)]
    Other(String),
}

impl FinishReason {
    /// Parse a provider finish-reason string, folding the common spellings.
    #[must_use]
    pub fn from_wire(s: &str) -> Self {
        match s {
            "end_turn" | "stop" => Self::EndTurn,
            "tool_use" | "tool_calls" => Self::ToolUse,
            "max_tokens" | "length" => Self::MaxTokens,
            other => Self::Other(other.to_string()),
        }
    }
}

/// A parsed provider completion, sync or stream-assembled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Concatenated text content.
    pub text: String,
    /// Reasoning content, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Tool calls requested by the model, in wire order.
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    /// Prompt tokens billed.
    pub input_tokens: u64,
    /// Completion tokens billed.
    pub output_tokens: u64,
    /// USD spend for this call, from the provider pricing table.
    pub spend: f64,
    /// Stop reason.
    pub finish_reason: FinishReason,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_message_roundtrip() {
        let msg = Message::tool_result("call_1", "ok");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "tool");
        assert_eq!(json["tool_call_id"], "call_1");
        // Empty tool_calls and false is_error are omitted from the wire form.
        assert!(json.get("tool_calls").is_none());
        assert!(json.get("is_error").is_none());
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn assistant_with_tool_calls_roundtrip() {
        let mut msg = Message::assistant("working on it");
        msg.tool_calls
            .push(ToolCall::new("a", "spindle_execute", json!({"x": 1})));
        let text = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&text).unwrap();
        assert_eq!(back.tool_calls.len(), 1);
        assert_eq!(back.tool_calls[0].input, json!({"x": 1}));
    }

    #[test]
    fn finish_reason_folds_spellings() {
        assert_eq!(FinishReason::from_wire("stop"), FinishReason::EndTurn);
        assert_eq!(FinishReason::from_wire("end_turn"), FinishReason::EndTurn);
        assert_eq!(FinishReason::from_wire("tool_calls"), FinishReason::ToolUse);
        assert_eq!(FinishReason::from_wire("length"), FinishReason::MaxTokens);
        assert_eq!(
            FinishReason::from_wire("SAFETY"),
            FinishReason::Other("SAFETY".into())
        );
    }

    #[test]
    fn shape_validation_accepts_complete_conversations() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(ToolCall::new("a", "t", json!({})));
        assistant.tool_calls.push(ToolCall::new("b", "t", json!({})));
        let messages = vec![
            Message::user("go"),
            assistant,
            Message::tool_result("a", "ok"),
            Message::tool_result("b", "ok"),
            Message::assistant("done"),
        ];
        validate_conversation_shape(&messages).unwrap();
    }

    #[test]
    fn shape_validation_detects_orphan_tool_results() {
        let messages = vec![
            Message::user("go"),
            Message::assistant("no calls here"),
            Message::tool_result("ghost", "orphaned"),
        ];
        let err = validate_conversation_shape(&messages).unwrap_err();
        assert!(err.contains("orphan tool result 'ghost'"));
    }

    #[test]
    fn shape_validation_detects_unanswered_calls() {
        let mut assistant = Message::assistant("");
        assistant.tool_calls.push(ToolCall::new("a", "t", json!({})));
        let messages = vec![Message::user("go"), assistant, Message::user("next")];
        let err = validate_conversation_shape(&messages).unwrap_err();
        assert!(err.contains("unanswered"));
    }

    #[test]
    fn role_names_are_stable() {
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
        assert_eq!(Role::Tool.as_str(), "tool");
        assert_eq!(Role::System.as_str(), "system");
    }
}
