// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provider configuration schemas and the interpreter primitives.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Per-model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    /// Input (prompt) price per million tokens.
    #[serde(default)]
    pub input: f64,
    /// Output (completion) price per million tokens.
    #[serde(default)]
    pub output: f64,
}

/// HTTP transport section of a provider config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Endpoint URL; `{model}` placeholders are substituted.
    #[serde(default)]
    pub url: String,
    /// Streaming endpoint, when it differs from `url`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
    /// Request headers; values may carry `{env:VAR}` placeholders.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Body template; `{model}`, `{messages}`, `{tools}`, `{max_tokens}`,
    /// `{stream}` placeholders are substituted.
    #[serde(default)]
    pub body: Value,
}

/// How tool-result messages lower to the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResultSchema {
    /// Wire role carrying tool results.
    #[serde(default = "default_user_role")]
    pub role: String,
    /// `content_blocks` (grouped into one message), `direct` (fields on the
    /// message), or `parts` (one block list per message).
    #[serde(default = "default_tr_wrap")]
    pub wrap_mode: String,
    /// Template producing one wire block from
    /// `{tool_call_id, tool_name, content}`.
    #[serde(default)]
    pub block_template: Value,
    /// Field set to `true` on error results, when the wire supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_field: Option<String>,
}

fn default_user_role() -> String {
    "user".to_string()
}
fn default_tr_wrap() -> String {
    "content_blocks".to_string()
}

impl Default for ToolResultSchema {
    fn default() -> Self {
        Self {
            role: default_user_role(),
            wrap_mode: default_tr_wrap(),
            block_template: Value::Null,
            error_field: None,
        }
    }
}

/// How the canonical message list lowers to the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSchema {
    /// Canonical role → wire role.
    #[serde(default = "default_role_map")]
    pub role_map: BTreeMap<String, String>,
    /// Key carrying message content (`content`, `parts`, …).
    #[serde(default = "default_content_key")]
    pub content_key: String,
    /// `string`, `blocks_array`, or `parts_array`.
    #[serde(default = "default_content_wrap")]
    pub content_wrap: String,
    /// Tool-result lowering.
    #[serde(default)]
    pub tool_result: ToolResultSchema,
    /// Template reconstructing an assistant tool call on the wire from
    /// `{id, name, input, input_json}`.
    #[serde(default)]
    pub tool_call_block_template: Value,
}

fn default_role_map() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("user".to_string(), "user".to_string()),
        ("assistant".to_string(), "assistant".to_string()),
    ])
}
fn default_content_key() -> String {
    "content".to_string()
}
fn default_content_wrap() -> String {
    "string".to_string()
}

impl Default for MessageSchema {
    fn default() -> Self {
        Self {
            role_map: default_role_map(),
            content_key: default_content_key(),
            content_wrap: default_content_wrap(),
            tool_result: ToolResultSchema::default(),
            tool_call_block_template: Value::Null,
        }
    }
}

/// System prompt placement strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMessageConfig {
    /// `body_field`, `body_inject`, or `message_role`.
    #[serde(default = "default_system_mode")]
    pub mode: String,
    /// Body field name for `body_field`.
    #[serde(default = "default_system_field")]
    pub field: String,
    /// Deep-merged template for `body_inject`; `{system}` is substituted.
    #[serde(default)]
    pub template: Value,
}

fn default_system_mode() -> String {
    "body_field".to_string()
}
fn default_system_field() -> String {
    "system".to_string()
}

impl Default for SystemMessageConfig {
    fn default() -> Self {
        Self {
            mode: default_system_mode(),
            field: default_system_field(),
            template: Value::Null,
        }
    }
}

/// A block-detection rule: match by `field == value` or key presence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DetectRule {
    /// Field whose value identifies the block type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Expected value of `field`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    /// Alternatively: the block matches when this key is present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Block-detection rules per block kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockDetect {
    /// Reasoning blocks.
    #[serde(default)]
    pub thinking: DetectRule,
    /// Text blocks.
    #[serde(default)]
    pub text: DetectRule,
    /// Tool-call blocks.
    #[serde(default)]
    pub tool_call: DetectRule,
}

/// Sync response parsing schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    /// `blocks` (typed content blocks) or `separate` (text and tool calls
    /// in distinct fields).
    #[serde(default = "default_content_mode")]
    pub content_mode: String,
    /// Dotted path to the content blocks / message object.
    #[serde(default = "default_content_path")]
    pub content_path: String,
    /// Block detection rules (blocks mode).
    #[serde(default)]
    pub block_detect: BlockDetect,
    /// Path to a block's text payload.
    #[serde(default = "default_text_value")]
    pub text_value: String,
    /// Field carrying text in separate mode.
    #[serde(default = "default_text_field")]
    pub text_field: String,
    /// Field carrying tool calls in separate mode.
    #[serde(default = "default_tool_calls_field")]
    pub tool_calls_field: String,
    /// Path to a tool call's name.
    #[serde(default = "default_tc_name")]
    pub tool_call_name: String,
    /// Path to a tool call's input.
    #[serde(default = "default_tc_input")]
    pub tool_call_input: String,
    /// Path to a tool call's id; absent ids are synthesised.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// `json_string` when tool inputs arrive as encoded JSON text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_input_format: Option<String>,
    /// Dotted path to the usage object.
    #[serde(default = "default_usage_path")]
    pub usage_path: String,
    /// Usage field carrying input tokens.
    #[serde(default = "default_input_tokens")]
    pub input_tokens: String,
    /// Usage field carrying output tokens.
    #[serde(default = "default_output_tokens")]
    pub output_tokens: String,
    /// Dotted path to the finish reason.
    #[serde(default = "default_finish_reason_path")]
    pub finish_reason_path: String,
}

fn default_content_mode() -> String {
    "blocks".to_string()
}
fn default_content_path() -> String {
    "content".to_string()
}
fn default_text_value() -> String {
    "text".to_string()
}
fn default_text_field() -> String {
    "content".to_string()
}
fn default_tool_calls_field() -> String {
    "tool_calls".to_string()
}
fn default_tc_name() -> String {
    "name".to_string()
}
fn default_tc_input() -> String {
    "input".to_string()
}
fn default_usage_path() -> String {
    "usage".to_string()
}
fn default_input_tokens() -> String {
    "input_tokens".to_string()
}
fn default_output_tokens() -> String {
    "output_tokens".to_string()
}
fn default_finish_reason_path() -> String {
    "stop_reason".to_string()
}

impl Default for ResponseSchema {
    fn default() -> Self {
        Self {
            content_mode: default_content_mode(),
            content_path: default_content_path(),
            block_detect: BlockDetect::default(),
            text_value: default_text_value(),
            text_field: default_text_field(),
            tool_calls_field: default_tool_calls_field(),
            tool_call_name: default_tc_name(),
            tool_call_input: default_tc_input(),
            tool_call_id: None,
            tool_call_input_format: None,
            usage_path: default_usage_path(),
            input_tokens: default_input_tokens(),
            output_tokens: default_output_tokens(),
            finish_reason_path: default_finish_reason_path(),
        }
    }
}

/// Streaming assembly schema. Field meanings depend on `stream_mode`:
/// `event_typed` (named SSE events), `delta_merge` (progressive
/// `choices[].delta` fragments), or `complete_chunks` (each event is a
/// complete response-shaped object, usage taken as the max across chunks).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSchema {
    /// One of `event_typed`, `delta_merge`, `complete_chunks`.
    #[serde(default = "default_stream_mode")]
    pub stream_mode: String,

    // -- event_typed ----------------------------------------------------
    /// Field naming the event type.
    #[serde(default = "default_event_type_field")]
    pub event_type_field: String,
    /// Event type opening a message.
    #[serde(default = "default_message_start_type")]
    pub message_start_type: String,
    /// Path to usage inside the message-start event.
    #[serde(default = "default_message_start_usage")]
    pub message_start_usage: String,
    /// Event type opening a content block.
    #[serde(default = "default_block_start_type")]
    pub block_start_type: String,
    /// Path to the opened block.
    #[serde(default = "default_block_start_path")]
    pub block_start_path: String,
    /// Event type carrying a block delta.
    #[serde(default = "default_block_delta_type")]
    pub block_delta_type: String,
    /// Path to the delta object.
    #[serde(default = "default_delta_path")]
    pub delta_path: String,
    /// Field naming the delta type.
    #[serde(default = "default_delta_type_field")]
    pub delta_type_field: String,
    /// Delta type carrying text.
    #[serde(default = "default_text_delta_type")]
    pub text_delta_type: String,
    /// Delta field carrying the text fragment.
    #[serde(default = "default_text_delta_field_et")]
    pub text_delta_field: String,
    /// Delta type carrying tool-input JSON fragments.
    #[serde(default = "default_tool_input_delta_type")]
    pub tool_input_delta_type: String,
    /// Delta field carrying the JSON fragment.
    #[serde(default = "default_tool_input_delta_field")]
    pub tool_input_delta_field: String,
    /// Event type closing a message.
    #[serde(default = "default_message_delta_type")]
    pub message_delta_type: String,
    /// Path to the finish reason inside the closing event.
    #[serde(default = "default_stream_finish_path")]
    pub finish_reason_path: String,
    /// Path to usage inside the closing event.
    #[serde(default = "default_delta_usage_path")]
    pub delta_usage_path: String,

    // -- delta_merge ----------------------------------------------------
    /// Terminator payload (e.g. `[DONE]`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_signal: Option<String>,
    /// Field carrying the choices array.
    #[serde(default = "default_choices_field")]
    pub choices_field: String,
    /// Field carrying the delta inside a choice.
    #[serde(default = "default_delta_field")]
    pub delta_field: String,
    /// Field carrying tool-call fragments inside a delta.
    #[serde(default = "default_tool_calls_field_dm")]
    pub tool_calls_field: String,
    /// Field carrying a fragment's tool-call index.
    #[serde(default = "default_tool_call_index_field")]
    pub tool_call_index_field: String,
    /// Field carrying a fragment's tool-call id.
    #[serde(default = "default_tool_call_id_field")]
    pub tool_call_id_field: String,
    /// Path to the function object inside a fragment.
    #[serde(default = "default_tool_call_func_path")]
    pub tool_call_func_path: String,
    /// Function field carrying the name.
    #[serde(default = "default_tool_call_name_field")]
    pub tool_call_name_field: String,
    /// Function field carrying argument fragments.
    #[serde(default = "default_tool_call_args_field")]
    pub tool_call_args_field: String,
    /// Choice field carrying the finish reason.
    #[serde(default = "default_finish_reason_field")]
    pub finish_reason_field: String,
    /// Path to usage on a chunk.
    #[serde(default = "default_usage_path_dm")]
    pub usage_path: String,
    /// Usage field for input tokens, overriding the response schema's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens_field: Option<String>,
    /// Usage field for output tokens, overriding the response schema's.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens_field: Option<String>,
}

fn default_stream_mode() -> String {
    "event_typed".to_string()
}
fn default_event_type_field() -> String {
    "type".to_string()
}
fn default_message_start_type() -> String {
    "message_start".to_string()
}
fn default_message_start_usage() -> String {
    "message.usage".to_string()
}
fn default_block_start_type() -> String {
    "content_block_start".to_string()
}
fn default_block_start_path() -> String {
    "content_block".to_string()
}
fn default_block_delta_type() -> String {
    "content_block_delta".to_string()
}
fn default_delta_path() -> String {
    "delta".to_string()
}
fn default_delta_type_field() -> String {
    "type".to_string()
}
fn default_text_delta_type() -> String {
    "text_delta".to_string()
}
fn default_text_delta_field_et() -> String {
    "text".to_string()
}
fn default_tool_input_delta_type() -> String {
    "input_json_delta".to_string()
}
fn default_tool_input_delta_field() -> String {
    "partial_json".to_string()
}
fn default_message_delta_type() -> String {
    "message_delta".to_string()
}
fn default_stream_finish_path() -> String {
    "delta.stop_reason".to_string()
}
fn default_delta_usage_path() -> String {
    "usage".to_string()
}
fn default_choices_field() -> String {
    "choices".to_string()
}
fn default_delta_field() -> String {
    "delta".to_string()
}
fn default_tool_calls_field_dm() -> String {
    "tool_calls".to_string()
}
fn default_tool_call_index_field() -> String {
    "index".to_string()
}
fn default_tool_call_id_field() -> String {
    "id".to_string()
}
fn default_tool_call_func_path() -> String {
    "function".to_string()
}
fn default_tool_call_name_field() -> String {
    "name".to_string()
}
fn default_tool_call_args_field() -> String {
    "arguments".to_string()
}
fn default_finish_reason_field() -> String {
    "finish_reason".to_string()
}
fn default_usage_path_dm() -> String {
    "usage".to_string()
}

impl Default for StreamSchema {
    fn default() -> Self {
        serde_json::from_value(Value::Object(Default::default()))
            .expect("all stream schema fields have defaults")
    }
}

/// Tool-use section of a provider config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseConfig {
    /// `native` (API tool use) or `text_parsed` (calls parsed from text).
    #[serde(default = "default_tool_mode")]
    pub mode: String,
    /// Message lowering schema.
    #[serde(default)]
    pub message_schema: MessageSchema,
    /// System prompt placement.
    #[serde(default)]
    pub system_message: SystemMessageConfig,
    /// Template for one tool definition from `{name, description, schema}`.
    #[serde(default)]
    pub tool_definition: Value,
    /// When set, all formatted tools group under a single object with this
    /// key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_list_wrap: Option<String>,
    /// Sync parsing schema.
    #[serde(default)]
    pub response_schema: ResponseSchema,
    /// Streaming assembly schema.
    #[serde(default)]
    pub stream_schema: StreamSchema,
}

fn default_tool_mode() -> String {
    "native".to_string()
}

impl Default for ToolUseConfig {
    fn default() -> Self {
        Self {
            mode: default_tool_mode(),
            message_schema: MessageSchema::default(),
            system_message: SystemMessageConfig::default(),
            tool_definition: Value::Null,
            tool_list_wrap: None,
            response_schema: ResponseSchema::default(),
            stream_schema: StreamSchema::default(),
        }
    }
}

/// A full provider configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider artifact id.
    #[serde(default)]
    pub id: String,
    /// Transport kind; only `http` is supported.
    #[serde(default = "default_tool_type")]
    pub tool_type: String,
    /// Declared context window in tokens.
    #[serde(default = "default_context_window")]
    pub context_window: u64,
    /// Model id → pricing.
    #[serde(default)]
    pub pricing: BTreeMap<String, Pricing>,
    /// HTTP transport section.
    #[serde(default)]
    pub config: HttpConfig,
    /// Tool-use / schema section.
    #[serde(default)]
    pub tool_use: ToolUseConfig,
}

fn default_tool_type() -> String {
    "http".to_string()
}
fn default_context_window() -> u64 {
    200_000
}

impl ProviderConfig {
    /// USD spend for a token count under this provider's pricing.
    #[must_use]
    pub fn spend(&self, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let pricing = self.pricing.get(model).copied().unwrap_or_default();
        (input_tokens as f64 * pricing.input + output_tokens as f64 * pricing.output) / 1_000_000.0
    }
}

// ---------------------------------------------------------------------------
// Interpreter primitives
// ---------------------------------------------------------------------------

/// Navigate nested objects/arrays via a dot-separated path. Numeric
/// segments index arrays (`choices.0.message`).
#[must_use]
pub fn resolve_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => current = map.get(segment)?,
            Value::Array(arr) => current = arr.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Check whether a content block matches a detection rule.
///
/// Two modes: `field`/`value` equality, or `key` presence.
#[must_use]
pub fn detect_block(block: &Value, rule: &DetectRule) -> bool {
    if let (Some(field), Some(expected)) = (&rule.field, &rule.value) {
        return block.get(field) == Some(expected);
    }
    if let Some(key) = &rule.key {
        return block.get(key).is_some();
    }
    false
}

/// Recursively apply `{placeholder}` substitution from a data map.
///
/// A string that is exactly `{key}` resolves to the data value itself
/// (preserving its type); other strings pass through literally.
#[must_use]
pub fn apply_template(template: &Value, data: &serde_json::Map<String, Value>) -> Value {
    match template {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.len() > 2
                && trimmed.starts_with('{')
                && trimmed.ends_with('}')
                && trimmed[1..trimmed.len() - 1]
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_')
            {
                let key = &trimmed[1..trimmed.len() - 1];
                return data.get(key).cloned().unwrap_or(Value::String(String::new()));
            }
            template.clone()
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), apply_template(v, data)))
                .collect(),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| apply_template(v, data)).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolve_path_walks_arrays_and_objects() {
        let v = json!({"choices": [{"message": {"content": "hi"}}]});
        assert_eq!(
            resolve_path(&v, "choices.0.message.content").unwrap(),
            "hi"
        );
        assert!(resolve_path(&v, "choices.1").is_none());
        assert_eq!(resolve_path(&v, "").unwrap(), &v);
    }

    #[test]
    fn detect_block_by_field_and_key() {
        let block = json!({"type": "tool_use", "id": "a"});
        assert!(detect_block(
            &block,
            &DetectRule {
                field: Some("type".into()),
                value: Some(json!("tool_use")),
                key: None,
            }
        ));
        assert!(detect_block(
            &block,
            &DetectRule {
                field: None,
                value: None,
                key: Some("id".into()),
            }
        ));
        assert!(!detect_block(&block, &DetectRule::default()));
    }

    #[test]
    fn apply_template_substitutes_whole_placeholders() {
        let template = json!({
            "name": "{name}",
            "input_schema": "{schema}",
            "static": "literal {not_a_placeholder because spaces}",
        });
        let mut data = serde_json::Map::new();
        data.insert("name".into(), json!("spindle_execute"));
        data.insert("schema".into(), json!({"type": "object"}));
        let out = apply_template(&template, &data);
        assert_eq!(out["name"], "spindle_execute");
        assert_eq!(out["input_schema"], json!({"type": "object"}));
        assert_eq!(out["static"], "literal {not_a_placeholder because spaces}");
    }

    #[test]
    fn provider_yaml_parses_with_defaults() {
        let yaml = r#"
id: spindle/agent/providers/anthropic
context_window: 200000
pricing:
  claude-sonnet: {input: 3.0, output: 15.0}
config:
  url: "https://api.anthropic.com/v1/messages"
  headers:
    x-api-key: "{env:ANTHROPIC_API_KEY}"
tool_use:
  message_schema:
    content_wrap: blocks_array
    tool_result:
      role: user
      wrap_mode: content_blocks
      block_template: {type: tool_result, tool_use_id: "{tool_call_id}", content: "{content}"}
      error_field: is_error
    tool_call_block_template: {type: tool_use, id: "{id}", name: "{name}", input: "{input}"}
  tool_definition: {name: "{name}", description: "{description}", input_schema: "{schema}"}
  response_schema:
    block_detect:
      text: {field: type, value: text}
      tool_call: {field: type, value: tool_use}
    tool_call_id: id
"#;
        let config: ProviderConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tool_type, "http");
        assert_eq!(config.tool_use.mode, "native");
        assert_eq!(config.tool_use.stream_schema.stream_mode, "event_typed");
        assert_eq!(config.tool_use.response_schema.content_mode, "blocks");
        assert!((config.spend("claude-sonnet", 1_000_000, 0) - 3.0).abs() < 1e-9);
        assert!((config.spend("unknown-model", 1_000_000, 1_000_000)).abs() < 1e-12);
    }
}
