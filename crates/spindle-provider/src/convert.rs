// SPDX-License-Identifier: MIT OR Apache-2.0
//! Lowering the canonical message list and tool schemas to wire format.

use crate::schema::{MessageSchema, SystemMessageConfig, ToolUseConfig, apply_template};
use serde_json::{Map, Value, json};
use spindle_core::{Message, Role, ToolSchema};
use std::collections::HashMap;

fn wrap_text_block(text: &str, mode: &str) -> Value {
    match mode {
        "blocks_array" => json!({"type": "text", "text": text}),
        "parts_array" => json!({"text": text}),
        _ => Value::String(text.to_string()),
    }
}

fn data_map(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), v.clone()))
        .collect()
}

/// Convert the canonical message list into wire messages per the provider's
/// message schema.
///
/// Handles, all driven by config:
/// 1. tool-result messages → provider format (grouped, direct, or parts);
/// 2. assistant messages with tool calls → reconstructed wire blocks (or a
///    top-level `tool_calls` array for string-content providers);
/// 3. regular messages → role-mapped and content-wrapped;
/// 4. the system prompt → prepended as a `system` role message when the
///    provider uses `message_role` placement.
#[must_use]
pub fn convert_messages(
    messages: &[Message],
    schema: &MessageSchema,
    system: &SystemMessageConfig,
    system_prompt: &str,
) -> Vec<Value> {
    let tr = &schema.tool_result;
    let mut converted: Vec<Value> = Vec::new();
    let mut pending_results: Vec<Value> = Vec::new();
    // Tool-call id → name, for providers whose tool results carry the name.
    let mut name_map: HashMap<String, String> = HashMap::new();

    let flush =
        |converted: &mut Vec<Value>, pending: &mut Vec<Value>| {
            if !pending.is_empty() {
                converted.push(json!({
                    "role": tr.role,
                    &schema.content_key: Value::Array(std::mem::take(pending)),
                }));
            }
        };

    for msg in messages {
        match msg.role {
            Role::Tool => {
                let call_id = msg.tool_call_id.clone().unwrap_or_default();
                let tool_name = msg
                    .tool_name
                    .clone()
                    .or_else(|| name_map.get(&call_id).cloned())
                    .unwrap_or_default();
                let data = data_map(&[
                    ("tool_call_id", json!(call_id)),
                    ("tool_name", json!(tool_name)),
                    ("content", json!(msg.content)),
                ]);
                let mut block = apply_template(&tr.block_template, &data);
                if msg.is_error {
                    if let (Some(error_field), Value::Object(map)) = (&tr.error_field, &mut block)
                    {
                        map.insert(error_field.clone(), Value::Bool(true));
                    }
                }

                match tr.wrap_mode.as_str() {
                    "direct" => {
                        let mut wire = Map::new();
                        wire.insert("role".to_string(), json!(tr.role));
                        if let Value::Object(fields) = block {
                            wire.extend(fields);
                        }
                        converted.push(Value::Object(wire));
                    }
                    "parts" => {
                        converted.push(json!({
                            "role": tr.role,
                            &schema.content_key: [block],
                        }));
                    }
                    // content_blocks: group consecutive results in one message.
                    _ => pending_results.push(block),
                }
            }

            Role::Assistant if !msg.tool_calls.is_empty() => {
                flush(&mut converted, &mut pending_results);
                let assistant_role = schema
                    .role_map
                    .get("assistant")
                    .cloned()
                    .unwrap_or_else(|| "assistant".to_string());
                for tc in &msg.tool_calls {
                    name_map.insert(tc.id.clone(), tc.name.clone());
                }

                if schema.content_wrap == "string" {
                    // Tool calls live in a top-level array on the message.
                    let calls: Vec<Value> = msg
                        .tool_calls
                        .iter()
                        .map(|tc| {
                            let input_json = serde_json::to_string(&tc.input)
                                .unwrap_or_else(|_| tc.input.to_string());
                            let data = data_map(&[
                                ("id", json!(tc.id)),
                                ("name", json!(tc.name)),
                                ("input", tc.input.clone()),
                                ("input_json", json!(input_json)),
                            ]);
                            apply_template(&schema.tool_call_block_template, &data)
                        })
                        .collect();
                    let content = if msg.content.is_empty() {
                        Value::Null
                    } else {
                        json!(msg.content)
                    };
                    converted.push(json!({
                        "role": assistant_role,
                        "content": content,
                        "tool_calls": calls,
                    }));
                } else {
                    // Block-based: tool calls are content blocks.
                    let mut blocks: Vec<Value> = Vec::new();
                    if let Some(thinking) = &msg.thinking {
                        if !thinking.is_empty() {
                            blocks.push(json!({"thought": true, "text": thinking}));
                        }
                    }
                    if !msg.content.is_empty() {
                        blocks.push(wrap_text_block(&msg.content, &schema.content_wrap));
                    }
                    for tc in &msg.tool_calls {
                        if let Some(raw) = &tc.raw_block {
                            // Replay the preserved wire block verbatim.
                            blocks.push(raw.clone());
                        } else {
                            let data = data_map(&[
                                ("id", json!(tc.id)),
                                ("name", json!(tc.name)),
                                ("input", tc.input.clone()),
                            ]);
                            blocks.push(apply_template(&schema.tool_call_block_template, &data));
                        }
                    }
                    converted.push(json!({
                        "role": assistant_role,
                        &schema.content_key: blocks,
                    }));
                }
            }

            _ => {
                flush(&mut converted, &mut pending_results);
                let role_name = msg.role.as_str();
                let mapped = schema
                    .role_map
                    .get(role_name)
                    .cloned()
                    .unwrap_or_else(|| role_name.to_string());

                if schema.content_key == "content" {
                    converted.push(json!({"role": mapped, "content": msg.content}));
                } else {
                    let mut parts: Vec<Value> = Vec::new();
                    if let Some(thinking) = &msg.thinking {
                        if !thinking.is_empty() {
                            parts.push(json!({"thought": true, "text": thinking}));
                        }
                    }
                    if !msg.content.is_empty() {
                        parts.push(wrap_text_block(&msg.content, &schema.content_wrap));
                    }
                    converted.push(json!({"role": mapped, &schema.content_key: parts}));
                }
            }
        }
    }
    flush(&mut converted, &mut pending_results);

    if !system_prompt.is_empty() && system.mode == "message_role" {
        converted.insert(0, json!({"role": "system", "content": system_prompt}));
    }

    converted
}

/// Format tool schemas using the provider's `tool_definition` template.
///
/// When `tool_list_wrap` is set, all formatted tools group into a single
/// object under that key.
#[must_use]
pub fn format_tools(tools: &[ToolSchema], config: &ToolUseConfig) -> Vec<Value> {
    if tools.is_empty() {
        return Vec::new();
    }
    if config.tool_definition.is_null() {
        return tools
            .iter()
            .map(|t| serde_json::to_value(t).unwrap_or(Value::Null))
            .collect();
    }
    let formatted: Vec<Value> = tools
        .iter()
        .map(|tool| {
            let data = data_map(&[
                ("name", json!(tool.name)),
                ("description", json!(tool.description)),
                ("schema", tool.schema.clone()),
            ]);
            apply_template(&config.tool_definition, &data)
        })
        .collect();

    match &config.tool_list_wrap {
        Some(key) => vec![json!({key: formatted})],
        None => formatted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ToolResultSchema;
    use spindle_core::ToolCall;

    fn anthropic_schema() -> MessageSchema {
        MessageSchema {
            content_wrap: "blocks_array".into(),
            tool_result: ToolResultSchema {
                role: "user".into(),
                wrap_mode: "content_blocks".into(),
                block_template: json!({
                    "type": "tool_result",
                    "tool_use_id": "{tool_call_id}",
                    "content": "{content}",
                }),
                error_field: Some("is_error".into()),
            },
            tool_call_block_template: json!({
                "type": "tool_use",
                "id": "{id}",
                "name": "{name}",
                "input": "{input}",
            }),
            ..MessageSchema::default()
        }
    }

    fn openai_schema() -> MessageSchema {
        MessageSchema {
            content_wrap: "string".into(),
            tool_result: ToolResultSchema {
                role: "tool".into(),
                wrap_mode: "direct".into(),
                block_template: json!({
                    "tool_call_id": "{tool_call_id}",
                    "content": "{content}",
                }),
                error_field: None,
            },
            tool_call_block_template: json!({
                "id": "{id}",
                "type": "function",
                "function": {"name": "{name}", "arguments": "{input_json}"},
            }),
            ..MessageSchema::default()
        }
    }

    fn conversation() -> Vec<Message> {
        let mut assistant = Message::assistant("checking");
        assistant
            .tool_calls
            .push(ToolCall::new("call_1", "spindle_execute", json!({"x": 1})));
        vec![
            Message::user("go"),
            assistant,
            Message::tool_result("call_1", "result text"),
            Message::assistant("done"),
        ]
    }

    #[test]
    fn block_providers_get_tool_use_blocks_and_grouped_results() {
        let wire = convert_messages(
            &conversation(),
            &anthropic_schema(),
            &SystemMessageConfig::default(),
            "",
        );
        assert_eq!(wire.len(), 4);
        // Assistant: text block + tool_use block.
        let blocks = wire[1]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "text");
        assert_eq!(blocks[1]["type"], "tool_use");
        assert_eq!(blocks[1]["id"], "call_1");
        assert_eq!(blocks[1]["input"], json!({"x": 1}));
        // Tool result grouped into a user message.
        assert_eq!(wire[2]["role"], "user");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][0]["tool_use_id"], "call_1");
    }

    #[test]
    fn string_providers_get_top_level_tool_calls_and_direct_results() {
        let wire = convert_messages(
            &conversation(),
            &openai_schema(),
            &SystemMessageConfig::default(),
            "",
        );
        let calls = wire[1]["tool_calls"].as_array().unwrap();
        assert_eq!(calls[0]["function"]["name"], "spindle_execute");
        assert_eq!(
            calls[0]["function"]["arguments"].as_str().unwrap(),
            "{\"x\":1}"
        );
        // Direct tool message.
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_1");
        assert_eq!(wire[2]["content"], "result text");
    }

    #[test]
    fn error_results_carry_the_error_field() {
        let mut messages = conversation();
        messages[2].is_error = true;
        let wire = convert_messages(
            &messages,
            &anthropic_schema(),
            &SystemMessageConfig::default(),
            "",
        );
        assert_eq!(wire[2]["content"][0]["is_error"], true);
    }

    #[test]
    fn message_role_system_prompt_is_prepended() {
        let system = SystemMessageConfig {
            mode: "message_role".into(),
            ..SystemMessageConfig::default()
        };
        let wire = convert_messages(&[Message::user("hi")], &openai_schema(), &system, "be brief");
        assert_eq!(wire[0]["role"], "system");
        assert_eq!(wire[0]["content"], "be brief");
        assert_eq!(wire[1]["role"], "user");
    }

    #[test]
    fn body_field_system_prompt_is_not_a_message() {
        let wire = convert_messages(
            &[Message::user("hi")],
            &anthropic_schema(),
            &SystemMessageConfig::default(),
            "be brief",
        );
        assert_eq!(wire.len(), 1);
    }

    #[test]
    fn raw_blocks_are_replayed_verbatim() {
        let mut assistant = Message::assistant("");
        let mut call = ToolCall::new("c1", "t", json!({}));
        call.raw_block = Some(json!({"functionCall": {"name": "t"}, "thoughtSignature": "sig"}));
        assistant.tool_calls.push(call);
        let wire = convert_messages(
            &[assistant],
            &anthropic_schema(),
            &SystemMessageConfig::default(),
            "",
        );
        assert_eq!(wire[0]["content"][0]["thoughtSignature"], "sig");
    }

    #[test]
    fn parts_providers_wrap_content() {
        let schema = MessageSchema {
            content_key: "parts".into(),
            content_wrap: "parts_array".into(),
            role_map: [("assistant".to_string(), "model".to_string())]
                .into_iter()
                .collect(),
            ..MessageSchema::default()
        };
        let wire = convert_messages(
            &[Message::assistant("hello")],
            &schema,
            &SystemMessageConfig::default(),
            "",
        );
        assert_eq!(wire[0]["role"], "model");
        assert_eq!(wire[0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn tool_formatting_applies_template_and_wrap() {
        let tools = vec![ToolSchema {
            name: "spindle_execute".into(),
            description: "run things".into(),
            schema: json!({"type": "object"}),
            item_id: Some("spindle/primary/spindle_execute".into()),
        }];

        let mut config = ToolUseConfig {
            tool_definition: json!({
                "name": "{name}",
                "description": "{description}",
                "input_schema": "{schema}",
            }),
            ..ToolUseConfig::default()
        };
        let formatted = format_tools(&tools, &config);
        assert_eq!(formatted[0]["name"], "spindle_execute");
        assert_eq!(formatted[0]["input_schema"], json!({"type": "object"}));

        config.tool_list_wrap = Some("functionDeclarations".into());
        let wrapped = format_tools(&tools, &config);
        assert_eq!(wrapped.len(), 1);
        assert_eq!(
            wrapped[0]["functionDeclarations"][0]["name"],
            "spindle_execute"
        );
    }
}
