// SPDX-License-Identifier: MIT OR Apache-2.0
//! Stream assembly: buffered raw event payloads → a completion response.
//!
//! Three modes, all schema-driven:
//! - `event_typed`: named SSE events with dotted paths to fields;
//! - `delta_merge`: progressive `choices[].delta` fragments concatenated
//!   across events;
//! - `complete_chunks`: each event is a complete response-shaped object;
//!   chunks append, usage is the max across chunks (cumulative pattern).

use crate::schema::{ProviderConfig, detect_block, resolve_path};
use serde_json::Value;
use spindle_core::{CompletionResponse, FinishReason, ToolCall};
use std::collections::BTreeMap;

/// Assemble buffered raw event payloads into a response using the
/// provider's stream schema.
#[must_use]
pub fn assemble_stream(events: &[String], config: &ProviderConfig, model: &str) -> CompletionResponse {
    match config.tool_use.stream_schema.stream_mode.as_str() {
        "delta_merge" => assemble_delta_merge(events, config, model),
        "complete_chunks" => assemble_complete_chunks(events, config, model),
        _ => assemble_event_typed(events, config, model),
    }
}

struct PartialToolCall {
    id: String,
    name: String,
    input_parts: Vec<String>,
}

fn finish_tool_calls(partials: Vec<PartialToolCall>) -> Vec<ToolCall> {
    partials
        .into_iter()
        .map(|tc| {
            let joined = tc.input_parts.concat();
            let input = if joined.is_empty() {
                Value::Object(Default::default())
            } else {
                serde_json::from_str(&joined)
                    .unwrap_or_else(|_| serde_json::json!({"_raw": joined}))
            };
            ToolCall::new(tc.id, tc.name, input)
        })
        .collect()
}

fn assemble_event_typed(
    events: &[String],
    config: &ProviderConfig,
    model: &str,
) -> CompletionResponse {
    let schema = &config.tool_use.stream_schema;
    let resp = &config.tool_use.response_schema;

    let mut text_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<PartialToolCall> = Vec::new();
    let mut finish_reason = FinishReason::EndTurn;
    let mut input_tokens: u64 = 0;
    let mut output_tokens: u64 = 0;

    for raw in events {
        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            continue;
        };
        let event_type = data
            .get(&schema.event_type_field)
            .and_then(Value::as_str)
            .unwrap_or("");

        if event_type == schema.message_start_type {
            if let Some(usage) = resolve_path(&data, &schema.message_start_usage) {
                input_tokens += usage
                    .get(&resp.input_tokens)
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
                output_tokens += usage
                    .get(&resp.output_tokens)
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
        } else if event_type == schema.block_start_type {
            let block = resolve_path(&data, &schema.block_start_path)
                .cloned()
                .unwrap_or_default();
            if detect_block(&block, &resp.block_detect.tool_call) {
                let id = resp
                    .tool_call_id
                    .as_deref()
                    .and_then(|p| resolve_path(&block, p))
                    .and_then(Value::as_str)
                    .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);
                let name = resolve_path(&block, &resp.tool_call_name)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                tool_calls.push(PartialToolCall {
                    id,
                    name,
                    input_parts: Vec::new(),
                });
            }
        } else if event_type == schema.block_delta_type {
            let delta = resolve_path(&data, &schema.delta_path)
                .cloned()
                .unwrap_or_default();
            let delta_type = delta
                .get(&schema.delta_type_field)
                .and_then(Value::as_str)
                .unwrap_or("");
            if delta_type == schema.text_delta_type {
                if let Some(text) = delta.get(&schema.text_delta_field).and_then(Value::as_str) {
                    text_parts.push(text.to_string());
                }
            } else if delta_type == schema.tool_input_delta_type {
                if let Some(last) = tool_calls.last_mut() {
                    if let Some(fragment) = delta
                        .get(&schema.tool_input_delta_field)
                        .and_then(Value::as_str)
                    {
                        last.input_parts.push(fragment.to_string());
                    }
                }
            }
        } else if event_type == schema.message_delta_type {
            if let Some(fr) = resolve_path(&data, &schema.finish_reason_path).and_then(Value::as_str)
            {
                finish_reason = FinishReason::from_wire(fr);
            }
            if let Some(usage) = resolve_path(&data, &schema.delta_usage_path) {
                output_tokens += usage
                    .get(&resp.output_tokens)
                    .and_then(Value::as_u64)
                    .unwrap_or(0);
            }
        }
    }

    CompletionResponse {
        text: text_parts.concat(),
        thinking: None,
        tool_calls: finish_tool_calls(tool_calls),
        input_tokens,
        output_tokens,
        spend: config.spend(model, input_tokens, output_tokens),
        finish_reason,
    }
}

fn assemble_delta_merge(
    events: &[String],
    config: &ProviderConfig,
    model: &str,
) -> CompletionResponse {
    let schema = &config.tool_use.stream_schema;
    let resp = &config.tool_use.response_schema;

    let in_field = schema
        .input_tokens_field
        .clone()
        .unwrap_or_else(|| resp.input_tokens.clone());
    let out_field = schema
        .output_tokens_field
        .clone()
        .unwrap_or_else(|| resp.output_tokens.clone());

    let mut text_parts: Vec<String> = Vec::new();
    // Fragment index → accumulating call; BTreeMap keeps wire order.
    let mut tool_calls: BTreeMap<u64, PartialToolCall> = BTreeMap::new();
    let mut finish_reason = FinishReason::EndTurn;
    let mut input_tokens: u64 = 0;
    let mut output_tokens: u64 = 0;

    for raw in events {
        if Some(raw.as_str()) == schema.done_signal.as_deref() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            continue;
        };

        let add_usage =
            |data: &Value, input_tokens: &mut u64, output_tokens: &mut u64| {
                if let Some(usage) = resolve_path(data, &schema.usage_path) {
                    *input_tokens += usage.get(&in_field).and_then(Value::as_u64).unwrap_or(0);
                    *output_tokens += usage.get(&out_field).and_then(Value::as_u64).unwrap_or(0);
                }
            };

        let choices = data
            .get(&schema.choices_field)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        if choices.is_empty() {
            // Usage-only terminal chunk.
            add_usage(&data, &mut input_tokens, &mut output_tokens);
            continue;
        }

        let choice = &choices[0];
        let delta = choice
            .get(&schema.delta_field)
            .cloned()
            .unwrap_or_default();

        if let Some(text) = delta.get(&schema.text_delta_field).and_then(Value::as_str) {
            if !text.is_empty() {
                text_parts.push(text.to_string());
            }
        }

        for tc in delta
            .get(&schema.tool_calls_field)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let index = tc
                .get(&schema.tool_call_index_field)
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let entry = tool_calls.entry(index).or_insert_with(|| PartialToolCall {
                id: String::new(),
                name: String::new(),
                input_parts: Vec::new(),
            });
            if let Some(id) = tc.get(&schema.tool_call_id_field).and_then(Value::as_str) {
                if !id.is_empty() {
                    entry.id = id.to_string();
                }
            }
            if let Some(func) = resolve_path(tc, &schema.tool_call_func_path) {
                if let Some(name) = func.get(&schema.tool_call_name_field).and_then(Value::as_str)
                {
                    if !name.is_empty() {
                        entry.name = name.to_string();
                    }
                }
                if let Some(args) = func.get(&schema.tool_call_args_field).and_then(Value::as_str)
                {
                    if !args.is_empty() {
                        entry.input_parts.push(args.to_string());
                    }
                }
            }
        }

        if let Some(fr) = choice
            .get(&schema.finish_reason_field)
            .and_then(Value::as_str)
        {
            finish_reason = FinishReason::from_wire(fr);
        }

        add_usage(&data, &mut input_tokens, &mut output_tokens);
    }

    CompletionResponse {
        text: text_parts.concat(),
        thinking: None,
        tool_calls: finish_tool_calls(tool_calls.into_values().collect()),
        input_tokens,
        output_tokens,
        spend: config.spend(model, input_tokens, output_tokens),
        finish_reason,
    }
}

fn assemble_complete_chunks(
    events: &[String],
    config: &ProviderConfig,
    model: &str,
) -> CompletionResponse {
    let schema = &config.tool_use.stream_schema;
    let resp = &config.tool_use.response_schema;

    let mut text_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut finish_reason = FinishReason::EndTurn;
    let mut input_tokens: u64 = 0;
    let mut output_tokens: u64 = 0;

    for raw in events {
        if Some(raw.as_str()) == schema.done_signal.as_deref() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(raw) else {
            continue;
        };

        let blocks = resolve_path(&data, &resp.content_path)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        for block in &blocks {
            if detect_block(block, &resp.block_detect.thinking) {
                if let Some(text) = resolve_path(block, &resp.text_value).and_then(Value::as_str) {
                    thinking_parts.push(text.to_string());
                }
            } else if detect_block(block, &resp.block_detect.text) {
                if let Some(text) = resolve_path(block, &resp.text_value).and_then(Value::as_str) {
                    text_parts.push(text.to_string());
                }
            } else if detect_block(block, &resp.block_detect.tool_call) {
                let name = resolve_path(block, &resp.tool_call_name)
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string();
                let input = resolve_path(block, &resp.tool_call_input)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                let id = resp
                    .tool_call_id
                    .as_deref()
                    .and_then(|p| resolve_path(block, p))
                    .and_then(Value::as_str)
                    .map_or_else(|| uuid::Uuid::new_v4().to_string(), ToString::to_string);
                let mut call = ToolCall::new(id, name, input);
                if block.get("thoughtSignature").is_some() {
                    call.raw_block = Some(block.clone());
                }
                tool_calls.push(call);
            }
        }

        // Usage reports cumulatively: take the max across chunks.
        if let Some(usage) = resolve_path(&data, &resp.usage_path) {
            input_tokens = input_tokens.max(
                usage
                    .get(&resp.input_tokens)
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            );
            output_tokens = output_tokens.max(
                usage
                    .get(&resp.output_tokens)
                    .and_then(Value::as_u64)
                    .unwrap_or(0),
            );
        }

        if let Some(fr) = resolve_path(&data, &resp.finish_reason_path).and_then(Value::as_str) {
            finish_reason = FinishReason::from_wire(fr);
        }
    }

    CompletionResponse {
        text: text_parts.concat(),
        thinking: if thinking_parts.is_empty() {
            None
        } else {
            Some(thinking_parts.concat())
        },
        tool_calls,
        input_tokens,
        output_tokens,
        spend: config.spend(model, input_tokens, output_tokens),
        finish_reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{BlockDetect, DetectRule, ResponseSchema, StreamSchema};
    use serde_json::json;

    fn event_typed_config() -> ProviderConfig {
        let mut config = ProviderConfig::default();
        config.tool_use.response_schema = ResponseSchema {
            block_detect: BlockDetect {
                tool_call: DetectRule {
                    field: Some("type".into()),
                    value: Some(json!("tool_use")),
                    key: None,
                },
                ..BlockDetect::default()
            },
            tool_call_id: Some("id".into()),
            ..ResponseSchema::default()
        };
        config
    }

    #[test]
    fn event_typed_assembles_tool_call_fragments() {
        // The canonical event-typed sequence: usage on message_start, a
        // tool_use block, two input fragments, closing usage + stop reason.
        let events: Vec<String> = [
            json!({"type": "message_start", "message": {"usage": {"input_tokens": 10, "output_tokens": 0}}}),
            json!({"type": "content_block_start", "content_block": {"type": "tool_use", "id": "a", "name": "t"}}),
            json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "{\"x\":"}}),
            json!({"type": "content_block_delta", "delta": {"type": "input_json_delta", "partial_json": "1}"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "tool_use"}, "usage": {"output_tokens": 5}}),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();

        let response = assemble_stream(&events, &event_typed_config(), "m");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "a");
        assert_eq!(response.tool_calls[0].name, "t");
        assert_eq!(response.tool_calls[0].input, json!({"x": 1}));
        assert_eq!(response.input_tokens, 10);
        assert_eq!(response.output_tokens, 5);
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
    }

    #[test]
    fn event_typed_concatenates_text_deltas() {
        let events: Vec<String> = [
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "Hel"}}),
            json!({"type": "content_block_delta", "delta": {"type": "text_delta", "text": "lo"}}),
            json!({"type": "message_delta", "delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 2}}),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        let response = assemble_stream(&events, &event_typed_config(), "m");
        assert_eq!(response.text, "Hello");
        assert_eq!(response.finish_reason, FinishReason::EndTurn);
    }

    fn delta_merge_config() -> ProviderConfig {
        let mut config = ProviderConfig::default();
        config.tool_use.stream_schema = StreamSchema {
            stream_mode: "delta_merge".into(),
            done_signal: Some("[DONE]".into()),
            text_delta_field: "content".into(),
            ..StreamSchema::default()
        };
        config.tool_use.response_schema.input_tokens = "prompt_tokens".into();
        config.tool_use.response_schema.output_tokens = "completion_tokens".into();
        config
    }

    #[test]
    fn delta_merge_concatenates_text_and_arguments() {
        let events: Vec<String> = vec![
            json!({"choices": [{"delta": {"content": "Hi "}}]}).to_string(),
            json!({"choices": [{"delta": {"content": "there"}}]}).to_string(),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "id": "call_1", "function": {"name": "t", "arguments": "{\"a\":"}},
            ]}}]})
            .to_string(),
            json!({"choices": [{"delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "2}"}},
            ]}, "finish_reason": "tool_calls"}]})
            .to_string(),
            json!({"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 3}}).to_string(),
            "[DONE]".to_string(),
        ];
        let response = assemble_stream(&events, &delta_merge_config(), "m");
        assert_eq!(response.text, "Hi there");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].id, "call_1");
        assert_eq!(response.tool_calls[0].input, json!({"a": 2}));
        assert_eq!(response.input_tokens, 7);
        assert_eq!(response.output_tokens, 3);
        assert_eq!(response.finish_reason, FinishReason::ToolUse);
    }

    fn complete_chunks_config() -> ProviderConfig {
        let mut config = ProviderConfig::default();
        config.tool_use.stream_schema.stream_mode = "complete_chunks".into();
        config.tool_use.response_schema = ResponseSchema {
            content_path: "candidates.0.content.parts".into(),
            block_detect: BlockDetect {
                text: DetectRule {
                    field: None,
                    value: None,
                    key: Some("text".into()),
                },
                tool_call: DetectRule {
                    field: None,
                    value: None,
                    key: Some("functionCall".into()),
                },
                ..BlockDetect::default()
            },
            text_value: "text".into(),
            tool_call_name: "functionCall.name".into(),
            tool_call_input: "functionCall.args".into(),
            usage_path: "usageMetadata".into(),
            input_tokens: "promptTokenCount".into(),
            output_tokens: "candidatesTokenCount".into(),
            finish_reason_path: "candidates.0.finishReason".into(),
            ..ResponseSchema::default()
        };
        config
    }

    #[test]
    fn complete_chunks_takes_max_usage() {
        let events: Vec<String> = vec![
            json!({
                "candidates": [{"content": {"parts": [{"text": "part one "}]}}],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 4},
            })
            .to_string(),
            json!({
                "candidates": [{
                    "content": {"parts": [
                        {"text": "part two"},
                        {"functionCall": {"name": "t", "args": {"k": "v"}}},
                    ]},
                    "finishReason": "STOP",
                }],
                "usageMetadata": {"promptTokenCount": 12, "candidatesTokenCount": 9},
            })
            .to_string(),
        ];
        let response = assemble_stream(&events, &complete_chunks_config(), "m");
        assert_eq!(response.text, "part one part two");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].input, json!({"k": "v"}));
        // Cumulative usage: max, not sum.
        assert_eq!(response.input_tokens, 12);
        assert_eq!(response.output_tokens, 9);
    }

    #[test]
    fn unparseable_chunks_are_skipped() {
        let events = vec!["not json".to_string(), "".to_string()];
        let response = assemble_stream(&events, &event_typed_config(), "m");
        assert_eq!(response.text, "");
        assert!(response.tool_calls.is_empty());
    }
}
