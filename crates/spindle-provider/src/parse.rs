// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sync response parsing, derived entirely from the response schema.

use crate::schema::{ProviderConfig, ResponseSchema, detect_block, resolve_path};
use serde_json::Value;
use spindle_core::{CompletionResponse, FinishReason, ToolCall};

fn path_str(value: &Value, path: &str) -> Option<String> {
    resolve_path(value, path)
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

fn tool_call_from_block(block: &Value, schema: &ResponseSchema) -> ToolCall {
    let name = path_str(block, &schema.tool_call_name).unwrap_or_default();
    let raw_input = resolve_path(block, &schema.tool_call_input)
        .cloned()
        .unwrap_or_else(|| Value::Object(Default::default()));
    let id = schema
        .tool_call_id
        .as_deref()
        .and_then(|p| path_str(block, p))
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let mut call = ToolCall::new(id, name, raw_input);
    // Providers that thread opaque signatures through blocks need the raw
    // block replayed on the next request.
    if block.get("thoughtSignature").is_some() {
        call.raw_block = Some(block.clone());
    }
    call
}

/// Parse any provider response body into a [`CompletionResponse`] using the
/// provider's response schema. Spend is computed from the pricing table.
#[must_use]
pub fn parse_response(body: &Value, config: &ProviderConfig, model: &str) -> CompletionResponse {
    let schema = &config.tool_use.response_schema;

    let mut text_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    match schema.content_mode.as_str() {
        "separate" => {
            let message = resolve_path(body, &schema.content_path)
                .cloned()
                .unwrap_or_default();
            if let Some(text) = message.get(&schema.text_field).and_then(Value::as_str) {
                text_parts.push(text.to_string());
            }
            let raw_calls = message
                .get(&schema.tool_calls_field)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for tc in &raw_calls {
                let name = path_str(tc, &schema.tool_call_name).unwrap_or_default();
                let mut raw_input = resolve_path(tc, &schema.tool_call_input)
                    .cloned()
                    .unwrap_or_else(|| Value::Object(Default::default()));
                if schema.tool_call_input_format.as_deref() == Some("json_string") {
                    if let Value::String(encoded) = &raw_input {
                        raw_input = serde_json::from_str(encoded)
                            .unwrap_or_else(|_| serde_json::json!({"_raw": encoded}));
                    }
                }
                let id_path = schema.tool_call_id.as_deref().unwrap_or("id");
                let id = path_str(tc, id_path).unwrap_or_default();
                tool_calls.push(ToolCall::new(id, name, raw_input));
            }
        }
        // Default: typed content blocks.
        _ => {
            let blocks = resolve_path(body, &schema.content_path)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for block in &blocks {
                if detect_block(block, &schema.block_detect.thinking) {
                    thinking_parts.push(path_str(block, &schema.text_value).unwrap_or_default());
                } else if detect_block(block, &schema.block_detect.text) {
                    text_parts.push(path_str(block, &schema.text_value).unwrap_or_default());
                } else if detect_block(block, &schema.block_detect.tool_call) {
                    tool_calls.push(tool_call_from_block(block, schema));
                }
            }
        }
    }

    let usage = resolve_path(body, &schema.usage_path)
        .cloned()
        .unwrap_or_default();
    let input_tokens = usage
        .get(&schema.input_tokens)
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output_tokens = usage
        .get(&schema.output_tokens)
        .and_then(Value::as_u64)
        .unwrap_or(0);

    let finish_reason = path_str(body, &schema.finish_reason_path)
        .map_or(FinishReason::EndTurn, |s| FinishReason::from_wire(&s));

    CompletionResponse {
        text: text_parts.join("\n"),
        thinking: if thinking_parts.is_empty() {
            None
        } else {
            Some(thinking_parts.join("\n"))
        },
        tool_calls,
        input_tokens,
        output_tokens,
        spend: config.spend(model, input_tokens, output_tokens),
        finish_reason,
    }
}
