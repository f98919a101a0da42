// SPDX-License-Identifier: MIT OR Apache-2.0
//! The HTTP provider: request building, sync calls, and streaming with
//! sink fan-out.

use crate::convert::{convert_messages, format_tools};
use crate::error::ProviderError;
use crate::parse::parse_response;
use crate::schema::{ProviderConfig, apply_template};
use crate::stream::assemble_stream;
use futures::StreamExt;
use serde_json::{Map, Value, json};
use spindle_core::{CompletionResponse, Message, ToolSchema};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

const DEFAULT_MAX_TOKENS: u64 = 16_384;

/// Receives raw stream event payloads, in arrival order.
///
/// Sinks must be non-blocking or fail fast: a slow sink must not
/// back-pressure the HTTP read. Each sink decides whether to buffer
/// internally. Sinks never interpret events — final assembly is the
/// adapter's single parse.
pub trait StreamSink: Send + Sync {
    /// Push one raw event payload.
    fn push(&self, chunk: &str);
}

/// A sink that buffers chunks in memory (tests, replay).
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    chunks: Arc<Mutex<Vec<String>>>,
}

impl VecSink {
    /// New empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of received chunks.
    #[must_use]
    pub fn chunks(&self) -> Vec<String> {
        self.chunks.lock().expect("sink lock poisoned").clone()
    }
}

impl StreamSink for VecSink {
    fn push(&self, chunk: &str) {
        self.chunks
            .lock()
            .expect("sink lock poisoned")
            .push(chunk.to_string());
    }
}

/// Schema-driven HTTP provider bound to a resolved model.
pub struct HttpProvider {
    model: String,
    provider_item_id: String,
    config: ProviderConfig,
    env: BTreeMap<String, String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProvider")
            .field("model", &self.model)
            .field("provider_item_id", &self.provider_item_id)
            .finish_non_exhaustive()
    }
}

impl HttpProvider {
    /// Build a provider for a resolved model.
    ///
    /// `env` supplies credential values for `{env:VAR}` header placeholders
    /// (see [`crate::resolver::load_env_cascade`]).
    #[must_use]
    pub fn new(
        model: impl Into<String>,
        provider_item_id: impl Into<String>,
        config: ProviderConfig,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            model: model.into(),
            provider_item_id: provider_item_id.into(),
            config,
            env,
            client: reqwest::Client::new(),
        }
    }

    /// The resolved model id.
    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The provider artifact id.
    #[must_use]
    pub fn provider_item_id(&self) -> &str {
        &self.provider_item_id
    }

    /// The provider configuration.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Declared context window in tokens.
    #[must_use]
    pub fn context_window(&self) -> u64 {
        self.config.context_window
    }

    /// Tool-use mode: `native` or `text_parsed`.
    #[must_use]
    pub fn tool_use_mode(&self) -> &str {
        &self.config.tool_use.mode
    }

    /// Streaming mode name, for sinks that adapt their rendering.
    #[must_use]
    pub fn response_format(&self) -> &str {
        &self.config.tool_use.stream_schema.stream_mode
    }

    /// HTTP providers always support streaming.
    #[must_use]
    pub fn supports_streaming(&self) -> bool {
        true
    }

    fn resolve_env_placeholders(&self, raw: &str) -> String {
        let mut out = raw.to_string();
        while let Some(start) = out.find("{env:") {
            let Some(rel_end) = out[start..].find('}') else {
                break;
            };
            let end = start + rel_end;
            let var = &out[start + 5..end];
            let value = self
                .env
                .get(var)
                .cloned()
                .or_else(|| std::env::var(var).ok())
                .unwrap_or_default();
            out.replace_range(start..=end, &value);
        }
        out
    }

    fn build_body(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        system_prompt: &str,
        stream: bool,
    ) -> Value {
        let tu = &self.config.tool_use;
        let wire_messages = convert_messages(
            messages,
            &tu.message_schema,
            &tu.system_message,
            system_prompt,
        );
        let wire_tools = format_tools(tools, tu);

        let mut params = Map::new();
        params.insert("model".to_string(), json!(self.model));
        params.insert("messages".to_string(), Value::Array(wire_messages));
        params.insert("max_tokens".to_string(), json!(DEFAULT_MAX_TOKENS));
        params.insert("stream".to_string(), json!(stream));
        if !wire_tools.is_empty() {
            params.insert("tools".to_string(), Value::Array(wire_tools));
        }

        let mut body = if self.config.config.body.is_null() {
            // No template: the params map is the body.
            let mut map = params.clone();
            map.remove("stream");
            if stream {
                map.insert("stream".to_string(), json!(true));
            }
            Value::Object(map)
        } else {
            apply_template(&self.config.config.body, &params)
        };

        // Drop empty-template leftovers for optional sections.
        if let Value::Object(map) = &mut body {
            if map.get("tools") == Some(&Value::String(String::new())) {
                map.remove("tools");
            }
            if !stream {
                if let Some(Value::Bool(false)) = map.get("stream") {
                    map.remove("stream");
                }
            }
        }

        // System prompt placement into the body, when configured so.
        if !system_prompt.is_empty() {
            let sys = &tu.system_message;
            match sys.mode.as_str() {
                "body_field" => {
                    if let Value::Object(map) = &mut body {
                        map.insert(sys.field.clone(), json!(system_prompt));
                    }
                }
                "body_inject" => {
                    if !sys.template.is_null() {
                        let mut data = Map::new();
                        data.insert("system".to_string(), json!(system_prompt));
                        let injected = apply_template(&sys.template, &data);
                        if let (Value::Object(map), Value::Object(inject)) = (&mut body, injected) {
                            for (k, v) in inject {
                                map.insert(k, v);
                            }
                        }
                    }
                }
                // message_role placement happened in convert_messages.
                _ => {}
            }
        }

        body
    }

    fn url_for(&self, stream: bool) -> String {
        let raw = if stream {
            self.config
                .config
                .stream_url
                .as_deref()
                .unwrap_or(&self.config.config.url)
        } else {
            &self.config.config.url
        };
        raw.replace("{model}", &self.model)
    }

    fn request(&self, url: &str, body: &Value) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).json(body);
        for (name, raw_value) in &self.config.config.headers {
            req = req.header(name.as_str(), self.resolve_env_placeholders(raw_value));
        }
        req
    }

    fn call_error(&self, status: u16, request_id: String, body: &Value) -> ProviderError {
        let (message, error_type) = match body.get("error") {
            Some(Value::Object(api_error)) => (
                api_error
                    .get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| Value::Object(api_error.clone()).to_string(), ToString::to_string),
                api_error
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("api_error")
                    .to_string(),
            ),
            Some(other) => (other.to_string(), "api_error".to_string()),
            None => (
                if body.is_null() {
                    "unknown provider error".to_string()
                } else {
                    body.to_string()
                },
                "unknown".to_string(),
            ),
        };
        ProviderError::Call {
            provider_id: self.provider_item_id.clone(),
            message,
            http_status: status,
            request_id,
            error_type,
            retryable: ProviderError::status_is_retryable(status),
        }
    }

    fn transport_error(&self, e: &reqwest::Error) -> ProviderError {
        ProviderError::Call {
            provider_id: self.provider_item_id.clone(),
            message: e.to_string(),
            http_status: 0,
            request_id: String::new(),
            error_type: "transport".to_string(),
            retryable: true,
        }
    }

    /// Synchronous completion.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Call`] on transport failures or non-success
    /// statuses, with retryability classified from the status.
    pub async fn create_completion(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        system_prompt: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = self.build_body(messages, tools, system_prompt, false);
        let url = self.url_for(false);
        tracing::debug!(target: "spindle.provider", model = %self.model, %url, "sync completion");

        let response = self
            .request(&url, &body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let response_body: Value = response.json().await.unwrap_or(Value::Null);

        if !(200..300).contains(&status) {
            return Err(self.call_error(status, request_id, &response_body));
        }

        Ok(parse_response(&response_body, &self.config, &self.model))
    }

    /// Streaming completion with sink fan-out.
    ///
    /// Opens an SSE/NDJSON stream, pushes every raw event payload to each
    /// sink as it arrives, and returns only after the final event; the
    /// response is assembled from the full buffered payload list using the
    /// stream schema.
    ///
    /// # Errors
    ///
    /// [`ProviderError::Call`] for status failures before the stream opens;
    /// [`ProviderError::Stream`] when the body stream breaks mid-read.
    pub async fn create_streaming_completion(
        &self,
        messages: &[Message],
        tools: &[ToolSchema],
        sinks: &[Arc<dyn StreamSink>],
        system_prompt: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let body = self.build_body(messages, tools, system_prompt, true);
        let url = self.url_for(true);
        tracing::debug!(target: "spindle.provider", model = %self.model, %url, "streaming completion");

        let response = self
            .request(&url, &body)
            .send()
            .await
            .map_err(|e| self.transport_error(&e))?;

        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get("request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if !(200..300).contains(&status) {
            let error_body: Value = response.json().await.unwrap_or(Value::Null);
            return Err(self.call_error(status, request_id, &error_body));
        }

        // Read the byte stream, split into lines, and fan every event
        // payload to the sinks synchronously before buffering it.
        let mut buffered: Vec<String> = Vec::new();
        let mut pending = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let bytes = chunk.map_err(|e| ProviderError::Stream {
                provider_id: self.provider_item_id.clone(),
                message: e.to_string(),
            })?;
            pending.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(newline) = pending.find('\n') {
                let line: String = pending.drain(..=newline).collect();
                if let Some(payload) = event_payload(line.trim_end()) {
                    for sink in sinks {
                        sink.push(&payload);
                    }
                    buffered.push(payload);
                }
            }
        }
        // Trailing line without a newline.
        if let Some(payload) = event_payload(pending.trim_end()) {
            for sink in sinks {
                sink.push(&payload);
            }
            buffered.push(payload);
        }

        Ok(assemble_stream(&buffered, &self.config, &self.model))
    }
}

/// Extract the event payload from one wire line.
///
/// SSE `data:` lines yield their payload; NDJSON lines pass through; event
/// names, comments, and blank lines yield nothing.
fn event_payload(line: &str) -> Option<String> {
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return None;
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.strip_prefix(' ').unwrap_or(data);
        if data.is_empty() {
            return None;
        }
        return Some(data.to_string());
    }
    Some(line.to_string())
}
