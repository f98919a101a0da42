// SPDX-License-Identifier: MIT OR Apache-2.0
//! Human-readable knowledge markdown rendered from the transcript JSONL.
//!
//! Re-rendered at checkpoint cadence so the knowledge file stays in sync
//! with the signed transcript. Produces a cognition-framed markdown
//! document with YAML front matter, signed with the artifact scheme.

use crate::transcript::{Transcript, TranscriptError, TranscriptEvent};
use spindle_artifact::ArtifactSigner;
use spindle_core::{Cost, event};
use std::path::PathBuf;

// Full output is always preserved in transcript.jsonl; the rendered view
// caps individual results.
const MAX_RESULT_CHARS: usize = 2000;
const MAX_FILE_CONTENT_CHARS: usize = 500;

/// Render (and sign) the knowledge markdown for a thread's transcript.
///
/// Returns the knowledge path, or `None` when the transcript has no events.
///
/// # Errors
///
/// Propagates transcript I/O failures.
pub fn render_knowledge(
    transcript: &Transcript,
    directive: &str,
    status: &str,
    model: &str,
    cost: &Cost,
    signer: Option<&ArtifactSigner>,
) -> Result<Option<PathBuf>, TranscriptError> {
    let events = match transcript.read_events() {
        Ok(events) if events.is_empty() => return Ok(None),
        Ok(events) => events,
        // The rendered view is best-effort; corrupt tails don't block it.
        Err(TranscriptError::Corrupt { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let thread_id = transcript.thread_id();
    let created_at = events
        .first()
        .map(|e| {
            chrono::DateTime::from_timestamp(e.timestamp as i64, 0)
                .unwrap_or_default()
                .format("%Y-%m-%dT%H:%M:%SZ")
                .to_string()
        })
        .unwrap_or_default();

    let duration = if cost.elapsed_seconds >= 60.0 {
        format!("{:.1}m", cost.elapsed_seconds / 60.0)
    } else {
        format!("{:.1}s", cost.elapsed_seconds)
    };

    let (category, safe_id) = match thread_id.rsplit_once('/') {
        Some((parent, name)) => (format!("agent/threads/{parent}"), name.to_string()),
        None => ("agent/threads".to_string(), thread_id.to_string()),
    };

    let mut out = String::new();
    out.push_str(&format!(
        "```yaml\n\
         id: {safe_id}\n\
         title: \"{}\"\n\
         entry_type: thread_transcript\n\
         category: {category}\n\
         created_at: {created_at}\n\
         thread_id: {thread_id}\n\
         directive: {directive}\n\
         status: {status}\n\
         model: {model}\n\
         duration: {duration}\n\
         turns: {}\n\
         input_tokens: {}\n\
         output_tokens: {}\n\
         spend: {}\n\
         tags: [thread, {status}]\n\
         ```\n\n",
        if directive.is_empty() { thread_id } else { directive },
        cost.turns,
        cost.input_tokens,
        cost.output_tokens,
        cost.spend,
    ));
    out.push_str(&format!(
        "# {}\n\n",
        if directive.is_empty() { thread_id } else { directive }
    ));

    let mut turn = 0u32;
    for ev in &events {
        if ev.event_type == event::COGNITION_IN {
            turn += 1;
        }
        // The footer is regenerated from the authoritative cost below.
        if ev.event_type == event::THREAD_COMPLETED {
            continue;
        }
        out.push_str(&render_event(ev, turn));
    }

    let status_label = match status {
        "completed" => "Completed".to_string(),
        "running" => "Running".to_string(),
        "error" => "Error".to_string(),
        other => {
            let mut label = other.to_string();
            if let Some(first) = label.get_mut(0..1) {
                first.make_ascii_uppercase();
            }
            label
        }
    };
    out.push_str(&format!(
        "---\n\n**{status_label}** -- {} turns, {} tokens, ${:.4}, {duration}\n",
        cost.turns,
        cost.total_tokens(),
        cost.spend,
    ));

    let content = match signer {
        Some(signer) => signer.sign_document(&out, "md"),
        None => out,
    };

    let path = transcript.knowledge_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| TranscriptError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(&path, content).map_err(|source| TranscriptError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(Some(path))
}

fn render_event(ev: &TranscriptEvent, turn: u32) -> String {
    let p = &ev.payload;
    let text = |key: &str| p.get(key).and_then(|v| v.as_str()).unwrap_or("").to_string();

    match ev.event_type.as_str() {
        event::SYSTEM_PROMPT => {
            let layers = p
                .get("layers")
                .and_then(|v| v.as_array())
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "custom".to_string());
            format!("## System Prompt ({layers})\n\n{}\n\n", text("text"))
        }
        event::CONTEXT_INJECTED => {
            let mut parts = String::new();
            if let Some(blocks) = p.get("blocks").and_then(|v| v.as_array()) {
                for block in blocks {
                    let id = block.get("id").and_then(|v| v.as_str()).unwrap_or("unknown");
                    let tag = id.rsplit('/').next().unwrap_or(id);
                    let content = block.get("content").and_then(|v| v.as_str()).unwrap_or("");
                    parts.push_str(&format!("<{tag} id=\"{id}\">\n{content}\n</{tag}>\n\n"));
                }
            }
            parts
        }
        event::COGNITION_IN => {
            if text("role") == "tool" {
                String::new()
            } else {
                format!("## Input — Turn {turn}\n\n{}\n\n", text("text"))
            }
        }
        event::COGNITION_REASONING => {
            let body = text("text");
            let trimmed = body.trim();
            if trimmed.is_empty() {
                return String::new();
            }
            let mut quoted = String::new();
            let mut prev_blank = false;
            for line in trimmed.lines() {
                let blank = line.trim().is_empty();
                if blank && prev_blank {
                    continue;
                }
                if blank {
                    quoted.push_str(">\n");
                } else {
                    quoted.push_str(&format!("> *{line}*\n"));
                }
                prev_blank = blank;
            }
            format!("\n{quoted}\n")
        }
        event::COGNITION_OUT => {
            let body = text("text");
            if body.trim().is_empty() {
                format!("### Response — Turn {turn}\n\n")
            } else {
                format!("### Response — Turn {turn}\n\n{body}\n\n")
            }
        }
        event::TOOL_CALL_START => {
            let tool = {
                let t = text("tool");
                if t.is_empty() { "unknown".to_string() } else { t }
            };
            let input = condense_tool_input(&tool, p.get("input").cloned().unwrap_or_default());
            let input_str =
                serde_json::to_string_pretty(&input).unwrap_or_else(|_| input.to_string());
            format!("### Tool: {tool}\n\n```json\n{input_str}\n```\n\n")
        }
        event::TOOL_CALL_RESULT => {
            if let Some(error) = p.get("error").and_then(|v| v.as_str()) {
                format!("### Error\n\n{error}\n\n")
            } else {
                format!("### Result\n\n```\n{}\n```\n\n", clean_tool_output(&text("output")))
            }
        }
        event::THREAD_ERROR => {
            format!("\n> **Error**: {}\n\n", {
                let e = text("error");
                if e.is_empty() { "unknown".to_string() } else { e }
            })
        }
        _ => String::new(),
    }
}

/// Extract the meaningful content from a tool result string.
///
/// Handles the dispatch envelope shape `{status, data: {output, …}, …}`,
/// strips internal artifact-reference metadata, deduplicates stdout/output
/// when identical, and caps length.
fn clean_tool_output(raw: &str) -> String {
    let parsed: Option<serde_json::Value> = {
        let trimmed = raw.trim();
        if trimmed.starts_with('{') || trimmed.starts_with('[') {
            serde_json::from_str(trimmed).ok()
        } else {
            None
        }
    };

    let text = match parsed {
        Some(serde_json::Value::Object(mut map)) => {
            map.remove("_artifact_ref");
            map.remove("_artifact_note");

            let data = map.get("data").and_then(|v| v.as_object()).cloned();
            let actual_output = data
                .as_ref()
                .and_then(|d| d.get("output").and_then(|v| v.as_str()))
                .or_else(|| map.get("output").and_then(|v| v.as_str()))
                .or_else(|| map.get("stdout").and_then(|v| v.as_str()))
                .map(ToString::to_string);

            if let Some(output) = actual_output {
                let mut parts = vec![output.trim_end().to_string()];
                let stderr = map
                    .get("stderr")
                    .and_then(|v| v.as_str())
                    .or_else(|| {
                        data.as_ref()
                            .and_then(|d| d.get("stderr").and_then(|v| v.as_str()))
                    })
                    .unwrap_or("");
                if !stderr.trim().is_empty() && stderr.trim() != output.trim() {
                    parts.push(format!("[stderr] {}", stderr.trim()));
                }
                let error = map
                    .get("error")
                    .and_then(|v| v.as_str())
                    .or_else(|| {
                        data.as_ref()
                            .and_then(|d| d.get("error").and_then(|v| v.as_str()))
                    });
                if let Some(error) = error {
                    parts.push(format!("[error] {error}"));
                }
                parts.join("\n")
            } else {
                // Drop redundant success markers before re-serialising.
                if map.get("status").and_then(|v| v.as_str()) == Some("success") {
                    map.remove("status");
                }
                if map.get("success").and_then(serde_json::Value::as_bool) == Some(true) {
                    map.remove("success");
                }
                if map.get("exit_code").and_then(serde_json::Value::as_i64) == Some(0) {
                    map.remove("exit_code");
                }
                serde_json::to_string_pretty(&serde_json::Value::Object(map))
                    .unwrap_or_else(|_| raw.to_string())
            }
        }
        _ => raw.to_string(),
    };

    if text.len() > MAX_RESULT_CHARS {
        let mut end = MAX_RESULT_CHARS;
        while end > 0 && !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}\n... (truncated)", &text[..end])
    } else {
        text
    }
}

/// Condense tool call inputs to reduce rendered bloat: file-write content
/// fields are summarised (the file itself is the source of truth).
fn condense_tool_input(tool: &str, input: serde_json::Value) -> serde_json::Value {
    let serde_json::Value::Object(mut map) = input else {
        return input;
    };
    if tool.contains("file-system/write") || tool.contains("file-system/create") {
        if let Some(content) = map.get("content").and_then(|v| v.as_str()) {
            if content.len() > MAX_FILE_CONTENT_CHARS {
                let lines = content.lines().count();
                let mut end = MAX_FILE_CONTENT_CHARS;
                while end > 0 && !content.is_char_boundary(end) {
                    end -= 1;
                }
                let summary = format!(
                    "{}\n... ({lines} lines, {} chars total)",
                    &content[..end],
                    content.len()
                );
                map.insert("content".to_string(), serde_json::Value::String(summary));
            }
        }
    }
    serde_json::Value::Object(map)
}
