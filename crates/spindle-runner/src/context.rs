// SPDX-License-Identifier: MIT OR Apache-2.0
//! Recent-conversation context for failure diagnostics.

use serde_json::{Value, json};
use spindle_core::{Message, Role};

const MAX_ENTRIES: usize = 6;
const ASSISTANT_SNIPPET: usize = 500;
const TOOL_SNIPPET: usize = 300;

fn snippet(text: &str, max: usize) -> String {
    let mut end = max.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Extract recent conversation context so the parent thread (or operator)
/// can understand what the model was doing when it broke: the last
/// assistant snippet plus recent tool-call and error snippets.
#[must_use]
pub fn extract_error_context(messages: &[Message]) -> Value {
    let mut last_assistant = String::new();
    let mut recent_tool_calls: Vec<String> = Vec::new();
    let mut recent_errors: Vec<String> = Vec::new();

    let window_start = messages.len().saturating_sub(MAX_ENTRIES * 2);
    for msg in messages[window_start..].iter().rev() {
        match msg.role {
            Role::Assistant if last_assistant.is_empty() => {
                last_assistant = snippet(&msg.content, ASSISTANT_SNIPPET);
            }
            Role::Tool => {
                let lower = msg.content.to_lowercase();
                let text = snippet(&msg.content, TOOL_SNIPPET);
                if lower.contains("error") || lower.contains("denied") {
                    recent_errors.push(text);
                } else {
                    recent_tool_calls.push(text);
                }
                if recent_tool_calls.len() + recent_errors.len() >= MAX_ENTRIES {
                    break;
                }
            }
            _ => {}
        }
    }

    recent_tool_calls.truncate(3);
    recent_errors.truncate(3);
    json!({
        "last_assistant": last_assistant,
        "recent_tool_calls": recent_tool_calls,
        "recent_errors": recent_errors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn captures_assistant_and_splits_tool_results() {
        let messages = vec![
            Message::user("go"),
            Message::assistant("working on the thing"),
            Message::tool_result("a", "normal output"),
            Message::tool_result("b", "permission denied: missing caps"),
        ];
        let ctx = extract_error_context(&messages);
        assert_eq!(ctx["last_assistant"], "working on the thing");
        assert_eq!(ctx["recent_tool_calls"][0], "normal output");
        assert!(ctx["recent_errors"][0]
            .as_str()
            .unwrap()
            .contains("denied"));
    }

    #[test]
    fn empty_conversation_is_harmless() {
        let ctx = extract_error_context(&[]);
        assert_eq!(ctx["last_assistant"], "");
        assert!(ctx["recent_tool_calls"].as_array().unwrap().is_empty());
    }

    #[test]
    fn long_assistant_text_is_truncated() {
        let messages = vec![Message::assistant("x".repeat(2000))];
        let ctx = extract_error_context(&messages);
        assert_eq!(ctx["last_assistant"].as_str().unwrap().len(), 500);
    }
}
