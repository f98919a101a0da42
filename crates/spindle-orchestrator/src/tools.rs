// SPDX-License-Identifier: MIT OR Apache-2.0
//! Generic schemas for the four primary tool wrappers.

use serde_json::json;
use spindle_core::ToolSchema;

/// Build the generic tool-schema list the model sees: one wrapper per
/// primary action, with API-safe names. The provider adapter remaps these
/// into each wire format.
#[must_use]
pub fn primary_tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: "spindle_execute".into(),
            description: "Execute a tool or directive by item_id with parameters.".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "item_type": {"type": "string", "enum": ["tool", "directive"], "default": "tool"},
                    "item_id": {"type": "string", "description": "Artifact id to execute"},
                    "parameters": {"type": "object", "description": "Tool input parameters"},
                },
                "required": ["item_id"],
            }),
            item_id: Some("spindle/primary/spindle_execute".into()),
        },
        ToolSchema {
            name: "spindle_search".into(),
            description: "Search the artifact space for tools, directives, or knowledge.".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "item_type": {"type": "string", "enum": ["tool", "directive", "knowledge"], "default": "tool"},
                    "query": {"type": "string", "description": "Search query"},
                    "limit": {"type": "integer", "default": 10},
                },
                "required": ["query"],
            }),
            item_id: Some("spindle/primary/spindle_search".into()),
        },
        ToolSchema {
            name: "spindle_load".into(),
            description: "Load an artifact's content by item_id.".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "item_type": {"type": "string", "enum": ["tool", "directive", "knowledge"], "default": "knowledge"},
                    "item_id": {"type": "string", "description": "Artifact id to load"},
                },
                "required": ["item_id"],
            }),
            item_id: Some("spindle/primary/spindle_load".into()),
        },
        ToolSchema {
            name: "spindle_sign".into(),
            description: "Sign an artifact by item_id, refreshing its signature header.".into(),
            schema: json!({
                "type": "object",
                "properties": {
                    "item_type": {"type": "string", "enum": ["tool", "directive", "knowledge"], "default": "knowledge"},
                    "item_id": {"type": "string", "description": "Artifact id to sign"},
                },
                "required": ["item_id"],
            }),
            item_id: Some("spindle/primary/spindle_sign".into()),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::PrimaryAction;

    #[test]
    fn one_wrapper_per_primary() {
        let schemas = primary_tool_schemas();
        assert_eq!(schemas.len(), 4);
        for schema in &schemas {
            assert!(
                PrimaryAction::from_wrapper_name(&schema.name).is_some(),
                "{} is not a wrapper name",
                schema.name
            );
            assert!(schema.schema.get("properties").is_some());
        }
    }
}
