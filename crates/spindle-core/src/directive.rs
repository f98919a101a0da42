// SPDX-License-Identifier: MIT OR Apache-2.0
//! Parsed directives.

use crate::hook::Hook;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Model selection: a tier alias or an explicit model id, with an optional
/// provider hint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSelector {
    /// Tier alias resolved through the model table (e.g. `general`, `fast`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    /// Explicit model id; takes precedence over `tier`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Provider item-id hint, when the model table is ambiguous.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// An acknowledged risk: the directive author has seen the classification
/// and states why the capability is still needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAcknowledgment {
    /// Risk name from the classification table.
    pub risk: String,
    /// Author's justification.
    #[serde(default)]
    pub reason: String,
}

/// A declared structured output field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputField {
    /// Field name in the returned object.
    pub name: String,
    /// Declared type label (informational).
    #[serde(default = "default_output_type")]
    pub r#type: String,
    /// Whether the field must be present at directive return.
    #[serde(default)]
    pub required: bool,
    /// Human description.
    #[serde(default)]
    pub description: String,
}

fn default_output_type() -> String {
    "string".to_string()
}

/// Context attachments: knowledge ids per position, plus hook suppressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectiveContext {
    /// Knowledge ids concatenated into the system prompt.
    #[serde(default)]
    pub system: Vec<String>,
    /// Knowledge ids placed before the user prompt.
    #[serde(default)]
    pub before: Vec<String>,
    /// Knowledge ids placed after the user prompt.
    #[serde(default)]
    pub after: Vec<String>,
    /// Hook ids (or action item ids) disabled for this directive.
    /// Matching is exact — basename-only matching is deliberately not
    /// supported, to prevent ambiguity.
    #[serde(default)]
    pub suppress: Vec<String>,
}

impl DirectiveContext {
    /// Whether every position and the suppression set are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.system.is_empty()
            && self.before.is_empty()
            && self.after.is_empty()
            && self.suppress.is_empty()
    }
}

/// A parsed unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    /// Path-like id (e.g. `spindle/agent/review`).
    #[serde(default)]
    pub id: String,
    /// Artifact version string.
    #[serde(default)]
    pub version: String,
    /// Parent directive id for composition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Instructional body handed to the LLM.
    #[serde(default)]
    pub body: String,
    /// Model selection.
    #[serde(default)]
    pub model: ModelSelector,
    /// Limit name → numeric threshold.
    #[serde(default)]
    pub limits: BTreeMap<String, f64>,
    /// Capability strings in canonical flat form.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Acknowledged risk classifications.
    #[serde(default)]
    pub acknowledged_risks: Vec<RiskAcknowledgment>,
    /// Directive-level hooks (layer 1 by convention).
    #[serde(default)]
    pub hooks: Vec<Hook>,
    /// Context attachments.
    #[serde(default)]
    pub context: DirectiveContext,
    /// Structured return schema, when the directive expects one.
    #[serde(default)]
    pub outputs: Vec<OutputField>,
    /// Per-directive continuation directive override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation_directive: Option<String>,
}

impl Directive {
    /// Names of the output fields marked required.
    #[must_use]
    pub fn required_output_fields(&self) -> Vec<&str> {
        self.outputs
            .iter()
            .filter(|o| o.required)
            .map(|o| o.name.as_str())
            .collect()
    }

    /// Build the first-message prompt text from the directive content.
    ///
    /// Only what the LLM needs: name + description, the body, and — when
    /// outputs are declared — the structured-return instruction naming the
    /// sentinel tool.
    #[must_use]
    pub fn build_prompt(&self) -> String {
        let mut parts: Vec<String> = Vec::new();

        match (self.id.is_empty(), self.description.is_empty()) {
            (false, false) => parts.push(format!(
                "<directive name=\"{}\">\n<description>{}</description>",
                self.id, self.description
            )),
            (false, true) => parts.push(format!("<directive name=\"{}\">", self.id)),
            (true, false) => parts.push(format!(
                "<directive>\n<description>{}</description>",
                self.description
            )),
            (true, true) => {}
        }

        let body = self.body.trim();
        if !body.is_empty() {
            parts.push(body.to_string());
        }

        if !self.outputs.is_empty() {
            let fields = self
                .outputs
                .iter()
                .map(|o| {
                    let mut label = if o.description.is_empty() {
                        o.r#type.clone()
                    } else {
                        format!("{} ({})", o.description, o.r#type)
                    };
                    if o.required {
                        label.push_str(" [required]");
                    }
                    format!("\"{}\": \"<{}>\"", o.name, label)
                })
                .collect::<Vec<_>>()
                .join(", ");
            parts.push(format!(
                "When you have completed all steps, return structured results:\n\
                 `spindle_execute(item_type=\"tool\", item_id=\"spindle/agent/threads/directive_return\", \
                 parameters={{{fields}}})`\n\n\
                 If you are BLOCKED and cannot complete the directive — missing context, \
                 permission denied on a required tool, required files not found, or repeated \
                 failures on the same error — do NOT waste turns working around it. \
                 Return immediately with an error:\n\
                 `spindle_execute(item_type=\"tool\", item_id=\"spindle/agent/threads/directive_return\", \
                 parameters={{\"status\": \"error\", \"error_detail\": \"<what is missing or broken>\"}})`"
            ));
        }

        if !self.id.is_empty() || !self.description.is_empty() {
            parts.push("</directive>".to_string());
        }

        parts.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Directive {
        Directive {
            id: "spindle/agent/review".into(),
            version: "1.0.0".into(),
            description: "Review a changeset".into(),
            body: "1. Read the diff\n2. Report findings".into(),
            outputs: vec![
                OutputField {
                    name: "verdict".into(),
                    r#type: "string".into(),
                    required: true,
                    description: "approve or reject".into(),
                },
                OutputField {
                    name: "notes".into(),
                    r#type: "string".into(),
                    required: false,
                    description: String::new(),
                },
            ],
            ..Directive::default()
        }
    }

    #[test]
    fn prompt_carries_name_body_and_return_instruction() {
        let prompt = sample().build_prompt();
        assert!(prompt.starts_with("<directive name=\"spindle/agent/review\">"));
        assert!(prompt.contains("Read the diff"));
        assert!(prompt.contains("directive_return"));
        assert!(prompt.contains("[required]"));
        assert!(prompt.trim_end().ends_with("</directive>"));
    }

    #[test]
    fn prompt_without_outputs_has_no_return_instruction() {
        let mut d = sample();
        d.outputs.clear();
        assert!(!d.build_prompt().contains("directive_return"));
    }

    #[test]
    fn required_output_fields_filters() {
        let d = sample();
        assert_eq!(d.required_output_fields(), vec!["verdict"]);
    }

    #[test]
    fn serde_defaults_tolerate_sparse_documents() {
        let d: Directive = serde_yaml::from_str("id: a/b\n").unwrap();
        assert_eq!(d.id, "a/b");
        assert!(d.permissions.is_empty());
        assert!(d.context.is_empty());
        assert!(d.extends.is_none());
    }
}
