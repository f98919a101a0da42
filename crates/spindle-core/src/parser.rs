// SPDX-License-Identifier: MIT OR Apache-2.0
//! Directive parsing seam.
//!
//! The kernel treats parsing as a contract: `parse(text) → Directive`. The
//! reference implementation reads a YAML front-matter block (between `---`
//! fences) for metadata and takes the remainder as the body. Richer
//! markdown/XML parsers plug in through [`DirectiveParser`].

use crate::directive::Directive;

/// Parse failure.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The document carries no front-matter block.
    #[error("directive '{id}' has no front-matter block")]
    MissingFrontMatter {
        /// Item id being parsed.
        id: String,
    },

    /// The front-matter block is not valid YAML for a directive.
    #[error("directive '{id}' front matter is invalid: {reason}")]
    InvalidFrontMatter {
        /// Item id being parsed.
        id: String,
        /// Underlying YAML error.
        reason: String,
    },
}

/// Contract for turning artifact text into a [`Directive`].
pub trait DirectiveParser: Send + Sync {
    /// Parse `text` (signature header already stripped) into a directive
    /// with the given item id.
    ///
    /// # Errors
    ///
    /// Returns [`ParseError`] when the document is not a directive.
    fn parse(&self, id: &str, text: &str) -> Result<Directive, ParseError>;
}

/// Reference parser: YAML front matter + markdown body.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrontMatterParser;

impl FrontMatterParser {
    /// Split a document into (front_matter, body).
    fn split(text: &str) -> Option<(&str, &str)> {
        let trimmed = text.trim_start_matches('\u{feff}').trim_start();
        let rest = trimmed.strip_prefix("---")?;
        let rest = rest.strip_prefix('\n').or_else(|| rest.strip_prefix("\r\n"))?;
        let end = rest.find("\n---")?;
        let front = &rest[..end];
        let after = &rest[end + 4..];
        let body = after.strip_prefix('\n').unwrap_or(after);
        Some((front, body))
    }
}

impl DirectiveParser for FrontMatterParser {
    fn parse(&self, id: &str, text: &str) -> Result<Directive, ParseError> {
        let (front, body) = Self::split(text).ok_or_else(|| ParseError::MissingFrontMatter {
            id: id.to_string(),
        })?;

        let mut directive: Directive =
            serde_yaml::from_str(front).map_err(|e| ParseError::InvalidFrontMatter {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        if directive.id.is_empty() {
            directive.id = id.to_string();
        }
        if directive.body.is_empty() {
            directive.body = body.trim().to_string();
        }
        Ok(directive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "---\n\
description: Review a changeset\n\
model:\n  tier: general\n\
limits:\n  turns: 10\n  spend: 0.5\n\
permissions:\n  - spindle.execute.tool.spindle.file-system.*\n\
---\n\
1. Read the diff\n2. Report findings\n";

    #[test]
    fn parses_front_matter_and_body() {
        let d = FrontMatterParser.parse("spindle/agent/review", DOC).unwrap();
        assert_eq!(d.id, "spindle/agent/review");
        assert_eq!(d.description, "Review a changeset");
        assert_eq!(d.model.tier.as_deref(), Some("general"));
        assert_eq!(d.limits.get("turns"), Some(&10.0));
        assert_eq!(d.permissions.len(), 1);
        assert!(d.body.starts_with("1. Read the diff"));
    }

    #[test]
    fn missing_front_matter_is_an_error() {
        let err = FrontMatterParser
            .parse("a/b", "just a body, no fences")
            .unwrap_err();
        assert!(matches!(err, ParseError::MissingFrontMatter { .. }));
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let err = FrontMatterParser
            .parse("a/b", "---\nlimits: [not, a, map\n---\nbody")
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidFrontMatter { .. }));
    }

    #[test]
    fn explicit_id_in_front_matter_wins() {
        let doc = "---\nid: explicit/id\n---\nbody";
        let d = FrontMatterParser.parse("fallback/id", doc).unwrap();
        assert_eq!(d.id, "explicit/id");
    }
}
