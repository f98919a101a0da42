// SPDX-License-Identifier: MIT OR Apache-2.0
//! Schema-driven LLM provider adapter.
//!
//! There is no per-provider code: a provider is a YAML document supplying a
//! message schema (how the canonical message list lowers to wire format), a
//! tool-definition template, a response schema (sync parsing), and a stream
//! schema (one of three streaming assembly modes). The adapter is a small
//! schema interpreter — path lookup, template substitution, block-type
//! detection — plus the HTTP transport and streaming sink fan-out.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod convert;
mod error;
mod http;
mod parse;
mod resolver;
mod schema;
mod stream;

pub use convert::{convert_messages, format_tools};
pub use error::ProviderError;
pub use http::{HttpProvider, StreamSink, VecSink};
pub use parse::parse_response;
pub use resolver::{ModelEntry, ModelTable, ResolvedProvider, load_env_cascade, resolve_provider};
pub use schema::{
    BlockDetect, DetectRule, HttpConfig, MessageSchema, Pricing, ProviderConfig, ResponseSchema,
    StreamSchema, SystemMessageConfig, ToolResultSchema, ToolUseConfig, apply_template,
    detect_block, resolve_path,
};
pub use stream::assemble_stream;
