//! Mind map generation in jsMind `node_tree` format.
//!
//! The chat backend is asked for a single JSON document. Whatever comes back
//! is checked for the fields a jsMind renderer needs; anything that does not
//! pass is replaced by [`fallback_document`], so callers always receive a
//! renderable map.

use log::{debug, warn};
use serde_json::{json, Value};
use thiserror::Error;

use crate::decoder::{ChatDecoder, ChatPrompt, DecodeError};

pub const NODE_TREE_FORMAT: &str = "node_tree";

const MINDMAP_PROMPT: &str = r#"Turn the user's text into a mind map. Reply with a single JSON object and nothing else, using the jsMind node_tree format:
{
  "meta": {"name": "<short title>", "author": "scribe", "version": "1.0"},
  "format": "node_tree",
  "data": {
    "id": "root",
    "topic": "<central topic>",
    "children": [
      {"id": "<unique id>", "topic": "<subtopic>", "direction": "right", "children": []}
    ]
  }
}
Every node needs a unique "id" and a "topic". Keep topics short. Do not wrap the JSON in a code block."#;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MindmapError {
    #[error("no JSON object in response")]
    NoJson,

    #[error("invalid JSON: {0}")]
    Parse(String),

    #[error("missing or invalid field `{0}`")]
    Field(&'static str),
}

pub fn prompt(text: &str) -> ChatPrompt {
    ChatPrompt::instruct(MINDMAP_PROMPT, text)
}

/// The map returned when the backend's answer cannot be used.
pub fn fallback_document() -> Value {
    json!({
        "meta": {
            "name": "mindmap",
            "author": "scribe",
            "version": "1.0"
        },
        "format": NODE_TREE_FORMAT,
        "data": {
            "id": "root",
            "topic": "Mind map unavailable",
            "children": []
        }
    })
}

/// Strips Markdown code fences and surrounding chatter, keeping the outermost
/// `{ ... }`.
fn extract_json(raw: &str) -> Result<&str, MindmapError> {
    let start = raw.find('{').ok_or(MindmapError::NoJson)?;
    let end = raw.rfind('}').ok_or(MindmapError::NoJson)?;
    if end < start {
        return Err(MindmapError::NoJson);
    }
    Ok(&raw[start..=end])
}

fn non_empty_str(value: &Value, field: &'static str) -> Result<(), MindmapError> {
    match value.as_str() {
        Some(s) if !s.trim().is_empty() => Ok(()),
        _ => Err(MindmapError::Field(field)),
    }
}

pub fn validate(raw: &str) -> Result<Value, MindmapError> {
    let document: Value = serde_json::from_str(extract_json(raw)?)
        .map_err(|e| MindmapError::Parse(e.to_string()))?;

    if !document.get("meta").is_some_and(Value::is_object) {
        return Err(MindmapError::Field("meta"));
    }
    if document.get("format").and_then(Value::as_str) != Some(NODE_TREE_FORMAT) {
        return Err(MindmapError::Field("format"));
    }
    let data = document
        .get("data")
        .filter(|data| data.is_object())
        .ok_or(MindmapError::Field("data"))?;
    non_empty_str(&data["id"], "data.id")?;
    non_empty_str(&data["topic"], "data.topic")?;

    Ok(document)
}

/// Asks `chat` for a mind map of `text`. Only backend failures are errors;
/// an unusable answer yields the fallback document.
pub async fn generate(chat: &dyn ChatDecoder, text: &str) -> Result<Value, DecodeError> {
    let raw = chat.complete(prompt(text)).await?;
    match validate(&raw) {
        Ok(document) => {
            debug!("Generated mind map ({} bytes)", raw.len());
            Ok(document)
        }
        Err(e) => {
            warn!("Mind map response rejected, using fallback: {}", e);
            Ok(fallback_document())
        }
    }
}
