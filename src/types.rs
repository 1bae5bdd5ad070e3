//! Canonical, provider-neutral chat-completion types.
//!
//! Clients speak this shape to the gateway; provider adapters translate
//! their native wire formats into it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Inbound request body for `POST /v1/chat/completions`.
///
/// `model` is advisory only: the orchestrator overrides it with the model of
/// whichever target it dispatches to.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl ChatRequest {
    /// Tenant identity from `metadata.tenant`; `"anonymous"` when absent or
    /// empty. Doubles as the rate-limit caller id.
    pub fn tenant(&self) -> &str {
        self.metadata
            .get("tenant")
            .and_then(Value::as_str)
            .filter(|value| !value.is_empty())
            .unwrap_or("anonymous")
    }

    /// Routing key from `metadata.use_case`; empty when absent.
    pub fn use_case(&self) -> &str {
        self.metadata
            .get("use_case")
            .and_then(Value::as_str)
            .unwrap_or("")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub usage: Usage,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    #[serde(default)]
    pub finish_reason: String,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// One incremental slice of a streamed completion.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    #[serde(default)]
    pub delta: Delta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(default)]
    pub content: String,
}

impl ChatChunk {
    /// Text this chunk appends to the completion, if any.
    pub fn delta_content(&self) -> &str {
        self.choices
            .first()
            .map(|choice| choice.delta.content.as_str())
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_with_metadata(raw: &str) -> ChatRequest {
        serde_json::from_str(raw).expect("request")
    }

    #[test]
    fn tenant_defaults_to_anonymous() {
        let request = request_with_metadata(r#"{"model":"m","messages":[]}"#);
        assert_eq!(request.tenant(), "anonymous");

        let request = request_with_metadata(r#"{"metadata":{"tenant":""}}"#);
        assert_eq!(request.tenant(), "anonymous");

        let request = request_with_metadata(r#"{"metadata":{"tenant":"acme"}}"#);
        assert_eq!(request.tenant(), "acme");
    }

    #[test]
    fn use_case_defaults_to_empty() {
        let request = request_with_metadata(r#"{"messages":[]}"#);
        assert_eq!(request.use_case(), "");

        let request = request_with_metadata(r#"{"metadata":{"use_case":"support_summary"}}"#);
        assert_eq!(request.use_case(), "support_summary");
    }

    #[test]
    fn non_string_metadata_values_are_ignored() {
        let request = request_with_metadata(r#"{"metadata":{"tenant":42,"use_case":true}}"#);
        assert_eq!(request.tenant(), "anonymous");
        assert_eq!(request.use_case(), "");
    }
}
