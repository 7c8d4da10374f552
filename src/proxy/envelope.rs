//! Response objects in the shape OpenAI-compatible callers parse.

use crate::ai::types::{CompletionChunk, CompletionResponse, Usage};
use crate::{Error, UpstreamError, ValidationError};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatCompletionObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkObject {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<serde_json::Value>,
}

/// OpenAI-style error body: `{"error": {"message", "type", "code"}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEnvelope {
    pub error: ErrorObject,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorObject {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: &'static str,
    pub code: &'static str,
}

impl From<&Error> for ErrorEnvelope {
    fn from(err: &Error) -> Self {
        let (error_type, code) = match err {
            Error::Validation(ValidationError::Malformed(_)) => {
                ("invalid_request_error", "invalid_request")
            }
            Error::Validation(ValidationError::UnsupportedMediaType(_)) => {
                ("invalid_request_error", "unsupported_media_type")
            }
            Error::Validation(ValidationError::PayloadTooLarge { .. }) => {
                ("invalid_request_error", "payload_too_large")
            }
            Error::NotFound(_) => ("invalid_request_error", "not_found"),
            Error::BindingConflict { .. } => ("invalid_request_error", "binding_conflict"),
            Error::Upstream(UpstreamError::Timeout { .. }) => {
                ("upstream_error", "upstream_timeout")
            }
            Error::Upstream(_) => ("upstream_error", "upstream_failed"),
            _ => ("server_error", "internal_error"),
        };

        Self {
            error: ErrorObject {
                message: err.to_string(),
                error_type,
                code,
            },
        }
    }
}

/// Shared identity of every object produced for one turn.
#[derive(Debug, Clone)]
pub struct Envelope {
    id: String,
    created: i64,
    model: String,
}

impl Envelope {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: Utc::now().timestamp(),
            model: model.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn completion(&self, response: CompletionResponse) -> ChatCompletionObject {
        ChatCompletionObject {
            id: self.id.clone(),
            object: "chat.completion",
            created: self.created,
            model: response.model.unwrap_or_else(|| self.model.clone()),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant",
                    content: response.content,
                    tool_calls: response.tool_calls,
                },
                finish_reason: Some(response.finish_reason.unwrap_or_else(|| "stop".to_string())),
            }],
            usage: response.usage,
        }
    }

    /// Delta chunk; the first one of a stream also announces the assistant role.
    pub fn chunk(&self, chunk: CompletionChunk, first: bool) -> ChunkObject {
        ChunkObject {
            id: self.id.clone(),
            object: "chat.completion.chunk",
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    role: first.then_some("assistant"),
                    content: chunk.content,
                    tool_calls: chunk.tool_calls,
                },
                finish_reason: chunk.finish_reason,
            }],
            usage: chunk.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_completion_object_shape() {
        let envelope = Envelope::new("gpt-4o");
        let object = envelope.completion(CompletionResponse {
            id: Some("upstream-id".to_string()),
            model: None,
            content: "A cat.".to_string(),
            tool_calls: None,
            finish_reason: None,
            usage: None,
        });

        let json = serde_json::to_value(&object).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "gpt-4o");
        assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(
            json["choices"],
            serde_json::json!([{
                "index": 0,
                "message": { "role": "assistant", "content": "A cat." },
                "finish_reason": "stop"
            }])
        );
        assert!(json.get("usage").is_none());
    }

    #[test]
    fn test_first_chunk_carries_role() {
        let envelope = Envelope::new("gpt-4o");
        let first =
            serde_json::to_value(envelope.chunk(CompletionChunk::text("Hel"), true)).unwrap();
        let second =
            serde_json::to_value(envelope.chunk(CompletionChunk::text("lo"), false)).unwrap();

        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(
            first["choices"][0]["delta"],
            serde_json::json!({ "role": "assistant", "content": "Hel" })
        );
        assert_eq!(second["choices"][0]["delta"], serde_json::json!({ "content": "lo" }));
        assert_eq!(second["choices"][0]["finish_reason"], serde_json::Value::Null);
        assert_eq!(first["id"], second["id"]);
    }

    #[test]
    fn test_tool_call_delta_is_relayed() {
        let envelope = Envelope::new("gpt-4o");
        let chunk = CompletionChunk {
            tool_calls: Some(serde_json::json!([{ "index": 0, "id": "call_1" }])),
            ..CompletionChunk::default()
        };
        let json = serde_json::to_value(envelope.chunk(chunk, false)).unwrap();
        assert_eq!(
            json["choices"][0]["delta"],
            serde_json::json!({ "tool_calls": [{ "index": 0, "id": "call_1" }] })
        );
    }

    #[test]
    fn test_error_envelope_codes() {
        let timeout = Error::Upstream(UpstreamError::Timeout { provider: "OpenAI" });
        let body = serde_json::to_value(ErrorEnvelope::from(&timeout)).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "error": {
                    "message": "Upstream error: OpenAI request timed out",
                    "type": "upstream_error",
                    "code": "upstream_timeout"
                }
            })
        );

        let invalid = Error::malformed("messages must not be empty");
        assert_eq!(ErrorEnvelope::from(&invalid).error.code, "invalid_request");
    }
}
