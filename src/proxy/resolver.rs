//! Work out which session an inbound completion belongs to.

use crate::ai::ChatCompletionRequest;
use crate::session::SessionStore;
use serde_json::Value;

/// `extra_body` fields that may carry a session key, in priority order.
const EXTRA_BODY_FIELDS: &[&str] = &[
    "session_id",
    "sessionId",
    "conversation_id",
    "conversationId",
    "temporary_key",
    "temporaryKey",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSource {
    Header,
    SessionHint,
    ExtraBody,
    User,
}

impl SessionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionSource::Header => "header",
            SessionSource::SessionHint => "sessionHint",
            SessionSource::ExtraBody => "extra_body",
            SessionSource::User => "user",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub key: String,
    pub source: SessionSource,
}

/// Every candidate key the request carries, highest priority first.
pub fn candidates(header: Option<&str>, request: &ChatCompletionRequest) -> Vec<ResolvedSession> {
    let mut found = Vec::new();
    let mut push = |source, value: Option<&str>| {
        if let Some(key) = value.map(str::trim).filter(|k| !k.is_empty()) {
            if !found.iter().any(|c: &ResolvedSession| c.key == key) {
                found.push(ResolvedSession {
                    key: key.to_string(),
                    source,
                });
            }
        }
    };

    push(SessionSource::Header, header);
    push(SessionSource::SessionHint, request.session_hint.as_deref());
    if let Some(Value::Object(extra)) = &request.extra_body {
        for field in EXTRA_BODY_FIELDS {
            push(SessionSource::ExtraBody, extra.get(*field).and_then(Value::as_str));
        }
    }
    push(SessionSource::User, request.user.as_deref());

    found
}

/// First candidate the store knows about; `None` means a text-only turn.
pub fn resolve(
    store: &SessionStore,
    header: Option<&str>,
    request: &ChatCompletionRequest,
) -> Option<ResolvedSession> {
    candidates(header, request)
        .into_iter()
        .find(|candidate| store.contains(&candidate.key))
}
