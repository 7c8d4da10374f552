//! Completion proxy
//!
//! Resolves the session of an inbound chat completion, injects its pending
//! image once, forwards the turn to the configured provider and shapes the
//! answer for the caller.

pub mod envelope;
pub mod inject;
pub mod relay;
pub mod resolver;

pub use envelope::{ChatCompletionObject, ChunkObject, Envelope, ErrorEnvelope};
pub use relay::RelayEvent;
pub use resolver::{ResolvedSession, SessionSource};

use crate::ai::{ChatCompletionRequest, CompletionService};
use crate::models::{ImageReferenceMode, InjectionPolicy};
use crate::session::lifecycle::BlobReleaseGuard;
use crate::session::{Consumed, SessionLifecycle};
use crate::{Error, Result};
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A validated turn ready to forward.
pub struct PreparedTurn {
    pub request: ChatCompletionRequest,
    pub session: Option<ResolvedSession>,
    /// Message index of the injected image, if one was injected.
    pub injected_at: Option<usize>,
    release: Option<BlobReleaseGuard>,
}

pub struct CompletionProxy {
    service: Arc<dyn CompletionService>,
    lifecycle: Arc<SessionLifecycle>,
    reference_mode: ImageReferenceMode,
    stream_idle_timeout: Duration,
}

impl CompletionProxy {
    pub fn new(
        service: Arc<dyn CompletionService>,
        lifecycle: Arc<SessionLifecycle>,
        reference_mode: ImageReferenceMode,
        stream_idle_timeout: Duration,
    ) -> Self {
        Self {
            service,
            lifecycle,
            reference_mode,
            stream_idle_timeout,
        }
    }

    pub fn service(&self) -> &Arc<dyn CompletionService> {
        &self.service
    }

    /// Parse a raw request body.
    pub fn parse(body: &[u8]) -> Result<ChatCompletionRequest> {
        serde_json::from_slice(body)
            .map_err(|e| Error::malformed(format!("invalid chat completion request: {}", e)))
    }

    /// Validate, resolve the session and inject its image if still pending.
    pub fn prepare(
        &self,
        header_key: Option<&str>,
        mut request: ChatCompletionRequest,
    ) -> Result<PreparedTurn> {
        request.validate()?;
        // Before consuming, so a rejected turn leaves the image pending.
        self.service.check(&request)?;

        let store = self.lifecycle.store();
        let session = resolver::resolve(store, header_key, &request);
        let mut injected_at = None;
        let mut release = None;

        match &session {
            Some(resolved) => match store.consume(&resolved.key) {
                Ok(Consumed::Fresh(context)) => {
                    let url = context.reference_url(self.reference_mode);
                    let index = inject::inject_image(&mut request.messages, url);
                    debug!(
                        "Injected image for {} (via {}) at message {}",
                        context.session_key,
                        resolved.source.as_str(),
                        index
                    );
                    injected_at = Some(index);
                    if store.policy() == InjectionPolicy::DeleteAfterUse {
                        release = Some(self.lifecycle.release_on_drop(&context));
                    }
                }
                Ok(Consumed::AlreadyInjected) => {
                    debug!("Image for {} already injected, text-only turn", resolved.key);
                }
                // Evicted between resolution and consumption.
                Err(Error::NotFound(_)) => {
                    debug!("Image for {} no longer available, text-only turn", resolved.key);
                }
                Err(e) => return Err(e),
            },
            None => debug!("No session resolved, text-only turn"),
        }

        request.model = self.service.model().to_string();

        Ok(PreparedTurn {
            request,
            session,
            injected_at,
            release,
        })
    }

    pub async fn complete(&self, turn: PreparedTurn) -> Result<ChatCompletionObject> {
        let envelope = Envelope::new(self.service.model());
        let response = self.service.complete(&turn.request).await?;
        debug!(
            "{} answered {} with {} chars",
            self.service.provider(),
            envelope.id(),
            response.content.len()
        );
        drop(turn.release);
        Ok(envelope.completion(response))
    }

    /// Lazily relay a streaming turn; see [`relay::relay`].
    pub fn stream(&self, turn: PreparedTurn) -> BoxStream<'static, RelayEvent> {
        relay::relay(
            Arc::clone(&self.service),
            turn.request,
            Envelope::new(self.service.model()),
            self.stream_idle_timeout,
            turn.release,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::{ContentPart, MessageContent};
    use crate::ai::MockCompletionClient;
    use crate::blob::{BlobStore, MockBlobStore};
    use crate::session::{ImageContext, ImagePayload, SessionStore};
    use futures::StreamExt;

    struct Harness {
        proxy: CompletionProxy,
        mock: MockCompletionClient,
        lifecycle: Arc<SessionLifecycle>,
        blobs: MockBlobStore,
    }

    fn harness(policy: InjectionPolicy) -> Harness {
        harness_with(policy, MockCompletionClient::new())
    }

    fn harness_with(policy: InjectionPolicy, mock: MockCompletionClient) -> Harness {
        let blobs = MockBlobStore::new();
        let lifecycle = Arc::new(SessionLifecycle::new(
            Arc::new(SessionStore::new(policy)),
            Arc::new(blobs.clone()),
            Duration::from_secs(3600),
        ));
        let proxy = CompletionProxy::new(
            Arc::new(mock.clone()),
            Arc::clone(&lifecycle),
            ImageReferenceMode::Inline,
            Duration::from_secs(1),
        );
        Harness {
            proxy,
            mock,
            lifecycle,
            blobs,
        }
    }

    fn upload(harness: &Harness, key: &str) {
        harness.lifecycle.store().put(
            key,
            ImageContext::new(
                key,
                ImagePayload::Inline {
                    data: Arc::from(&b"\x89PNG"[..]),
                    mime_type: "image/png".to_string(),
                },
            ),
        );
    }

    fn request(json: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(json).unwrap()
    }

    fn turn_request(hint: &str) -> ChatCompletionRequest {
        request(serde_json::json!({
            "model": "whatever",
            "messages": [
                { "role": "system", "content": "Be brief." },
                { "role": "user", "content": "What is this?" }
            ],
            "sessionHint": hint
        }))
    }

    #[tokio::test]
    async fn test_injects_pending_image_once() {
        let h = harness(InjectionPolicy::MarkInjected);
        upload(&h, "sess-42");

        let first = h.proxy.prepare(None, turn_request("sess-42")).unwrap();
        assert_eq!(first.injected_at, Some(1));
        assert_eq!(first.request.image_part_count(), 1);
        assert_eq!(first.request.model, "mock-model");
        assert!(matches!(
            &first.request.messages[1].content,
            Some(MessageContent::Parts(parts))
                if matches!(&parts[1], ContentPart::ImageUrl { image_url }
                    if image_url.url == "data:image/png;base64,iVBORw==")
        ));

        let second = h.proxy.prepare(None, turn_request("sess-42")).unwrap();
        assert_eq!(second.injected_at, None);
        assert_eq!(second.request.image_part_count(), 0);
        assert_eq!(second.request.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_session_is_text_only() {
        let h = harness(InjectionPolicy::MarkInjected);
        let turn = h.proxy.prepare(Some("nobody"), turn_request("nobody")).unwrap();
        assert!(turn.session.is_none());
        assert_eq!(turn.request.image_part_count(), 0);

        let response = h.proxy.complete(turn).await.unwrap();
        assert_eq!(response.choices[0].message.content, "mock response");
        assert_eq!(h.mock.get_call_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_never_reaches_upstream() {
        let h = harness(InjectionPolicy::MarkInjected);
        let err = h
            .proxy
            .prepare(None, request(serde_json::json!({ "messages": [] })))
            .err()
            .unwrap();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(h.mock.get_call_count(), 0);
    }

    #[tokio::test]
    async fn test_provider_rejection_keeps_image_pending() {
        let mock = MockCompletionClient::new().rejecting("cannot translate this turn");
        let h = harness_with(InjectionPolicy::MarkInjected, mock);
        upload(&h, "sess-42");

        let mut streaming = turn_request("sess-42");
        streaming.stream = Some(true);
        let err = h.proxy.prepare(None, streaming).err().unwrap();

        assert!(err.to_string().contains("cannot translate this turn"));
        assert_eq!(h.mock.get_call_count(), 0);
        assert!(matches!(
            h.lifecycle.store().consume("sess-42"),
            Ok(Consumed::Fresh(_))
        ));
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        let err = CompletionProxy::parse(br#"{"messages": "hello"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid chat completion request"));
    }

    #[tokio::test]
    async fn test_delete_policy_releases_blob_after_turn() {
        let h = harness(InjectionPolicy::DeleteAfterUse);
        h.blobs.store("a.png", b"img", "image/png").await.unwrap();
        h.lifecycle.store().put(
            "sess-1",
            ImageContext::new(
                "sess-1",
                ImagePayload::Inline {
                    data: Arc::from(&b"img"[..]),
                    mime_type: "image/png".to_string(),
                },
            )
            .with_blob("a.png".to_string(), None),
        );

        let turn = h.proxy.prepare(None, turn_request("sess-1")).unwrap();
        assert!(turn.injected_at.is_some());
        assert!(h.lifecycle.store().is_empty());

        let events: Vec<RelayEvent> = h.proxy.stream(turn).collect().await;
        assert_eq!(events.last(), Some(&RelayEvent::Done));

        for _ in 0..50 {
            if h.blobs.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(h.blobs.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_turns_inject_once() {
        let h = Arc::new(harness(InjectionPolicy::MarkInjected));
        upload(&h, "sess-7");

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let h = Arc::clone(&h);
                tokio::spawn(async move {
                    h.proxy
                        .prepare(None, turn_request("sess-7"))
                        .unwrap()
                        .injected_at
                        .is_some()
                })
            })
            .collect();

        let mut injected = 0;
        for task in tasks {
            if task.await.unwrap() {
                injected += 1;
            }
        }
        assert_eq!(injected, 1);
    }
}
