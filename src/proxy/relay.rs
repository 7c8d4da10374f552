//! Streaming relay from a provider chunk stream to caller-facing events.
//!
//! The upstream call is only made once the caller starts polling, and the
//! relay always finishes with [`RelayEvent::Done`] unless the caller goes
//! away first. Dropping the relay drops the upstream stream with it.

use super::envelope::{ChunkObject, Envelope, ErrorEnvelope};
use crate::ai::{with_idle_timeout, ChatCompletionRequest, ChunkStream, CompletionService};
use crate::session::lifecycle::BlobReleaseGuard;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Chunk(ChunkObject),
    Error(ErrorEnvelope),
    /// Terminal `[DONE]` marker.
    Done,
}

enum RelayState {
    Connecting {
        service: Arc<dyn CompletionService>,
        request: ChatCompletionRequest,
    },
    Streaming {
        chunks: ChunkStream,
        role_sent: bool,
    },
    Terminating,
    Closed,
}

struct Relay {
    state: RelayState,
    envelope: Envelope,
    idle_timeout: Duration,
    forwarded: usize,
    // Held until the relay is dropped.
    _release: Option<BlobReleaseGuard>,
}

pub fn relay(
    service: Arc<dyn CompletionService>,
    request: ChatCompletionRequest,
    envelope: Envelope,
    idle_timeout: Duration,
    release: Option<BlobReleaseGuard>,
) -> BoxStream<'static, RelayEvent> {
    let relay = Relay {
        state: RelayState::Connecting { service, request },
        envelope,
        idle_timeout,
        forwarded: 0,
        _release: release,
    };

    stream::unfold(relay, |mut relay| async move {
        loop {
            match std::mem::replace(&mut relay.state, RelayState::Closed) {
                RelayState::Connecting { service, request } => {
                    match service.complete_stream(&request).await {
                        Ok(chunks) => {
                            debug!(
                                "{} stream opened for {}",
                                service.provider(),
                                relay.envelope.id()
                            );
                            relay.state = RelayState::Streaming {
                                chunks: with_idle_timeout(
                                    chunks,
                                    relay.idle_timeout,
                                    service.provider(),
                                ),
                                role_sent: false,
                            };
                        }
                        Err(e) => {
                            warn!("Failed to open {} stream: {}", service.provider(), e);
                            relay.state = RelayState::Terminating;
                            return Some((RelayEvent::Error(ErrorEnvelope::from(&e)), relay));
                        }
                    }
                }
                RelayState::Streaming {
                    mut chunks,
                    role_sent,
                } => match chunks.next().await {
                    Some(Ok(chunk)) => {
                        let object = relay.envelope.chunk(chunk, !role_sent);
                        relay.forwarded += 1;
                        relay.state = RelayState::Streaming {
                            chunks,
                            role_sent: true,
                        };
                        return Some((RelayEvent::Chunk(object), relay));
                    }
                    Some(Err(e)) => {
                        warn!(
                            "Upstream stream failed after {} chunk(s): {}",
                            relay.forwarded, e
                        );
                        relay.state = RelayState::Terminating;
                        return Some((RelayEvent::Error(ErrorEnvelope::from(&e)), relay));
                    }
                    None => {
                        debug!(
                            "Upstream stream for {} finished after {} chunk(s)",
                            relay.envelope.id(),
                            relay.forwarded
                        );
                        relay.state = RelayState::Terminating;
                    }
                },
                RelayState::Terminating => {
                    relay.state = RelayState::Closed;
                    return Some((RelayEvent::Done, relay));
                }
                RelayState::Closed => return None,
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ChatMessage, MockCompletionClient};

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "mock-model".to_string(),
            messages: vec![ChatMessage::text("user", "hi")],
            stream: Some(true),
            temperature: None,
            max_tokens: None,
            user: None,
            session_hint: None,
            extra_body: None,
            tools: None,
            tool_choice: None,
        }
    }

    fn contents(events: &[RelayEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RelayEvent::Chunk(c) => c.choices[0].delta.content.clone(),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_relays_chunks_then_done() {
        let mock = MockCompletionClient::new().with_chunks(&["Hel", "lo"]);
        let events: Vec<RelayEvent> = relay(
            Arc::new(mock.clone()),
            request(),
            Envelope::new("mock-model"),
            Duration::from_secs(1),
            None,
        )
        .collect()
        .await;

        assert_eq!(contents(&events), vec!["Hel", "lo"]);
        assert_eq!(events.last(), Some(&RelayEvent::Done));
        match &events[0] {
            RelayEvent::Chunk(c) => assert_eq!(c.choices[0].delta.role, Some("assistant")),
            other => panic!("unexpected first event {:?}", other),
        }
        assert_eq!(mock.get_call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_after_two_chunks_still_terminates() {
        let mock = MockCompletionClient::new()
            .with_chunks(&["one", "two", "three"])
            .failing_after(2);
        let events: Vec<RelayEvent> = relay(
            Arc::new(mock),
            request(),
            Envelope::new("mock-model"),
            Duration::from_secs(1),
            None,
        )
        .collect()
        .await;

        assert_eq!(events.len(), 4);
        assert_eq!(contents(&events), vec!["one", "two"]);
        assert!(matches!(events[2], RelayEvent::Error(_)));
        assert_eq!(events[3], RelayEvent::Done);
    }

    #[tokio::test]
    async fn test_connect_failure_becomes_error_event() {
        let mock = MockCompletionClient::new().failing_with_status(503);
        let events: Vec<RelayEvent> = relay(
            Arc::new(mock),
            request(),
            Envelope::new("mock-model"),
            Duration::from_secs(1),
            None,
        )
        .collect()
        .await;

        assert_eq!(events.len(), 2);
        match &events[0] {
            RelayEvent::Error(body) => assert_eq!(body.error.code, "upstream_failed"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(events[1], RelayEvent::Done);
    }

    #[tokio::test]
    async fn test_upstream_is_not_called_until_polled() {
        let mock = MockCompletionClient::new();
        let stream = relay(
            Arc::new(mock.clone()),
            request(),
            Envelope::new("mock-model"),
            Duration::from_secs(1),
            None,
        );
        assert_eq!(mock.get_call_count(), 0);
        drop(stream);
        assert_eq!(mock.get_call_count(), 0);
    }

    #[tokio::test]
    async fn test_dropping_relay_cancels_upstream() {
        let mock = MockCompletionClient::new().with_chunks(&["a", "b", "c"]);
        let mut stream = relay(
            Arc::new(mock.clone()),
            request(),
            Envelope::new("mock-model"),
            Duration::from_secs(1),
            None,
        );

        assert!(matches!(stream.next().await, Some(RelayEvent::Chunk(_))));
        drop(stream);
        assert!(mock.stream_dropped());
    }
}
