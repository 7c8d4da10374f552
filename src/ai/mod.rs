//! Upstream model providers
//!
//! Every provider accepts the normalized chat-completions request from
//! [`types`] and answers either with a full [`CompletionResponse`] or a
//! stream of [`CompletionChunk`]s.

pub mod gemini;
pub mod mock;
pub mod openai;
pub mod sse;
pub mod types;

pub use gemini::GeminiCompletionClient;
pub use mock::MockCompletionClient;
pub use openai::OpenAiCompletionClient;
pub use types::{ChatCompletionRequest, ChatMessage, CompletionChunk, CompletionResponse};

use crate::{Result, UpstreamError};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::time::Duration;

pub type ChunkStream = BoxStream<'static, Result<CompletionChunk>>;

#[async_trait]
pub trait CompletionService: Send + Sync {
    fn provider(&self) -> &'static str;
    fn model(&self) -> &str;
    /// Reject requests this provider cannot translate, before any upstream I/O.
    fn check(&self, _request: &ChatCompletionRequest) -> Result<()> {
        Ok(())
    }
    async fn complete(&self, request: &ChatCompletionRequest) -> Result<CompletionResponse>;
    /// Open a streaming completion. Errors here mean no chunk was produced.
    async fn complete_stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream>;
}

/// End the stream right after its first error.
pub fn fuse_on_error(inner: ChunkStream) -> ChunkStream {
    stream::unfold(Some(inner), |state| async move {
        let mut inner = state?;
        match inner.next().await? {
            Ok(chunk) => Some((Ok(chunk), Some(inner))),
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Fail the stream with a timeout when no chunk arrives within `idle`.
pub fn with_idle_timeout(
    inner: ChunkStream,
    idle: Duration,
    provider: &'static str,
) -> ChunkStream {
    stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match tokio::time::timeout(idle, inner.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some(inner))),
            Ok(Some(Err(e))) => Some((Err(e), None)),
            Ok(None) => None,
            Err(_) => {
                tracing::warn!("{} stream idle for {:?}, giving up", provider, idle);
                Some((Err(UpstreamError::Timeout { provider }.into()), None))
            }
        }
    })
    .boxed()
}
