use super::types::{ChatCompletionRequest, CompletionChunk, CompletionResponse};
use super::{ChunkStream, CompletionService};
use crate::{Error, Result, UpstreamError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scripted provider that records every request it receives.
#[derive(Clone)]
pub struct MockCompletionClient {
    response: Arc<Mutex<String>>,
    chunks: Arc<Mutex<Vec<String>>>,
    fail_after: Arc<Mutex<Option<usize>>>,
    fail_on_connect: Arc<Mutex<Option<u16>>>,
    rejection: Arc<Mutex<Option<String>>>,
    requests: Arc<Mutex<Vec<ChatCompletionRequest>>>,
    stream_dropped: Arc<AtomicBool>,
}

impl MockCompletionClient {
    pub fn new() -> Self {
        Self {
            response: Arc::new(Mutex::new("mock response".to_string())),
            chunks: Arc::new(Mutex::new(vec!["mock ".to_string(), "response".to_string()])),
            fail_after: Arc::new(Mutex::new(None)),
            fail_on_connect: Arc::new(Mutex::new(None)),
            rejection: Arc::new(Mutex::new(None)),
            requests: Arc::new(Mutex::new(Vec::new())),
            stream_dropped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_response(self, response: &str) -> Self {
        *self.response.lock() = response.to_string();
        self
    }

    pub fn with_chunks(self, chunks: &[&str]) -> Self {
        *self.chunks.lock() = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Emit `count` chunks, then fail the stream.
    pub fn failing_after(self, count: usize) -> Self {
        *self.fail_after.lock() = Some(count);
        self
    }

    /// Answer every call with an upstream HTTP error.
    pub fn failing_with_status(self, status: u16) -> Self {
        *self.fail_on_connect.lock() = Some(status);
        self
    }

    /// Fail the pre-flight check of every request with `reason`.
    pub fn rejecting(self, reason: &str) -> Self {
        *self.rejection.lock() = Some(reason.to_string());
        self
    }

    pub fn get_call_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<ChatCompletionRequest> {
        self.requests.lock().clone()
    }

    pub fn last_request(&self) -> Option<ChatCompletionRequest> {
        self.requests.lock().last().cloned()
    }

    /// Whether a stream handed out by this mock was dropped before it finished.
    pub fn stream_dropped(&self) -> bool {
        self.stream_dropped.load(Ordering::SeqCst)
    }

    fn record(&self, request: &ChatCompletionRequest) -> Result<()> {
        self.requests.lock().push(request.clone());
        match *self.fail_on_connect.lock() {
            Some(status) => Err(UpstreamError::Status {
                provider: "Mock",
                status,
                detail: "scripted failure".to_string(),
            }
            .into()),
            None => Ok(()),
        }
    }
}

impl Default for MockCompletionClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Sets the flag when a stream is dropped before reaching its end.
struct DropFlag {
    flag: Arc<AtomicBool>,
    finished: bool,
}

impl DropFlag {
    /// The stream reached its end; dropping it now is not an early drop.
    fn disarm(&mut self) {
        self.finished = true;
    }
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        if !self.finished {
            self.flag.store(true, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl CompletionService for MockCompletionClient {
    fn provider(&self) -> &'static str {
        "Mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    fn check(&self, _request: &ChatCompletionRequest) -> Result<()> {
        match self.rejection.lock().as_deref() {
            Some(reason) => Err(Error::malformed(reason)),
            None => Ok(()),
        }
    }

    async fn complete(&self, request: &ChatCompletionRequest) -> Result<CompletionResponse> {
        self.record(request)?;
        Ok(CompletionResponse {
            id: None,
            model: Some("mock-model".to_string()),
            content: self.response.lock().clone(),
            tool_calls: None,
            finish_reason: Some("stop".to_string()),
            usage: None,
        })
    }

    async fn complete_stream(&self, request: &ChatCompletionRequest) -> Result<ChunkStream> {
        self.record(request)?;

        let chunks = self.chunks.lock().clone();
        let fail_after = *self.fail_after.lock();
        let guard = DropFlag {
            flag: Arc::clone(&self.stream_dropped),
            finished: false,
        };

        let stream = stream::unfold((0usize, chunks, guard), move |state| async move {
            let (index, chunks, mut guard) = state;
            if fail_after == Some(index) {
                guard.disarm();
                let err = UpstreamError::Transport {
                    provider: "Mock",
                    detail: "connection reset".to_string(),
                };
                return Some((Err(err.into()), (usize::MAX, Vec::new(), guard)));
            }
            if index >= chunks.len() {
                guard.disarm();
                return None;
            }
            // Let cancellation tests observe the stream mid-flight.
            tokio::task::yield_now().await;
            let chunk = CompletionChunk::text(chunks[index].clone());
            Some((Ok(chunk), (index + 1, chunks, guard)))
        });

        Ok(stream.boxed())
    }
}
