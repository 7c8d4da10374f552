use super::client::{OpenAiHttpClient, PROVIDER};
use super::types::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, StreamOptions,
};
use crate::ai::types::{self, CompletionChunk, CompletionResponse};
use crate::ai::{fuse_on_error, sse, ChunkStream, CompletionService};
use crate::{Result, UpstreamError};
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

const COMPLETIONS_PATH: &str = "/chat/completions";

pub struct OpenAiCompletionClient {
    http: OpenAiHttpClient,
    model: String,
}

impl OpenAiCompletionClient {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Self {
        Self::new_with_client(api_key, model, timeout, reqwest::Client::new())
    }

    pub fn new_with_client(
        api_key: String,
        model: String,
        timeout: Duration,
        client: reqwest::Client,
    ) -> Self {
        Self {
            http: OpenAiHttpClient::new_with_client(api_key, timeout, client),
            model,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.http = self.http.with_base_url(base_url);
        self
    }

    fn upstream_request<'a>(
        &'a self,
        request: &'a types::ChatCompletionRequest,
        stream: bool,
    ) -> ChatCompletionRequest<'a> {
        ChatCompletionRequest {
            model: &self.model,
            messages: &request.messages,
            stream,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools: request.tools.as_ref(),
            tool_choice: request.tool_choice.as_ref(),
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }
}

fn parse_chunk(payload: &str) -> Result<CompletionChunk> {
    let chunk: ChatCompletionChunk = serde_json::from_str(payload).map_err(|e| {
        tracing::error!("Failed to parse OpenAI chunk: {}\nPayload: {}", e, payload);
        UpstreamError::Malformed {
            provider: PROVIDER,
            detail: e.to_string(),
        }
    })?;

    Ok(match chunk.choices.into_iter().next() {
        Some(choice) => CompletionChunk {
            content: choice.delta.content,
            tool_calls: choice.delta.tool_calls,
            finish_reason: choice.finish_reason,
            usage: chunk.usage,
        },
        None => CompletionChunk {
            usage: chunk.usage,
            ..CompletionChunk::default()
        },
    })
}

#[async_trait]
impl CompletionService for OpenAiCompletionClient {
    fn provider(&self) -> &'static str {
        PROVIDER
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: &types::ChatCompletionRequest) -> Result<CompletionResponse> {
        let body = self.upstream_request(request, false);
        let response: ChatCompletionResponse = self.http.post(COMPLETIONS_PATH, &body).await?;

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| UpstreamError::Malformed {
                provider: PROVIDER,
                detail: "response has no choices".to_string(),
            })?;

        Ok(CompletionResponse {
            id: response.id,
            model: response.model,
            content: choice.message.content.unwrap_or_default(),
            tool_calls: choice.message.tool_calls,
            finish_reason: choice.finish_reason,
            usage: response.usage,
        })
    }

    async fn complete_stream(&self, request: &types::ChatCompletionRequest) -> Result<ChunkStream> {
        let body = self.upstream_request(request, true);
        let response = self.http.post_stream(COMPLETIONS_PATH, &body).await?;

        let chunks = sse::data_events(response.bytes_stream(), PROVIDER)
            .take_while(|event| {
                let finished = matches!(event, Ok(data) if data.trim() == "[DONE]");
                futures::future::ready(!finished)
            })
            .map(|event| event.and_then(|data| parse_chunk(&data)))
            .filter(|chunk| futures::future::ready(!matches!(chunk, Ok(c) if c.is_empty())));

        Ok(fuse_on_error(chunks.boxed()))
    }
}
